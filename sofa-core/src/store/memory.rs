//! An in-process [`DocumentStore`] with CouchDB semantics.
//!
//! Revisions are `<generation>-<digest>` and must match on every write,
//! `_design/*/_update/in_place` merges fields the way the shipped handler
//! does, the `all` view exists in every design document and the change log
//! can be followed live. Every call is recorded so tests can assert on the
//! exact traffic a resource produced.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use super::{DocumentStore, SaveResponse, UpdateResponse};
use crate::changes::{ChangeEvent, ChangeParams, ChangeRev, ChangeStream};
use crate::error::{Error, Result};
use crate::tracker::Document;
use crate::view::{RawRow, ViewParams, ViewResponse};

/// Map function for a custom view: emits `(key, value)` pairs per document.
pub type MapFn = Arc<dyn Fn(&Document) -> Vec<(Value, Value)> + Send + Sync>;

/// A call made against a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Create,
    Get(String),
    Save(String),
    Remove(String),
    Update { id: String, fields: Document },
    QueryView { design: String, view: String },
    Changes,
    Security,
    PutSecurity,
}

#[derive(Default)]
struct State {
    exists: bool,
    docs: BTreeMap<String, Document>,
    security: Document,
    seq: u64,
    log: Vec<ChangeEvent>,
    views: BTreeMap<(String, String), MapFn>,
    failing_gets: BTreeMap<String, u16>,
    calls: Vec<StoreCall>,
}

pub struct MemoryStore {
    name: String,
    state: Mutex<State>,
    live: broadcast::Sender<ChangeEvent>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
            live,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a view `_design/<design>/_view/<view>`.
    pub fn with_view<F>(self, design: &str, view: &str, map: F) -> Self
    where
        F: Fn(&Document) -> Vec<(Value, Value)> + Send + Sync + 'static,
    {
        self.state()
            .views
            .insert((design.to_string(), view.to_string()), Arc::new(map));
        self
    }

    /// Makes every `get` of `id` fail with a server error of `status`.
    pub fn fail_gets(&self, id: &str, status: u16) {
        self.state().failing_gets.insert(id.to_string(), status);
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Number of writes (save, update, remove, put_security) recorded.
    pub fn write_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| {
                matches!(
                    call,
                    StoreCall::Save(_)
                        | StoreCall::Update { .. }
                        | StoreCall::Remove(_)
                        | StoreCall::PutSecurity
                )
            })
            .count()
    }

    /// Stored document, bypassing call recording.
    pub fn peek(&self, id: &str) -> Option<Document> {
        self.state().docs.get(id).cloned()
    }

    /// Writes a document as another client would, bumping its revision.
    pub fn put_external(&self, id: &str, document: Document) -> String {
        let mut state = self.state();
        let generation = state
            .docs
            .get(id)
            .map(|doc| generation(doc) + 1)
            .unwrap_or(1);
        self.commit(&mut state, id, document, generation)
    }

    pub fn exists(&self) -> bool {
        self.state().exists
    }

    fn commit(&self, state: &mut State, id: &str, mut document: Document, generation: u64) -> String {
        document.insert("_id".to_string(), Value::String(id.to_string()));
        document.remove("_rev");
        let rev = revision(generation, &document);
        document.insert("_rev".to_string(), Value::String(rev.clone()));
        state.docs.insert(id.to_string(), document.clone());
        self.record_change(state, id, &rev, false, Some(document));
        rev
    }

    fn record_change(&self, state: &mut State, id: &str, rev: &str, deleted: bool, doc: Option<Document>) {
        state.seq += 1;
        let event = ChangeEvent {
            seq: Some(Value::from(state.seq)),
            id: Some(id.to_string()),
            changes: vec![ChangeRev {
                rev: rev.to_string(),
            }],
            deleted,
            doc,
            last_seq: None,
        };
        state.log.push(event.clone());
        // No receivers is fine.
        let _ = self.live.send(event);
    }
}

fn generation(document: &Document) -> u64 {
    document
        .get("_rev")
        .and_then(Value::as_str)
        .and_then(|rev| rev.split('-').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn revision(generation: u64, document: &Document) -> String {
    let body = serde_json::to_vec(document).unwrap_or_default();
    let digest = format!("{:x}", Sha256::digest(&body));
    format!("{}-{}", generation, &digest[..32])
}

fn strip_event_doc(mut event: ChangeEvent, include_docs: bool) -> ChangeEvent {
    if !include_docs {
        event.doc = None;
    }
    event
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self) -> Result<()> {
        let mut state = self.state();
        state.calls.push(StoreCall::Create);
        state.exists = true;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Document> {
        let mut state = self.state();
        state.calls.push(StoreCall::Get(id.to_string()));
        if let Some(status) = state.failing_gets.get(id) {
            return Err(Error::from_couch(*status, id, "internal_server_error", "injected failure"));
        }
        state
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn save(
        &self,
        id: Option<&str>,
        rev: Option<&str>,
        document: &Document,
    ) -> Result<SaveResponse> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let mut state = self.state();
        state.calls.push(StoreCall::Save(id.clone()));

        let current = state
            .docs
            .get(&id)
            .and_then(|doc| doc.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if current.as_deref() != rev {
            return Err(Error::Conflict(id));
        }

        let next = rev
            .and_then(|r| r.split('-').next())
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let rev = self.commit(&mut state, &id, document.clone(), next);
        Ok(SaveResponse { id, rev })
    }

    async fn remove(&self, id: &str, rev: Option<&str>) -> Result<()> {
        let mut state = self.state();
        state.calls.push(StoreCall::Remove(id.to_string()));

        let current = state
            .docs
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let generation = generation(current);
        if let Some(rev) = rev {
            if current.get("_rev").and_then(Value::as_str) != Some(rev) {
                return Err(Error::Conflict(id.to_string()));
            }
        }

        state.docs.remove(id);
        let mut tombstone = Document::new();
        tombstone.insert("_deleted".to_string(), Value::Bool(true));
        let rev = revision(generation + 1, &tombstone);
        self.record_change(&mut state, id, &rev, true, None);
        Ok(())
    }

    async fn update(
        &self,
        design: &str,
        handler: &str,
        id: &str,
        fields: &Document,
    ) -> Result<UpdateResponse> {
        let mut state = self.state();
        state.calls.push(StoreCall::Update {
            id: id.to_string(),
            fields: fields.clone(),
        });

        if handler != "in_place" {
            return Err(Error::NotFound(format!(
                "_design/{}/_update/{}",
                design, handler
            )));
        }

        let (mut document, generation) = match state.docs.get(id) {
            Some(doc) => (doc.clone(), generation(doc) + 1),
            None => (Document::new(), 1),
        };
        for (key, value) in fields {
            if key != "_id" && key != "_rev" {
                document.insert(key.clone(), value.clone());
            }
        }
        let rev = self.commit(&mut state, id, document, generation);
        Ok(UpdateResponse { rev: Some(rev) })
    }

    async fn query_view(
        &self,
        design: &str,
        view: &str,
        params: &ViewParams,
    ) -> Result<ViewResponse> {
        let mut state = self.state();
        state.calls.push(StoreCall::QueryView {
            design: design.to_string(),
            view: view.to_string(),
        });

        let map = state
            .views
            .get(&(design.to_string(), view.to_string()))
            .cloned();
        let map: MapFn = match (map, view) {
            (Some(map), _) => map,
            (None, "all") => Arc::new(|doc: &Document| {
                let id = doc.get("_id").cloned().unwrap_or(Value::Null);
                vec![(id, Value::Object(doc.clone()))]
            }),
            (None, _) => {
                return Err(Error::NotFound(format!(
                    "_design/{}/_view/{}",
                    design, view
                )))
            }
        };

        let mut rows: Vec<RawRow> = Vec::new();
        for (id, doc) in state.docs.iter().filter(|(id, _)| !id.starts_with("_design/")) {
            for (key, value) in map(doc) {
                rows.push(RawRow {
                    id: Some(id.clone()),
                    key,
                    value,
                    doc: params.includes_docs().then(|| Value::Object(doc.clone())),
                });
            }
        }

        if let Some(key) = params.get("key") {
            rows.retain(|row| &row.key == key);
        }
        if params.get("descending").and_then(Value::as_bool) == Some(true) {
            rows.reverse();
        }
        let total_rows = rows.len() as u64;
        let skip = params.get("skip").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(usize::MAX);
        let rows = rows.into_iter().skip(skip).take(limit).collect();

        Ok(ViewResponse {
            total_rows: Some(total_rows),
            offset: Some(skip as u64),
            rows,
        })
    }

    async fn changes(&self, params: &ChangeParams) -> Result<ChangeStream> {
        let mut state = self.state();
        state.calls.push(StoreCall::Changes);

        let since = match params.since.as_deref() {
            Some("now") => state.seq,
            Some(seq) => seq.parse().unwrap_or(0),
            None => 0,
        };
        let include_docs = params.include_docs;

        // Subscribe before snapshotting so no change falls in between.
        let receiver = self.live.subscribe();
        let backlog: Vec<Result<ChangeEvent>> = state
            .log
            .iter()
            .filter(|event| event.seq.as_ref().and_then(Value::as_u64).unwrap_or(0) > since)
            .cloned()
            .map(|event| Ok(strip_event_doc(event, include_docs)))
            .collect();

        let live = stream::unfold(receiver, move |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((Ok(strip_event_doc(event, include_docs)), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("change feed lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::iter(backlog).chain(live).boxed())
    }

    async fn security(&self) -> Result<Document> {
        let mut state = self.state();
        state.calls.push(StoreCall::Security);
        Ok(state.security.clone())
    }

    async fn put_security(&self, security: &Document) -> Result<()> {
        let mut state = self.state();
        state.calls.push(StoreCall::PutSecurity);
        state.security = security.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = MemoryStore::new("things");
        let saved = store
            .save(Some("a"), None, &doc(json!({"n": 1})))
            .await
            .unwrap();
        assert!(saved.rev.starts_with("1-"));

        let fetched = store.get("a").await.unwrap();
        assert_eq!(fetched["n"], json!(1));
        assert_eq!(fetched["_rev"], json!(saved.rev));
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let store = MemoryStore::new("things");
        let first = store.save(Some("a"), None, &doc(json!({}))).await.unwrap();
        store
            .save(Some("a"), Some(&first.rev), &doc(json!({"n": 2})))
            .await
            .unwrap();

        let err = store
            .save(Some("a"), Some(&first.rev), &doc(json!({"n": 3})))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let err = store.save(Some("a"), None, &doc(json!({}))).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_in_place_update_merges() {
        let store = MemoryStore::new("things");
        store.put_external("a", doc(json!({"x": 1, "y": 2})));

        let response = store
            .update("sofa", "in_place", "a", &doc(json!({"y": 3, "_rev": "bogus"})))
            .await
            .unwrap();

        let stored = store.peek("a").unwrap();
        assert_eq!(stored["x"], json!(1));
        assert_eq!(stored["y"], json!(3));
        assert_eq!(stored["_rev"], json!(response.rev.unwrap()));
        assert!(stored["_rev"].as_str().unwrap().starts_with("2-"));
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStore::new("things");
        let rev = store.put_external("a", doc(json!({})));

        assert!(store.remove("a", Some("1-wrong")).await.unwrap_err().is_conflict());
        store.remove("a", Some(&rev)).await.unwrap();
        assert!(store.get("a").await.unwrap_err().is_not_found());
        assert!(store.remove("a", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_all_view_and_params() {
        let store = MemoryStore::new("things");
        store.put_external("a", doc(json!({"n": 1})));
        store.put_external("b", doc(json!({"n": 2})));
        store.put_external("_design/sofa", doc(json!({})));

        let all = store
            .query_view("sofa", "all", &ViewParams::new())
            .await
            .unwrap();
        assert_eq!(all.rows.len(), 2);
        assert_eq!(all.rows[0].key, json!("a"));

        let one = store
            .query_view("sofa", "all", &ViewParams::new().key("b").include_docs(true))
            .await
            .unwrap();
        assert_eq!(one.rows.len(), 1);
        assert_eq!(one.rows[0].doc.as_ref().unwrap()["n"], json!(2));

        let err = store
            .query_view("sofa", "missing", &ViewParams::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_changes_replays_then_follows() {
        let store = MemoryStore::new("things");
        store.put_external("a", doc(json!({})));

        let mut feed = store
            .changes(&ChangeParams::new().include_docs(true))
            .await
            .unwrap();
        let first = feed.next().await.unwrap().unwrap();
        assert_eq!(first.id.as_deref(), Some("a"));
        assert!(first.doc.is_some());

        store.put_external("b", doc(json!({})));
        let second = feed.next().await.unwrap().unwrap();
        assert_eq!(second.id.as_deref(), Some("b"));
        assert_eq!(second.seq, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_calls_are_recorded() {
        let store = MemoryStore::new("things");
        store.create().await.unwrap();
        let _ = store.get("missing").await;
        store.put_security(&doc(json!({"admins": {}}))).await.unwrap();

        assert_eq!(
            store.calls(),
            vec![
                StoreCall::Create,
                StoreCall::Get("missing".to_string()),
                StoreCall::PutSecurity,
            ]
        );
        assert_eq!(store.write_count(), 1);
        assert!(store.exists());
    }
}
