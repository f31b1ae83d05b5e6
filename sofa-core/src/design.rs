//! Design and security document synchronization.
//!
//! On initialization every resource class pushes the documents it depends on:
//! the shared `_design/<namespace>` document (the `all` view, the `in_place`
//! update handler, `validate_doc_update` and the namespace block carrying
//! validators and schema) and, when it declares any, `_design/<doc_type>`
//! with its own views, updates, shows and lists. Each is merged onto what the
//! server already has and written only if the merge changed something.

use std::collections::BTreeMap;
use std::fmt;

use futures::future;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::store::DocumentStore;
use crate::tracker::Document;
use crate::validators::ValidatorSet;

pub const DEFAULT_NAMESPACE: &str = "sofa";

/// Name of the update handler used for partial updates.
pub const UPDATE_HANDLER: &str = "in_place";

/// Id under which the security object is reported.
pub const SECURITY_ID: &str = "_security";

const VALIDATE_DOC_UPDATE: &str = include_str!("js/validate_doc_update.js");
const IN_PLACE: &str = include_str!("js/in_place.js");
const ALL_MAP: &str = include_str!("js/all_map.js");
const NAMESPACE_PLACEHOLDER: &str = "__NAMESPACE__";

/// A view: JavaScript map function and optional reduce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewDef {
    pub map: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

/// Functions a resource class contributes to `_design/<doc_type>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignParts {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub views: BTreeMap<String, ViewDef>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub updates: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub shows: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, String>,
}

impl DesignParts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(mut self, name: impl Into<String>, map: impl Into<String>) -> Self {
        self.views.insert(
            name.into(),
            ViewDef {
                map: map.into(),
                reduce: None,
            },
        );
        self
    }

    pub fn view_with_reduce(
        mut self,
        name: impl Into<String>,
        map: impl Into<String>,
        reduce: impl Into<String>,
    ) -> Self {
        self.views.insert(
            name.into(),
            ViewDef {
                map: map.into(),
                reduce: Some(reduce.into()),
            },
        );
        self
    }

    pub fn update(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.updates.insert(name.into(), source.into());
        self
    }

    pub fn show(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.shows.insert(name.into(), source.into());
        self
    }

    pub fn list(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.lists.insert(name.into(), source.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
            && self.updates.is_empty()
            && self.shows.is_empty()
            && self.lists.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Members {
    pub names: Vec<String>,
    pub roles: Vec<String>,
}

impl Members {
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            roles: Vec::new(),
        }
    }
}

/// The database `_security` object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityDocument {
    pub admins: Members,
    pub readers: Members,
}

impl Default for SecurityDocument {
    fn default() -> Self {
        Self {
            admins: Members::names(["admin"]),
            readers: Members::names(["admin"]),
        }
    }
}

/// What synchronizing one document did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Created,
    Updated,
    Unchanged,
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Created => write!(f, "created"),
            SyncOutcome::Updated => write!(f, "updated"),
            SyncOutcome::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Per-document outcome of a synchronization run, in document order with
/// the security object last.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    entries: Vec<(String, SyncOutcome)>,
}

impl SyncReport {
    pub fn push(&mut self, id: impl Into<String>, outcome: SyncOutcome) {
        self.entries.push((id.into(), outcome));
    }

    pub fn outcome(&self, id: &str) -> Option<SyncOutcome> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == id)
            .map(|(_, outcome)| *outcome)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, SyncOutcome)> {
        self.entries.iter().map(|(id, outcome)| (id.as_str(), *outcome))
    }

    /// Number of documents that had to be written.
    pub fn writes(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, outcome)| *outcome != SyncOutcome::Unchanged)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Merges `source` into `target`. Nested objects merge recursively; any
/// other value in `source` overwrites the one in `target`.
pub fn deep_merge(target: &mut Document, source: &Document) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

pub fn design_id(name: &str) -> String {
    format!("_design/{}", name)
}

/// The namespace block: validators and the schema of `doc_type`, each as a
/// CommonJS module so `validate_doc_update` can `require` them.
pub fn namespace_block(doc_type: &str, schema: &Schema, validators: &ValidatorSet) -> Result<Value> {
    let modules: Document = validators
        .iter()
        .map(|v| {
            (
                v.name().to_string(),
                Value::String(format!("module.exports = {}", v.source().trim())),
            )
        })
        .collect();

    let mut schemas = Document::new();
    schemas.insert(
        doc_type.to_string(),
        Value::String(format!("module.exports = {}", serde_json::to_string(schema)?)),
    );

    let mut block = Document::new();
    block.insert("validators".to_string(), Value::Object(modules));
    block.insert("schema".to_string(), Value::Object(schemas));
    Ok(Value::Object(block))
}

/// `_design/<namespace>` with the defaults every class relies on.
pub fn shared_design(
    namespace: &str,
    doc_type: &str,
    schema: &Schema,
    validators: &ValidatorSet,
) -> Result<Document> {
    let parts = DesignParts::new()
        .view("all", ALL_MAP.trim())
        .update(UPDATE_HANDLER, IN_PLACE.trim());

    let mut document = to_document(&parts)?;
    document.insert("_id".to_string(), Value::String(design_id(namespace)));
    document.insert("language".to_string(), Value::from("javascript"));
    document.insert(
        "validate_doc_update".to_string(),
        Value::String(VALIDATE_DOC_UPDATE.trim().replace(NAMESPACE_PLACEHOLDER, namespace)),
    );
    document.insert(
        namespace.to_string(),
        namespace_block(doc_type, schema, validators)?,
    );
    Ok(document)
}

/// `_design/<doc_type>`, or `None` when the class declares nothing.
pub fn class_design(
    namespace: &str,
    doc_type: &str,
    parts: &DesignParts,
    schema: &Schema,
    validators: &ValidatorSet,
) -> Result<Option<Document>> {
    if parts.is_empty() {
        return Ok(None);
    }

    let mut document = to_document(parts)?;
    document.insert("_id".to_string(), Value::String(design_id(doc_type)));
    document.insert("language".to_string(), Value::from("javascript"));
    document.insert(
        namespace.to_string(),
        namespace_block(doc_type, schema, validators)?,
    );
    Ok(Some(document))
}

pub(crate) fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(document) => Ok(document),
        other => Err(Error::Config(format!("expected a JSON object, got {}", other))),
    }
}

/// Brings one design document up to date.
pub async fn sync_document(
    store: &dyn DocumentStore,
    generated: Document,
) -> Result<(String, SyncOutcome)> {
    let id = generated
        .get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Config("design document without _id".to_string()))?;

    let (persisted, exists) = match store.get(&id).await {
        Ok(document) => (document, true),
        Err(e) if e.is_not_found() => (Document::new(), false),
        Err(e) => return Err(e),
    };

    let mut merged = persisted.clone();
    deep_merge(&mut merged, &generated);

    if exists && merged == persisted {
        tracing::debug!("{} is up to date", id);
        return Ok((id, SyncOutcome::Unchanged));
    }

    let rev = merged
        .get("_rev")
        .and_then(Value::as_str)
        .map(str::to_string);
    let saved = store.save(Some(&id), rev.as_deref(), &merged).await?;

    let outcome = if exists {
        SyncOutcome::Updated
    } else {
        SyncOutcome::Created
    };
    tracing::info!("{} {} in {} (rev {})", id, outcome, store.name(), saved.rev);
    Ok((id, outcome))
}

/// Brings the database `_security` object up to date.
pub async fn sync_security(
    store: &dyn DocumentStore,
    security: &SecurityDocument,
) -> Result<SyncOutcome> {
    let persisted = store.security().await?;

    let mut merged = persisted.clone();
    deep_merge(&mut merged, &to_document(security)?);

    if merged == persisted {
        tracing::debug!("_security of {} is up to date", store.name());
        return Ok(SyncOutcome::Unchanged);
    }

    store.put_security(&merged).await?;
    let outcome = if persisted.is_empty() {
        SyncOutcome::Created
    } else {
        SyncOutcome::Updated
    };
    tracing::info!("_security {} in {}", outcome, store.name());
    Ok(outcome)
}

/// Synchronizes all design documents and the security object concurrently.
pub async fn synchronize(
    store: &dyn DocumentStore,
    documents: Vec<Document>,
    security: &SecurityDocument,
) -> Result<SyncReport> {
    let designs = future::try_join_all(
        documents
            .into_iter()
            .map(|document| sync_document(store, document)),
    );
    let (designs, security) = futures::try_join!(designs, sync_security(store, security))?;

    let mut report = SyncReport::default();
    for (id, outcome) in designs {
        report.push(id, outcome);
    }
    report.push(SECURITY_ID, security);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldRule;
    use crate::store::{MemoryStore, StoreCall};
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn user_schema() -> Schema {
        Schema::new()
            .field("name", "non_empty")
            .field("code", FieldRule::default().with_prefix("USR-"))
    }

    #[test]
    fn test_deep_merge_overwrites_and_preserves() {
        let mut target = doc(json!({
            "_rev": "3-abc",
            "views": {"old": {"map": "x"}, "all": {"map": "stale"}},
            "keep": 1
        }));
        let source = doc(json!({
            "views": {"all": {"map": "fresh"}},
            "keep": 2
        }));

        deep_merge(&mut target, &source);

        assert_eq!(
            target,
            doc(json!({
                "_rev": "3-abc",
                "views": {"old": {"map": "x"}, "all": {"map": "fresh"}},
                "keep": 2
            }))
        );
    }

    #[test]
    fn test_shared_design_contents() {
        let document =
            shared_design("sofa", "user", &user_schema(), &ValidatorSet::builtin()).unwrap();

        assert_eq!(document["_id"], json!("_design/sofa"));
        assert!(document["views"]["all"]["map"]
            .as_str()
            .unwrap()
            .contains("emit(doc._id, doc)"));
        assert!(document["updates"]["in_place"].is_string());

        let vdu = document["validate_doc_update"].as_str().unwrap();
        assert!(vdu.contains("require('sofa/schema/'"));
        assert!(!vdu.contains(NAMESPACE_PLACEHOLDER));

        let block = &document["sofa"];
        assert!(block["validators"]["email"]
            .as_str()
            .unwrap()
            .starts_with("module.exports = "));
        let schema = block["schema"]["user"].as_str().unwrap();
        assert!(schema.starts_with("module.exports = {"));
        assert!(schema.contains("\"prefix\":\"USR-\""));
    }

    #[test]
    fn test_class_design_only_when_declared() {
        let validators = ValidatorSet::builtin();
        assert!(class_design("sofa", "user", &DesignParts::new(), &user_schema(), &validators)
            .unwrap()
            .is_none());

        let parts = DesignParts::new().view("by_name", "function (doc) { emit(doc.name, null); }");
        let document = class_design("sofa", "user", &parts, &user_schema(), &validators)
            .unwrap()
            .unwrap();
        assert_eq!(document["_id"], json!("_design/user"));
        assert!(document["views"]["by_name"]["map"].is_string());
        assert!(document.get("shows").is_none());
        assert!(document["sofa"]["schema"]["user"].is_string());
    }

    #[tokio::test]
    async fn test_sync_creates_then_is_idempotent() {
        let store = MemoryStore::new("users");
        let generated =
            shared_design("sofa", "user", &user_schema(), &ValidatorSet::builtin()).unwrap();

        let (_, first) = sync_document(&store, generated.clone()).await.unwrap();
        assert_eq!(first, SyncOutcome::Created);

        store.clear_calls();
        let (_, second) = sync_document(&store, generated).await.unwrap();
        assert_eq!(second, SyncOutcome::Unchanged);
        assert_eq!(
            store.calls(),
            vec![StoreCall::Get("_design/sofa".to_string())]
        );
    }

    #[tokio::test]
    async fn test_sync_keeps_foreign_keys_and_updates_with_rev() {
        let store = MemoryStore::new("users");
        store.put_external(
            "_design/sofa",
            doc(json!({"views": {"legacy": {"map": "function (doc) {}"}}})),
        );
        let generated =
            shared_design("sofa", "user", &user_schema(), &ValidatorSet::builtin()).unwrap();

        let (_, outcome) = sync_document(&store, generated).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Updated);

        let stored = store.peek("_design/sofa").unwrap();
        assert!(stored["views"]["legacy"].is_object());
        assert!(stored["views"]["all"].is_object());
        assert!(stored["_rev"].as_str().unwrap().starts_with("2-"));
    }

    #[tokio::test]
    async fn test_sync_aborts_on_other_errors() {
        let store = MemoryStore::new("users");
        store.fail_gets("_design/sofa", 500);
        let generated =
            shared_design("sofa", "user", &user_schema(), &ValidatorSet::builtin()).unwrap();

        let err = sync_document(&store, generated).await.unwrap_err();
        assert!(matches!(err, Error::Server { status: 500, .. }));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_security_written_once() {
        let store = MemoryStore::new("users");
        let security = SecurityDocument::default();

        assert_eq!(
            sync_security(&store, &security).await.unwrap(),
            SyncOutcome::Created
        );
        assert_eq!(
            sync_security(&store, &security).await.unwrap(),
            SyncOutcome::Unchanged
        );
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_synchronize_report() {
        let store = MemoryStore::new("users");
        let validators = ValidatorSet::builtin();
        let parts = DesignParts::new().view("by_name", "function (doc) { emit(doc.name, null); }");
        let documents = vec![
            shared_design("sofa", "user", &user_schema(), &validators).unwrap(),
            class_design("sofa", "user", &parts, &user_schema(), &validators)
                .unwrap()
                .unwrap(),
        ];

        let report = synchronize(&store, documents.clone(), &SecurityDocument::default())
            .await
            .unwrap();
        assert_eq!(report.len(), 3);
        assert_eq!(report.writes(), 3);
        assert_eq!(report.outcome("_design/user"), Some(SyncOutcome::Created));

        let report = synchronize(&store, documents, &SecurityDocument::default())
            .await
            .unwrap();
        assert_eq!(report.writes(), 0);
        assert_eq!(report.outcome(SECURITY_ID), Some(SyncOutcome::Unchanged));
    }
}
