//! Continuous change feeds.
//!
//! CouchDB's `feed=continuous` answers with one JSON object per line and
//! sends bare newlines as heartbeats. Network chunks do not line up with
//! lines, so [`LineBuffer`] holds partial input until a terminator arrives.

use std::collections::BTreeMap;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::tracker::Document;

/// A stream of change events. Dropping it closes the underlying connection.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// Parameters for `_changes`. Values are sent as-is, not JSON-encoded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeParams {
    pub since: Option<String>,
    pub include_docs: bool,
    /// Heartbeat interval in milliseconds.
    pub heartbeat: Option<u64>,
    pub filter: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl ChangeParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, since: impl Into<String>) -> Self {
        self.since = Some(since.into());
        self
    }

    pub fn include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }

    pub fn heartbeat(mut self, millis: u64) -> Self {
        self.heartbeat = Some(millis);
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// Query-string pairs for a continuous feed.
    pub fn to_query(&self) -> Vec<(String, String)> {
        let mut query = vec![("feed".to_string(), "continuous".to_string())];
        if let Some(since) = &self.since {
            query.push(("since".to_string(), since.clone()));
        }
        if self.include_docs {
            query.push(("include_docs".to_string(), "true".to_string()));
        }
        if let Some(heartbeat) = self.heartbeat {
            query.push(("heartbeat".to_string(), heartbeat.to_string()));
        }
        if let Some(filter) = &self.filter {
            query.push(("filter".to_string(), filter.clone()));
        }
        for (name, value) in &self.extra {
            query.push((name.clone(), value.clone()));
        }
        query
    }
}

/// One line of a change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<ChangeRev>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
    /// Present only on the final line of a feed that ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

/// Splits a byte stream into newline-terminated JSON events.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<ChangeEvent>> {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes an unterminated trailing line when the feed ends.
    pub fn finish(&mut self) -> Option<Result<ChangeEvent>> {
        let line = std::mem::take(&mut self.pending);
        parse_line(&line)
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn parse_line(line: &[u8]) -> Option<Result<ChangeEvent>> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed).map_err(Error::from))
}

/// Turns a stream of byte chunks into a [`ChangeStream`].
pub fn decode<S, B, E>(chunks: S) -> ChangeStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    let mut buffer = LineBuffer::new();
    let mut finished = false;

    chunks
        .map(Some)
        .chain(stream::once(async { None }))
        .flat_map(move |chunk| {
            let events = match chunk {
                Some(Ok(bytes)) => buffer.push(bytes.as_ref()),
                Some(Err(e)) => {
                    finished = true;
                    vec![Err(e.into())]
                }
                None if finished => Vec::new(),
                None => buffer.finish().into_iter().collect(),
            };
            stream::iter(events)
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_lines_are_buffered() {
        let mut buffer = LineBuffer::new();

        let events = buffer.push(br#"{"seq":1,"id":"a","chan"#);
        assert!(events.is_empty());
        assert!(buffer.pending() > 0);

        let events = buffer.push(b"ges\":[{\"rev\":\"1-x\"}]}\n");
        assert_eq!(events.len(), 1);
        let event = events.into_iter().next().unwrap().unwrap();
        assert_eq!(event.id.as_deref(), Some("a"));
        assert_eq!(event.changes, vec![ChangeRev { rev: "1-x".to_string() }]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_several_events_in_one_chunk() {
        let mut buffer = LineBuffer::new();
        let events = buffer.push(b"{\"seq\":1,\"id\":\"a\"}\n\n{\"seq\":2,\"id\":\"b\",\"deleted\":true}\n{\"seq\":3");

        let ids: Vec<_> = events
            .into_iter()
            .map(|e| e.unwrap().id.unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(buffer.pending() > 0);
    }

    #[test]
    fn test_heartbeats_are_ignored() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"\n").is_empty());
        assert!(buffer.push(b"  \r\n").is_empty());
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let mut buffer = LineBuffer::new();
        let events = buffer.push(b"{not json}\n");
        assert!(matches!(events.as_slice(), [Err(Error::Json(_))]));
    }

    #[test]
    fn test_change_params_query() {
        let query = ChangeParams::new()
            .since("now")
            .include_docs(true)
            .heartbeat(30_000)
            .to_query();
        assert_eq!(
            query,
            vec![
                ("feed".to_string(), "continuous".to_string()),
                ("since".to_string(), "now".to_string()),
                ("include_docs".to_string(), "true".to_string()),
                ("heartbeat".to_string(), "30000".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_decode_stream() {
        let chunks: Vec<std::result::Result<Vec<u8>, Error>> = vec![
            Ok(b"{\"seq\":1,\"id\":\"a\",\"doc\":{\"_id\":\"a\"}}\n{\"se".to_vec()),
            Ok(b"q\":2,\"id\":\"b\"}\n".to_vec()),
            Ok(b"{\"last_seq\":2}".to_vec()),
        ];

        let events: Vec<ChangeEvent> = decode(stream::iter(chunks))
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].doc.as_ref().unwrap()["_id"], json!("a"));
        assert_eq!(events[1].seq, Some(json!(2)));
        assert_eq!(events[2].last_seq, Some(json!(2)));
    }
}
