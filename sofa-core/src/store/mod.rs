//! The persistence collaborator.
//!
//! Everything above this module talks to a database through
//! [`DocumentStore`]. Two implementations ship with the crate:
//!
//! - [`CouchDatabase`]: a CouchDB database over HTTP
//! - [`MemoryStore`]: an in-process store with CouchDB semantics, used by
//!   tests and for running resources without a server

mod connection;
mod couch;
mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::changes::{ChangeParams, ChangeStream};
use crate::error::Result;
use crate::tracker::Document;
use crate::view::{ViewParams, ViewResponse};

pub use connection::{ConnectionConfig, Credentials};
pub use couch::CouchDatabase;
pub use memory::{MapFn, MemoryStore, StoreCall};

/// Identity and new revision of a successfully written document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResponse {
    pub id: String,
    pub rev: String,
}

/// Result of invoking an update handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResponse {
    /// Revision written by the handler, when the server reports it.
    pub rev: Option<String>,
}

/// Operations against one named database.
#[async_trait]
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Database name.
    fn name(&self) -> &str;

    /// Creates the database. Succeeds when it already exists.
    async fn create(&self) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Document>;

    /// Writes a whole document.
    ///
    /// With `rev` the write is an update of that revision; without it the
    /// document must not exist yet. A missing `id` lets the server pick one.
    async fn save(
        &self,
        id: Option<&str>,
        rev: Option<&str>,
        document: &Document,
    ) -> Result<SaveResponse>;

    /// Deletes a document. Without `rev` the current revision is looked up.
    async fn remove(&self, id: &str, rev: Option<&str>) -> Result<()>;

    /// Runs the update handler `_design/<design>/_update/<handler>` on `id`
    /// with `fields` as the request body.
    async fn update(
        &self,
        design: &str,
        handler: &str,
        id: &str,
        fields: &Document,
    ) -> Result<UpdateResponse>;

    async fn query_view(
        &self,
        design: &str,
        view: &str,
        params: &ViewParams,
    ) -> Result<ViewResponse>;

    /// Opens a continuous change feed. Dropping the stream closes it.
    async fn changes(&self, params: &ChangeParams) -> Result<ChangeStream>;

    /// Current `_security` object (empty when never set).
    async fn security(&self) -> Result<Document>;

    async fn put_security(&self, security: &Document) -> Result<()>;
}

/// URL path segment for a document id.
///
/// Design document ids keep their slash; everything else is escaped.
pub(crate) fn doc_path(id: &str) -> String {
    match id.strip_prefix("_design/") {
        Some(name) => format!("_design/{}", urlencoding::encode(name)),
        None => urlencoding::encode(id).into_owned(),
    }
}
