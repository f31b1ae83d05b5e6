//! Sofa Core Library
//!
//! Resource mapping for CouchDB: per-field dirty tracking, schema validation
//! mirrored into `validate_doc_update`, design document synchronization and
//! the save/update/destroy/reload lifecycle.

pub mod cache;
pub mod changes;
pub mod design;
pub mod error;
pub mod inflect;
pub mod resource;
pub mod schema;
pub mod store;
pub mod tracker;
pub mod validators;
pub mod view;

pub use cache::DocumentCache;
pub use changes::{ChangeEvent, ChangeParams, ChangeStream};
pub use design::{DesignParts, SecurityDocument, SyncOutcome, SyncReport, ViewDef};
pub use error::{Error, Result, ValidationError};
pub use resource::{Persistable, Resource, ResourceClass, ResourceConfig, UpdateOutcome};
pub use schema::{validate, FieldRule, Rule, Schema};
pub use store::{ConnectionConfig, CouchDatabase, DocumentStore, MemoryStore};
pub use tracker::{Document, FieldTracker};
pub use validators::{Validator, ValidatorSet};
pub use view::{ViewParams, ViewResult, ViewRow};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
