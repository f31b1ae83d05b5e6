//! Resource classes and instances.
//!
//! A [`ResourceClass`] is built once from an immutable [`ResourceConfig`]:
//! initialization creates the database, pushes design and security documents
//! and hands back a shared handle. Instances ([`Resource`]) keep their fields
//! in a [`FieldTracker`] so that `update` sends only what changed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::cache::DocumentCache;
use crate::changes::{ChangeParams, ChangeStream};
use crate::design::{self, DesignParts, SecurityDocument, SyncReport, DEFAULT_NAMESPACE};
use crate::error::{Error, Result, ValidationError};
use crate::inflect::pluralize;
use crate::schema::{self, Schema};
use crate::store::{ConnectionConfig, CouchDatabase, DocumentStore};
use crate::tracker::{Document, FieldTracker};
use crate::validators::{Validator, ValidatorSet};
use crate::view::{self, ViewParams, ViewResult};

pub const ID: &str = "_id";
pub const REV: &str = "_rev";
pub const DOC_TYPE: &str = "doc_type";
pub const CREATION_DATE: &str = "creation_date";
pub const MODIFICATION_DATE: &str = "modification_date";

/// Everything a resource class is built from.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    doc_type: String,
    db_name: Option<String>,
    namespace: String,
    connection: ConnectionConfig,
    schema: Schema,
    validators: ValidatorSet,
    design: DesignParts,
    security: SecurityDocument,
}

impl ResourceConfig {
    pub fn new(doc_type: impl Into<String>) -> Self {
        Self {
            doc_type: doc_type.into(),
            db_name: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            connection: ConnectionConfig::default(),
            schema: Schema::new(),
            validators: ValidatorSet::builtin(),
            design: DesignParts::new(),
            security: SecurityDocument::default(),
        }
    }

    pub fn with_db_name(mut self, name: impl Into<String>) -> Self {
        self.db_name = Some(name.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Registers one more validator next to the built-ins.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validators.register(validator);
        self
    }

    /// Replaces the whole validator registry.
    pub fn with_validators(mut self, validators: ValidatorSet) -> Self {
        self.validators = validators;
        self
    }

    pub fn with_design(mut self, design: DesignParts) -> Self {
        self.design = design;
        self
    }

    pub fn with_security(mut self, security: SecurityDocument) -> Self {
        self.security = security;
        self
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    /// Configured database name, or the plural of the doc type.
    pub fn db_name(&self) -> String {
        self.db_name
            .clone()
            .unwrap_or_else(|| pluralize(&self.doc_type))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn design(&self) -> &DesignParts {
        &self.design
    }

    pub fn security(&self) -> &SecurityDocument {
        &self.security
    }

    /// Rejects configurations the server could never validate against.
    pub fn check(&self) -> Result<()> {
        if self.doc_type.trim().is_empty() {
            return Err(Error::Config("doc_type must not be empty".to_string()));
        }
        if self.namespace.trim().is_empty() {
            return Err(Error::Config("namespace must not be empty".to_string()));
        }
        if let Some(name) = self
            .schema
            .validator_names()
            .find(|name| self.validators.get(name).is_none())
        {
            return Err(Error::Config(format!(
                "schema for {} uses unknown validator '{}'",
                self.doc_type, name
            )));
        }
        if let Some((alias, target)) = self
            .schema
            .aliases()
            .find(|(_, target)| self.schema.alias_target(target).is_some())
        {
            return Err(Error::Config(format!(
                "alias '{}' points at another alias '{}'",
                alias, target
            )));
        }
        Ok(())
    }

    /// Design documents this class keeps in sync.
    pub fn design_documents(&self) -> Result<Vec<Document>> {
        let mut shared = design::shared_design(
            &self.namespace,
            &self.doc_type,
            &self.schema,
            &self.validators,
        )?;
        let class = design::class_design(
            &self.namespace,
            &self.doc_type,
            &self.design,
            &self.schema,
            &self.validators,
        )?;

        match class {
            Some(class) if class.get(ID) == shared.get(ID) => {
                design::deep_merge(&mut shared, &class);
                Ok(vec![shared])
            }
            Some(class) => Ok(vec![shared, class]),
            None => Ok(vec![shared]),
        }
    }
}

/// Handle to an initialized resource class.
#[derive(Debug)]
pub struct ResourceClass {
    config: ResourceConfig,
    db_name: String,
    store: Arc<dyn DocumentStore>,
    cache: DocumentCache,
    report: SyncReport,
}

impl ResourceClass {
    /// Connects to CouchDB as configured and initializes the class.
    pub async fn initialize(config: ResourceConfig) -> Result<Arc<Self>> {
        let store = CouchDatabase::new(config.connection(), config.db_name());
        Self::initialize_with_store(config, Arc::new(store)).await
    }

    /// Initializes the class on an existing store.
    ///
    /// Creates the database, then synchronizes design documents and the
    /// security object. The handle is returned only once all of that
    /// succeeded.
    pub async fn initialize_with_store(
        config: ResourceConfig,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Arc<Self>> {
        config.check()?;

        store.create().await?;
        let documents = config.design_documents()?;
        let report = design::synchronize(store.as_ref(), documents, config.security()).await?;

        tracing::info!(
            "initialized {} on {} ({} of {} documents written)",
            config.doc_type(),
            store.name(),
            report.writes(),
            report.len()
        );

        Ok(Arc::new(Self {
            db_name: store.name().to_string(),
            cache: DocumentCache::new(config.connection().cache),
            config,
            store,
            report,
        }))
    }

    pub fn doc_type(&self) -> &str {
        self.config.doc_type()
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn namespace(&self) -> &str {
        self.config.namespace()
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn schema(&self) -> &Schema {
        self.config.schema()
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    /// What initialization had to write.
    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    /// Runs the schema validator on `document`.
    pub fn validate(&self, document: &Document) -> Result<(), ValidationError> {
        schema::validate(document, self.config.schema(), self.config.validators())
    }

    /// Field an alias resolves to, or `field` itself.
    fn resolve<'a>(&'a self, field: &'a str) -> &'a str {
        self.config.schema().alias_target(field).unwrap_or(field)
    }

    fn tracker(&self) -> FieldTracker {
        FieldTracker::with_derived(self.config.schema().aliases().map(|(alias, _)| alias))
    }

    /// A fresh, unsaved instance. Every field starts unsynchronized.
    ///
    /// Aliased values land on their target field unless `fields` also names
    /// the target itself, in which case the target's value is kept.
    pub fn build(self: &Arc<Self>, fields: Document) -> Resource {
        let mut tracker = self.tracker();
        let (aliased, plain): (Vec<_>, Vec<_>) = fields
            .into_iter()
            .partition(|(field, _)| self.config.schema().alias_target(field).is_some());
        for (field, value) in plain.into_iter().chain(aliased) {
            let target = self.resolve(&field).to_string();
            tracker.track(&target, value, false);
        }
        tracker.set(DOC_TYPE, Value::String(self.doc_type().to_string()));

        Resource {
            class: Arc::clone(self),
            fields: tracker,
        }
    }

    /// An instance mirroring a persisted document.
    pub fn hydrate(self: &Arc<Self>, document: Document) -> Resource {
        let mut tracker = self.tracker();
        tracker.hydrate(document, true);
        Resource {
            class: Arc::clone(self),
            fields: tracker,
        }
    }

    /// Builds an instance and saves it.
    pub async fn create(self: &Arc<Self>, fields: Document) -> Result<Resource> {
        let mut resource = self.build(fields);
        resource.save().await?;
        Ok(resource)
    }

    /// Fetches one document, from the cache when it holds it.
    pub async fn get(self: &Arc<Self>, id: &str) -> Result<Resource> {
        if let Some(document) = self.cache.get(id) {
            tracing::debug!("cache hit for {}", id);
            return Ok(self.hydrate(document));
        }

        let document = self.store.get(id).await?;
        self.cache.insert(id, document.clone());
        Ok(self.hydrate(document))
    }

    /// Deletes a document by id at its current revision.
    pub async fn destroy(&self, id: &str) -> Result<()> {
        self.store.remove(id, None).await?;
        self.cache.evict(id);
        Ok(())
    }

    /// Every document, through the `all` view of the shared design document.
    pub async fn all(self: &Arc<Self>, params: &ViewParams) -> Result<ViewResult> {
        let path = format!("{}/all", self.namespace());
        self.view(&path, params).await
    }

    /// Queries `name` (in `_design/<doc_type>`) or `design/name`.
    pub async fn view(self: &Arc<Self>, path: &str, params: &ViewParams) -> Result<ViewResult> {
        self.view_with(path, params, &[Arc::clone(self)]).await
    }

    /// Like [`ResourceClass::view`], hydrating row `i` into
    /// `classes[i % classes.len()]`.
    pub async fn view_with(
        &self,
        path: &str,
        params: &ViewParams,
        classes: &[Arc<ResourceClass>],
    ) -> Result<ViewResult> {
        let (design, name) = view::resolve_path(path, self.doc_type())?;
        let response = self.store.query_view(design, name, params).await?;
        Ok(view::hydrate_rows(response, params.includes_docs(), classes))
    }

    /// Opens the database's continuous change feed.
    pub async fn changes(&self, params: &ChangeParams) -> Result<ChangeStream> {
        self.store.changes(params).await
    }

    /// Stamps timestamps and the doc type onto `fields` before a write.
    ///
    /// `modification_date` always moves forward, so it is part of every
    /// write even when two writes land in the same millisecond.
    fn prepare(&self, fields: &mut FieldTracker) {
        let now = Utc::now().timestamp_millis();
        if fields.get(CREATION_DATE).map_or(true, Value::is_null) {
            fields.set(CREATION_DATE, Value::from(now));
        }
        let modified = match fields.get(MODIFICATION_DATE).and_then(Value::as_i64) {
            Some(previous) => now.max(previous.saturating_add(1)),
            None => now,
        };
        fields.set(MODIFICATION_DATE, Value::from(modified));
        fields.set(DOC_TYPE, Value::String(self.doc_type().to_string()));
    }
}

/// Result of [`Persistable::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Nothing was dirty; no request was made.
    Unchanged,
    /// The listed fields were sent to the update handler.
    Updated {
        rev: Option<String>,
        fields: Vec<String>,
    },
}

/// Persistence lifecycle of an instance.
#[async_trait]
pub trait Persistable {
    /// Writes the whole document.
    async fn save(&mut self) -> Result<()>;

    /// Sends only unsynchronized fields through the update handler.
    async fn update(&mut self) -> Result<UpdateOutcome>;

    /// Deletes the persisted document. The instance keeps its values.
    async fn destroy(&mut self) -> Result<()>;

    /// Replaces every value with the persisted document.
    async fn reload(&mut self) -> Result<()>;
}

/// One document and the class it belongs to.
#[derive(Debug, Clone)]
pub struct Resource {
    class: Arc<ResourceClass>,
    fields: FieldTracker,
}

impl Resource {
    pub fn class(&self) -> &Arc<ResourceClass> {
        &self.class
    }

    pub fn id(&self) -> Option<&str> {
        self.fields.get(ID).and_then(Value::as_str)
    }

    pub fn rev(&self) -> Option<&str> {
        self.fields.get(REV).and_then(Value::as_str)
    }

    pub fn doc_type(&self) -> Option<&str> {
        self.fields.get(DOC_TYPE).and_then(Value::as_str)
    }

    /// Current value of a field. Aliases read their target.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(self.class.resolve(field))
    }

    /// Writes a field, returning the previous value. Aliases write their
    /// target; `doc_type` cannot be written.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<Option<Value>> {
        if field == DOC_TYPE {
            return Err(Error::ReadOnlyField(field.to_string()));
        }
        let target = self.class.resolve(field).to_string();
        Ok(self.fields.set(&target, value.into()))
    }

    pub fn is_synced(&self, field: &str) -> bool {
        self.fields.is_synced(self.class.resolve(field))
    }

    pub fn dirty_fields(&self) -> Vec<&str> {
        self.fields.dirty_fields()
    }

    pub fn fields(&self) -> &FieldTracker {
        &self.fields
    }

    pub fn to_document(&self) -> Document {
        self.fields.to_document()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.class.validate(&self.fields.to_document())
    }

    fn require_id(&self) -> Result<String> {
        self.id().map(str::to_string).ok_or(Error::MissingId)
    }
}

/// Unsynchronized fields an update sends. Identity travels in the URL.
fn pending(fields: &FieldTracker) -> Document {
    let mut diff = fields.diff();
    diff.remove(ID);
    diff.remove(REV);
    diff
}

#[async_trait]
impl Persistable for Resource {
    async fn save(&mut self) -> Result<()> {
        let class = Arc::clone(&self.class);
        let mut staged = self.fields.clone();
        class.prepare(&mut staged);

        let document = staged.to_document();
        class.validate(&document)?;

        let id = match self.id() {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().simple().to_string(),
        };
        let rev = self.rev().map(str::to_string);

        let saved = class.store.save(Some(&id), rev.as_deref(), &document).await?;

        staged.set(ID, Value::String(saved.id.clone()));
        staged.set(REV, Value::String(saved.rev.clone()));
        staged.resync();
        self.fields = staged;
        class.cache.refresh(&saved.id, self.fields.to_document());

        tracing::debug!("saved {} {} at {}", class.doc_type(), saved.id, saved.rev);
        Ok(())
    }

    async fn update(&mut self) -> Result<UpdateOutcome> {
        let id = self.require_id()?;
        if pending(&self.fields).is_empty() {
            tracing::debug!("{} has no changes", id);
            return Ok(UpdateOutcome::Unchanged);
        }

        let class = Arc::clone(&self.class);
        let mut staged = self.fields.clone();
        class.prepare(&mut staged);
        class.validate(&staged.to_document())?;

        let diff = pending(&staged);
        let response = class
            .store
            .update(class.namespace(), design::UPDATE_HANDLER, &id, &diff)
            .await?;

        match &response.rev {
            Some(rev) => {
                staged.set(REV, Value::String(rev.clone()));
            }
            None => tracing::warn!("update of {} returned no revision", id),
        }
        staged.resync();
        self.fields = staged;
        class.cache.refresh(&id, self.fields.to_document());

        tracing::debug!("updated {} fields of {}", diff.len(), id);
        Ok(UpdateOutcome::Updated {
            rev: response.rev,
            fields: diff.keys().cloned().collect(),
        })
    }

    async fn destroy(&mut self) -> Result<()> {
        let id = self.require_id()?;
        let rev = self.rev().map(str::to_string);

        self.class.store.remove(&id, rev.as_deref()).await?;
        self.class.cache.evict(&id);
        Ok(())
    }

    async fn reload(&mut self) -> Result<()> {
        let id = self.require_id()?;
        let document = self.class.store.get(&id).await?;

        self.class.cache.refresh(&id, document.clone());
        self.fields.hydrate(document, true);
        Ok(())
    }
}
