//! View queries: parameters, raw responses and hydrated results.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::resource::{Resource, ResourceClass};

/// Query parameters for a view. Every value is sent JSON-encoded, so
/// `key("abc")` becomes `key="abc"` on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewParams {
    params: BTreeMap<String, Value>,
}

impl ViewParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn key(self, key: impl Into<Value>) -> Self {
        self.param("key", key)
    }

    pub fn start_key(self, key: impl Into<Value>) -> Self {
        self.param("startkey", key)
    }

    pub fn end_key(self, key: impl Into<Value>) -> Self {
        self.param("endkey", key)
    }

    pub fn limit(self, limit: u64) -> Self {
        self.param("limit", limit)
    }

    pub fn skip(self, skip: u64) -> Self {
        self.param("skip", skip)
    }

    pub fn descending(self, descending: bool) -> Self {
        self.param("descending", descending)
    }

    pub fn include_docs(self, include: bool) -> Self {
        self.param("include_docs", include)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn includes_docs(&self) -> bool {
        self.params
            .get("include_docs")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Query-string pairs with JSON-encoded values.
    pub fn to_query(&self) -> Vec<(String, String)> {
        self.params
            .iter()
            .map(|(name, value)| (name.clone(), value.to_string()))
            .collect()
    }
}

/// A view response as the server returns it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ViewResponse {
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub doc: Option<Value>,
}

/// A view result with rows hydrated into resources.
#[derive(Debug, Clone)]
pub struct ViewResult {
    pub total_rows: Option<u64>,
    pub offset: Option<u64>,
    pub rows: Vec<ViewRow>,
}

impl ViewResult {
    /// Hydrated resources, in row order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.rows.iter().filter_map(|row| row.resource.as_ref())
    }

    pub fn into_resources(self) -> Vec<Resource> {
        self.rows.into_iter().filter_map(|row| row.resource).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ViewRow {
    pub id: Option<String>,
    pub key: Value,
    pub value: Value,
    pub doc: Option<Value>,
    /// The row's document (`include_docs`) or value, when it is an object.
    pub resource: Option<Resource>,
}

/// Splits `name` or `design/name` into design document and view name.
pub(crate) fn resolve_path<'a>(path: &'a str, default_design: &'a str) -> Result<(&'a str, &'a str)> {
    let parts: Vec<&str> = path.split('/').collect();
    match parts.as_slice() {
        [view] if !view.is_empty() => Ok((default_design, *view)),
        [design, view] if !design.is_empty() && !view.is_empty() => Ok((*design, *view)),
        _ => Err(Error::Config(format!("invalid view path '{}'", path))),
    }
}

/// Hydrates each row into `classes[index % classes.len()]`.
pub(crate) fn hydrate_rows(
    response: ViewResponse,
    include_docs: bool,
    classes: &[Arc<ResourceClass>],
) -> ViewResult {
    let rows = response
        .rows
        .into_iter()
        .enumerate()
        .map(|(index, row)| {
            let payload = if include_docs {
                row.doc.as_ref()
            } else {
                Some(&row.value)
            };
            let resource = match (payload, classes.is_empty()) {
                (Some(Value::Object(document)), false) => {
                    let class = &classes[index % classes.len()];
                    Some(class.hydrate(document.clone()))
                }
                _ => None,
            };
            ViewRow {
                id: row.id,
                key: row.key,
                value: row.value,
                doc: row.doc,
                resource,
            }
        })
        .collect();

    ViewResult {
        total_rows: response.total_rows,
        offset: response.offset,
        rows,
    }
}
