//! CouchDB over HTTP.

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use super::{doc_path, ConnectionConfig, DocumentStore, SaveResponse, UpdateResponse};
use crate::changes::{self, ChangeParams, ChangeStream};
use crate::error::{Error, Result};
use crate::tracker::Document;
use crate::view::{ViewParams, ViewResponse};

/// Header carrying the revision written by an update handler.
const NEW_REV_HEADER: &str = "X-Couch-Update-NewRev";

#[derive(Debug, Deserialize)]
struct CouchErrorBody {
    error: String,
    #[serde(default)]
    reason: String,
}

/// A database on a CouchDB server.
#[derive(Debug, Clone)]
pub struct CouchDatabase {
    client: reqwest::Client,
    base_url: String,
    name: String,
    /// Pre-computed `Authorization` header value.
    authorization: Option<String>,
}

impl CouchDatabase {
    pub fn new(config: &ConnectionConfig, name: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), config, name)
    }

    /// Shares an existing HTTP client (and its connection pool).
    pub fn with_client(
        client: reqwest::Client,
        config: &ConnectionConfig,
        name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: config.base_url(),
            name: name.into(),
            authorization: config.authorization(),
        }
    }

    /// URL of a path inside this database.
    fn url(&self, path: &str) -> String {
        let db = urlencoding::encode(&self.name);
        if path.is_empty() {
            format!("{}/{}", self.base_url, db)
        } else {
            format!("{}/{}/{}", self.base_url, db, path)
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = self.url(path);
        tracing::debug!("{} {}", method, url);

        let builder = self.client.request(method, url);
        match &self.authorization {
            Some(auth) => builder.header(reqwest::header::AUTHORIZATION, auth),
            None => builder,
        }
    }

    /// Passes successful responses through and maps error bodies to kinds.
    async fn check(id: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let (error, reason) = match serde_json::from_str::<CouchErrorBody>(&body) {
            Ok(parsed) => (parsed.error, parsed.reason),
            Err(_) => (
                status.canonical_reason().unwrap_or("unknown").to_string(),
                body,
            ),
        };
        Err(Error::from_couch(status.as_u16(), id, &error, &reason))
    }

    /// Current revision of `id`, from the `ETag` of a `HEAD` request.
    async fn current_rev(&self, id: &str) -> Result<String> {
        let response = self.request(Method::HEAD, &doc_path(id)).send().await?;
        let response = Self::check(id, response).await?;
        response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|etag| etag.trim_matches('"').to_string())
            .ok_or_else(|| Error::Server {
                status: response.status().as_u16(),
                error: "missing_etag".to_string(),
                reason: format!("no ETag returned for {}", id),
            })
    }
}

#[async_trait]
impl DocumentStore for CouchDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self) -> Result<()> {
        let response = self.request(Method::PUT, "").send().await?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            tracing::debug!("database {} already exists", self.name);
            return Ok(());
        }
        Self::check(&self.name, response).await?;
        tracing::info!("created database {}", self.name);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Document> {
        let response = self.request(Method::GET, &doc_path(id)).send().await?;
        let response = Self::check(id, response).await?;
        Ok(response.json().await?)
    }

    async fn save(
        &self,
        id: Option<&str>,
        rev: Option<&str>,
        document: &Document,
    ) -> Result<SaveResponse> {
        let mut body = document.clone();
        match rev {
            Some(rev) => body.insert("_rev".to_string(), Value::String(rev.to_string())),
            None => body.remove("_rev"),
        };

        let response = match id {
            Some(id) => {
                body.insert("_id".to_string(), Value::String(id.to_string()));
                self.request(Method::PUT, &doc_path(id))
                    .json(&body)
                    .send()
                    .await?
            }
            None => {
                body.remove("_id");
                self.request(Method::POST, "").json(&body).send().await?
            }
        };

        let response = Self::check(id.unwrap_or_default(), response).await?;
        Ok(response.json().await?)
    }

    async fn remove(&self, id: &str, rev: Option<&str>) -> Result<()> {
        let rev = match rev {
            Some(rev) => rev.to_string(),
            None => self.current_rev(id).await?,
        };

        let response = self
            .request(Method::DELETE, &doc_path(id))
            .query(&[("rev", rev.as_str())])
            .send()
            .await?;
        Self::check(id, response).await?;
        Ok(())
    }

    async fn update(
        &self,
        design: &str,
        handler: &str,
        id: &str,
        fields: &Document,
    ) -> Result<UpdateResponse> {
        let path = format!(
            "_design/{}/_update/{}/{}",
            urlencoding::encode(design),
            urlencoding::encode(handler),
            urlencoding::encode(id)
        );
        let response = self.request(Method::PUT, &path).json(fields).send().await?;
        let response = Self::check(id, response).await?;

        let rev = response
            .headers()
            .get(NEW_REV_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(UpdateResponse { rev })
    }

    async fn query_view(
        &self,
        design: &str,
        view: &str,
        params: &ViewParams,
    ) -> Result<ViewResponse> {
        let path = format!(
            "_design/{}/_view/{}",
            urlencoding::encode(design),
            urlencoding::encode(view)
        );
        let response = self
            .request(Method::GET, &path)
            .query(&params.to_query())
            .send()
            .await?;
        let response = Self::check(&path, response).await?;
        Ok(response.json().await?)
    }

    async fn changes(&self, params: &ChangeParams) -> Result<ChangeStream> {
        let response = self
            .request(Method::GET, "_changes")
            .query(&params.to_query())
            .send()
            .await?;
        let response = Self::check("_changes", response).await?;
        Ok(changes::decode(response.bytes_stream().map_err(Error::from)))
    }

    async fn security(&self) -> Result<Document> {
        let response = self.request(Method::GET, "_security").send().await?;
        let response = Self::check("_security", response).await?;
        Ok(response.json().await?)
    }

    async fn put_security(&self, security: &Document) -> Result<()> {
        let response = self
            .request(Method::PUT, "_security")
            .json(security)
            .send()
            .await?;
        Self::check("_security", response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_building() {
        let db = CouchDatabase::new(&ConnectionConfig::default(), "users");
        assert_eq!(db.url(""), "http://localhost:5984/users");
        assert_eq!(db.url("_changes"), "http://localhost:5984/users/_changes");
        assert_eq!(
            db.url(&doc_path("_design/sofa")),
            "http://localhost:5984/users/_design/sofa"
        );
    }

    #[test]
    fn test_authorization_is_precomputed() {
        let config = ConnectionConfig::default().with_auth("admin", "secret");
        let db = CouchDatabase::new(&config, "users");
        assert_eq!(db.authorization.as_deref(), Some("Basic YWRtaW46c2VjcmV0"));
        assert_eq!(db.name(), "users");
    }

    #[test]
    fn test_database_name_is_escaped() {
        let db = CouchDatabase::new(&ConnectionConfig::default(), "a/b");
        assert_eq!(db.url(""), "http://localhost:5984/a%2Fb");
    }
}
