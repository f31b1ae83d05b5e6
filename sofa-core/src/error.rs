//! Error types shared by every sofa operation.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// Outcome of a failed schema validation pass.
///
/// The two variants carry the same tags CouchDB's `validate_doc_update`
/// throws, so a document refused locally is refused for the same reason the
/// server would refuse it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// One or more business-rule failures, keyed by field name.
    #[error("forbidden: {}", format_field_errors(.0))]
    Forbidden(BTreeMap<String, String>),

    /// The document is structurally wrong (wrong prefix, unknown validator).
    #[error("internal-error: {message}")]
    Internal { field: String, message: String },
}

impl ValidationError {
    /// The tag the server-side validation function throws for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ValidationError::Forbidden(_) => "forbidden",
            ValidationError::Internal { .. } => "internal-error",
        }
    }

    /// Per-field errors, empty for structural failures.
    pub fn field_errors(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            ValidationError::Forbidden(errors) => Some(errors),
            ValidationError::Internal { .. } => None,
        }
    }

    pub(crate) fn missing_prefix(field: &str, value: &Value, prefix: &str) -> Self {
        let shown = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        ValidationError::Internal {
            field: field.to_string(),
            message: format!("{}[{}] must have prefix [{}]", field, shown, prefix),
        }
    }
}

fn format_field_errors(errors: &BTreeMap<String, String>) -> String {
    errors
        .iter()
        .map(|(field, err)| format!("{}: {}", field, err))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors returned by stores, synchronization and resource lifecycle calls.
#[derive(Error, Debug)]
pub enum Error {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("revision conflict on document {0}")]
    Conflict(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The server's `validate_doc_update` refused the write.
    #[error("write rejected by server: {0}")]
    Rejected(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("server error {status}: {error} ({reason})")]
    Server {
        status: u16,
        error: String,
        reason: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field '{0}' cannot be assigned directly")]
    ReadOnlyField(String),

    #[error("resource has no _id")]
    MissingId,

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Maps a CouchDB error body (`{"error": .., "reason": ..}`) to a kind.
    pub fn from_couch(status: u16, id: &str, error: &str, reason: &str) -> Self {
        match (status, error) {
            (404, _) | (_, "not_found") => Error::NotFound(id.to_string()),
            (409, _) | (_, "conflict") => Error::Conflict(id.to_string()),
            (403, _) | (_, "forbidden") => Error::Rejected(reason.to_string()),
            (401, _) | (_, "unauthorized") => Error::Unauthorized(reason.to_string()),
            // Thrown by validate_doc_update on a prefix mismatch.
            (_, "internal-error") => Error::Validation(ValidationError::Internal {
                field: id.to_string(),
                message: reason.to_string(),
            }),
            _ => Error::Server {
                status,
                error: error.to_string(),
                reason: reason.to_string(),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_kinds() {
        let forbidden = ValidationError::Forbidden(BTreeMap::new());
        assert_eq!(forbidden.kind(), "forbidden");

        let internal = ValidationError::missing_prefix("code", &Value::from("XYZ-5"), "ORD-");
        assert_eq!(internal.kind(), "internal-error");
        assert!(internal.to_string().contains("code[XYZ-5] must have prefix [ORD-]"));
        assert!(internal.field_errors().is_none());
    }

    #[test]
    fn test_forbidden_display_lists_fields() {
        let mut errors = BTreeMap::new();
        errors.insert("name".to_string(), "can't be missing or null".to_string());
        errors.insert("age".to_string(), "must be numeric".to_string());
        let err = ValidationError::Forbidden(errors);
        assert_eq!(
            err.to_string(),
            "forbidden: age: must be numeric, name: can't be missing or null"
        );
    }

    #[test]
    fn test_from_couch_mapping() {
        assert!(Error::from_couch(404, "a", "not_found", "missing").is_not_found());
        assert!(Error::from_couch(409, "a", "conflict", "Document update conflict.").is_conflict());
        assert!(matches!(
            Error::from_couch(403, "a", "forbidden", "nope"),
            Error::Rejected(r) if r == "nope"
        ));
        assert!(matches!(
            Error::from_couch(500, "a", "internal_server_error", "boom"),
            Error::Server { status: 500, .. }
        ));
    }

    #[test]
    fn test_from_couch_internal_error_is_validation() {
        let err = Error::from_couch(
            500,
            "o1",
            "internal-error",
            "code[XYZ-5] must have prefix [ORD-]",
        );
        match err {
            Error::Validation(validation) => {
                assert_eq!(validation.kind(), "internal-error");
                assert!(validation.to_string().contains("must have prefix [ORD-]"));
            }
            other => panic!("expected a validation error, got {:?}", other),
        }
    }
}
