//! Declarative document schemas and the validation pass that enforces them.
//!
//! The same schema is serialized into the design document, where
//! `js/validate_doc_update.js` walks it with identical rules. Keep the two in
//! step: members are visited in name order, prefix mismatches abort at once
//! with `internal-error`, everything else accumulates into one `forbidden`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::tracker::Document;
use crate::validators::ValidatorSet;

/// Message recorded for a required field that is absent or null.
pub const MISSING_OR_NULL: &str = "can't be missing or null";

/// How a single schema member is validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Rule {
    /// Required field checked by the named validator.
    Validator(String),
    /// Structured descriptor.
    Field(FieldRule),
}

/// Structured rule for one field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Field this one is derived from. Aliases are never validated directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// String the value must start with; stripped before validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    /// Named validator run on the stripped value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<String>,
}

impl FieldRule {
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Self::default()
        }
    }

    pub fn alias(of: impl Into<String>) -> Self {
        Self {
            alias: Some(of.into()),
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_validator(mut self, name: impl Into<String>) -> Self {
        self.validate = Some(name.into());
        self
    }

    pub fn make_optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Alias target. An empty string counts as unset.
    pub fn alias_of(&self) -> Option<&str> {
        set(&self.alias)
    }

    /// Required prefix. An empty string counts as unset.
    pub fn prefix(&self) -> Option<&str> {
        set(&self.prefix)
    }

    /// Validator name. An empty string counts as unset.
    pub fn validator(&self) -> Option<&str> {
        set(&self.validate)
    }
}

fn set(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

impl Rule {
    /// Validator this rule runs, if any.
    pub fn validator(&self) -> Option<&str> {
        match self {
            Rule::Validator(name) if !name.is_empty() => Some(name.as_str()),
            Rule::Validator(_) => None,
            Rule::Field(field) => field.validator(),
        }
    }

    /// Field this rule aliases, if any.
    pub fn alias_of(&self) -> Option<&str> {
        match self {
            Rule::Validator(_) => None,
            Rule::Field(field) => field.alias_of(),
        }
    }
}

/// Field rules for one doc type, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    rules: BTreeMap<String, Rule>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule, replacing any previous rule for the field.
    pub fn field(mut self, name: impl Into<String>, rule: impl Into<Rule>) -> Self {
        self.rules.insert(name.into(), rule.into());
        self
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rule)> {
        self.rules.iter().map(|(name, rule)| (name.as_str(), rule))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Alias fields and the field each one reads from.
    pub fn aliases(&self) -> impl Iterator<Item = (&str, &str)> {
        self.rules
            .iter()
            .filter_map(|(name, rule)| rule.alias_of().map(|target| (name.as_str(), target)))
    }

    /// Field an alias resolves to, if `name` is an alias.
    pub fn alias_target(&self, name: &str) -> Option<&str> {
        self.rules.get(name).and_then(Rule::alias_of)
    }

    /// Validator names referenced by any rule.
    pub fn validator_names(&self) -> impl Iterator<Item = &str> {
        self.rules.values().filter_map(Rule::validator)
    }
}

impl From<&str> for Rule {
    fn from(name: &str) -> Self {
        Rule::Validator(name.to_string())
    }
}

impl From<String> for Rule {
    fn from(name: String) -> Self {
        Rule::Validator(name)
    }
}

impl From<FieldRule> for Rule {
    fn from(rule: FieldRule) -> Self {
        Rule::Field(rule)
    }
}

/// Validates `document` against `schema`.
///
/// Deleted documents and documents without a `doc_type` always pass.
pub fn validate(
    document: &Document,
    schema: &Schema,
    validators: &ValidatorSet,
) -> Result<(), ValidationError> {
    if is_deleted(document) || !has_doc_type(document) {
        return Ok(());
    }

    let mut errors = BTreeMap::new();

    for (member, rule) in schema.iter() {
        let (prefix, optional) = match rule {
            Rule::Validator(_) => (None, false),
            Rule::Field(field) => {
                if field.alias_of().is_some() {
                    continue;
                }
                (field.prefix(), field.optional)
            }
        };
        let validator = rule.validator();

        let value = match document.get(member) {
            Some(value) if !value.is_null() => value,
            _ => {
                if !optional {
                    errors.insert(member.to_string(), MISSING_OR_NULL.to_string());
                }
                continue;
            }
        };

        let stripped;
        let value = match prefix {
            Some(prefix) => match value.as_str().and_then(|s| s.strip_prefix(prefix)) {
                Some(rest) => {
                    stripped = Value::String(rest.to_string());
                    &stripped
                }
                None => return Err(ValidationError::missing_prefix(member, value, prefix)),
            },
            None => value,
        };

        if let Some(name) = validator {
            let validator = validators
                .get(name)
                .ok_or_else(|| ValidationError::Internal {
                    field: member.to_string(),
                    message: format!("{} uses unknown validator [{}]", member, name),
                })?;
            if let Some(err) = validator.check(value) {
                errors.insert(member.to_string(), err);
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::Forbidden(errors))
    }
}

fn is_deleted(document: &Document) -> bool {
    document
        .get("_deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn has_doc_type(document: &Document) -> bool {
    match document.get("doc_type") {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
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

    fn order_schema() -> Schema {
        Schema::new()
            .field("status", FieldRule::optional())
            .field(
                "code",
                FieldRule::default()
                    .with_prefix("ORD-")
                    .with_validator("numeric"),
            )
    }

    #[test]
    fn test_prefix_mismatch_is_internal_error() {
        let document = doc(json!({"doc_type": "order", "code": "XYZ-5"}));
        let err = validate(&document, &order_schema(), &ValidatorSet::builtin()).unwrap_err();

        assert_eq!(err.kind(), "internal-error");
        match err {
            ValidationError::Internal { field, message } => {
                assert_eq!(field, "code");
                assert!(message.contains("XYZ-5"));
                assert!(message.contains("ORD-"));
                assert!(!message.contains("status"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_prefix_stripped_before_validator() {
        let document = doc(json!({"doc_type": "order", "code": "ORD-5"}));
        assert!(validate(&document, &order_schema(), &ValidatorSet::builtin()).is_ok());

        let document = doc(json!({"doc_type": "order", "code": "ORD-five"}));
        let err = validate(&document, &order_schema(), &ValidatorSet::builtin()).unwrap_err();
        assert_eq!(
            err.field_errors().unwrap().get("code").map(String::as_str),
            Some("must be numeric")
        );
    }

    #[test]
    fn test_missing_fields_are_aggregated() {
        let schema = Schema::new()
            .field("name", "non_empty")
            .field("email", FieldRule::default().with_validator("email"))
            .field("nickname", FieldRule::optional());
        let document = doc(json!({"doc_type": "user"}));

        let err = validate(&document, &schema, &ValidatorSet::builtin()).unwrap_err();
        assert_eq!(err.kind(), "forbidden");
        let errors = err.field_errors().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors["name"], MISSING_OR_NULL);
        assert_eq!(errors["email"], MISSING_OR_NULL);
    }

    #[test]
    fn test_prefix_error_discards_business_errors() {
        let schema = Schema::new()
            .field("a_name", "non_empty")
            .field("b_code", FieldRule::default().with_prefix("ORD-"))
            .field("c_other", "non_empty");
        let document = doc(json!({"doc_type": "order", "b_code": "BAD"}));

        let err = validate(&document, &schema, &ValidatorSet::builtin()).unwrap_err();
        assert!(matches!(err, ValidationError::Internal { ref field, .. } if field == "b_code"));
        assert!(err.field_errors().is_none());
    }

    #[test]
    fn test_null_counts_as_missing() {
        let schema = Schema::new().field("name", "non_empty");
        let document = doc(json!({"doc_type": "user", "name": null}));

        let err = validate(&document, &schema, &ValidatorSet::builtin()).unwrap_err();
        assert_eq!(err.field_errors().unwrap()["name"], MISSING_OR_NULL);
    }

    #[test]
    fn test_non_string_value_with_prefix_is_internal() {
        let schema = Schema::new().field("code", FieldRule::default().with_prefix("ORD-"));
        let document = doc(json!({"doc_type": "order", "code": 5}));

        let err = validate(&document, &schema, &ValidatorSet::builtin()).unwrap_err();
        assert_eq!(err.kind(), "internal-error");
    }

    #[test]
    fn test_aliases_are_skipped() {
        let schema = Schema::new()
            .field("name", "non_empty")
            .field("title", FieldRule::alias("name"));
        let document = doc(json!({"doc_type": "user", "name": "Ada"}));

        assert!(validate(&document, &schema, &ValidatorSet::builtin()).is_ok());
        assert_eq!(schema.alias_target("title"), Some("name"));
        assert_eq!(schema.aliases().collect::<Vec<_>>(), vec![("title", "name")]);
    }

    #[test]
    fn test_deleted_and_untyped_documents_bypass() {
        let schema = Schema::new().field("name", "non_empty");

        let deleted = doc(json!({"doc_type": "user", "_deleted": true}));
        assert!(validate(&deleted, &schema, &ValidatorSet::builtin()).is_ok());

        let untyped = doc(json!({}));
        assert!(validate(&untyped, &schema, &ValidatorSet::builtin()).is_ok());

        let empty_type = doc(json!({"doc_type": ""}));
        assert!(validate(&empty_type, &schema, &ValidatorSet::builtin()).is_ok());
    }

    #[test]
    fn test_unknown_validator_is_internal() {
        let schema = Schema::new().field("name", "shouty");
        let document = doc(json!({"doc_type": "user", "name": "x"}));

        let err = validate(&document, &schema, &ValidatorSet::builtin()).unwrap_err();
        assert_eq!(err.kind(), "internal-error");
    }

    #[test]
    fn test_empty_prefix_is_unset() {
        let schema = Schema::new().field("code", FieldRule::default().with_prefix(""));
        let document = doc(json!({"doc_type": "x", "code": 5}));

        assert!(validate(&document, &schema, &ValidatorSet::builtin()).is_ok());
    }

    #[test]
    fn test_empty_alias_is_unset() {
        let schema = Schema::new().field("code", FieldRule::alias(""));
        let document = doc(json!({"doc_type": "x"}));

        let err = validate(&document, &schema, &ValidatorSet::builtin()).unwrap_err();
        assert_eq!(err.field_errors().unwrap()["code"], MISSING_OR_NULL);
        assert_eq!(schema.alias_target("code"), None);
        assert_eq!(schema.aliases().count(), 0);
    }

    #[test]
    fn test_empty_validator_name_is_unset() {
        let schema = Schema::new()
            .field("a", "")
            .field("b", FieldRule::default().with_validator(""));
        let document = doc(json!({"doc_type": "x", "a": "", "b": 1}));

        assert!(validate(&document, &schema, &ValidatorSet::builtin()).is_ok());
        assert_eq!(schema.validator_names().count(), 0);
    }

    #[test]
    fn test_schema_serde_shape() {
        let schema = Schema::new()
            .field("name", "non_empty")
            .field("status", FieldRule::optional())
            .field("code", FieldRule::default().with_prefix("ORD-").with_validator("numeric"));

        let json = serde_json::to_value(&schema).unwrap();
        assert_eq!(
            json,
            json!({
                "code": {"prefix": "ORD-", "validate": "numeric"},
                "name": "non_empty",
                "status": {"optional": true}
            })
        );

        let parsed: Schema = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, schema);
    }
}
