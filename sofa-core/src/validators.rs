//! Named field validators.
//!
//! Every validator exists twice: as a Rust closure run before a write leaves
//! the process, and as a JavaScript function body stored in the design
//! document where `validate_doc_update` requires it. Both copies must agree.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

type Check = dyn Fn(&Value) -> Option<String> + Send + Sync;

/// A named validator: `None` means valid, `Some(message)` is the field error.
#[derive(Clone)]
pub struct Validator {
    name: String,
    check: Arc<Check>,
    source: String,
}

impl Validator {
    /// Creates a validator from a check and its JavaScript twin.
    ///
    /// `source` must be a JavaScript function expression taking the
    /// (prefix-stripped) value and returning a falsy value or a message.
    pub fn new<F>(name: impl Into<String>, source: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
            source: source.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// JavaScript function body stored in the design document.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn check(&self, value: &Value) -> Option<String> {
        (self.check)(value)
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Registry of validators addressable by name.
#[derive(Debug, Clone, Default)]
pub struct ValidatorSet {
    validators: BTreeMap<String, Validator>,
}

impl ValidatorSet {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in validators.
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.register(numeric());
        set.register(non_empty());
        set.register(email());
        set.register(timestamp());
        set
    }

    /// Adds or replaces a validator.
    pub fn register(&mut self, validator: Validator) {
        self.validators.insert(validator.name.clone(), validator);
    }

    pub fn with(mut self, validator: Validator) -> Self {
        self.register(validator);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Validator> {
        self.validators.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.values()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}

/// Digits only, or a JSON number.
pub fn numeric() -> Validator {
    Validator::new("numeric", include_str!("js/validators/numeric.js"), |value| {
        let ok = match value {
            Value::Number(_) => true,
            Value::String(s) => !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()),
            _ => false,
        };
        (!ok).then(|| "must be numeric".to_string())
    })
}

/// Non-empty string, array or object. Other values pass.
pub fn non_empty() -> Validator {
    Validator::new(
        "non_empty",
        include_str!("js/validators/non_empty.js"),
        |value| {
            let empty = match value {
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                _ => false,
            };
            empty.then(|| "can't be empty".to_string())
        },
    )
}

/// `local@domain.tld` shape.
pub fn email() -> Validator {
    Validator::new("email", include_str!("js/validators/email.js"), |value| {
        let ok = value.as_str().is_some_and(|s| {
            let parts: Vec<&str> = s.split('@').collect();
            match parts.as_slice() {
                [local, domain] => {
                    !local.is_empty()
                        && domain.find('.').is_some_and(|dot| dot > 0)
                        && !domain.ends_with('.')
                }
                _ => false,
            }
        });
        (!ok).then(|| "must be a valid email address".to_string())
    })
}

/// Non-negative integral number of milliseconds.
pub fn timestamp() -> Validator {
    Validator::new(
        "timestamp",
        include_str!("js/validators/timestamp.js"),
        |value| {
            let ok = value
                .as_f64()
                .is_some_and(|n| n >= 0.0 && n.fract() == 0.0);
            (!ok).then(|| "must be a timestamp in milliseconds".to_string())
        },
    )
}
