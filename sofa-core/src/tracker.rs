//! Per-field synchronization tracking for resource instances.
//!
//! A [`FieldTracker`] holds the current value of every plain data field of a
//! document together with a flag saying whether that value is known to match
//! what is persisted. Flags are monotonic: once a field is written it stays
//! unsynchronized until [`FieldTracker::resync`] runs, even if the value is
//! later written back to what it was.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

/// A JSON document as stored in CouchDB.
pub type Document = Map<String, Value>;

/// Values and synchronization flags for the plain fields of one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTracker {
    values: BTreeMap<String, Value>,
    synced: BTreeMap<String, bool>,
    /// Computed fields the tracker must never manage.
    derived: BTreeSet<String>,
}

impl FieldTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracker that leaves `derived` fields untouched.
    pub fn with_derived<I, S>(derived: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            derived: derived.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Starts tracking `field` with an initial value and flag.
    ///
    /// Returns `false` without touching anything when the field is already
    /// tracked or is a derived field.
    pub fn track(&mut self, field: &str, value: Value, synced: bool) -> bool {
        if self.derived.contains(field) || self.values.contains_key(field) {
            return false;
        }
        self.values.insert(field.to_string(), value);
        self.synced.insert(field.to_string(), synced);
        true
    }

    /// Replaces all values with `source`.
    ///
    /// `synced = true` is the hydration path (the source came from the
    /// database); `false` is used for fresh, unsaved objects.
    pub fn hydrate(&mut self, source: Document, synced: bool) {
        self.values.clear();
        self.synced.clear();
        for (field, value) in source {
            self.track(&field, value, synced);
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Writes a field, returning the previous value.
    ///
    /// Unknown fields start out unsynchronized. Writes to derived fields are
    /// ignored and return `None`.
    pub fn set(&mut self, field: &str, value: Value) -> Option<Value> {
        if self.derived.contains(field) {
            return None;
        }
        match self.values.get_mut(field) {
            Some(current) => {
                let flag = self.synced.entry(field.to_string()).or_insert(false);
                *flag = *flag && *current == value;
                Some(std::mem::replace(current, value))
            }
            None => {
                self.track(field, value, false);
                None
            }
        }
    }

    /// Marks every tracked field as matching the persisted document.
    pub fn resync(&mut self) {
        for flag in self.synced.values_mut() {
            *flag = true;
        }
    }

    pub fn is_tracked(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn is_derived(&self, field: &str) -> bool {
        self.derived.contains(field)
    }

    /// Whether `field` is tracked and unchanged since the last resync.
    pub fn is_synced(&self, field: &str) -> bool {
        self.synced.get(field).copied().unwrap_or(false)
    }

    /// Names of tracked fields, in order.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Names of fields that are not synchronized.
    pub fn dirty_fields(&self) -> Vec<&str> {
        self.synced
            .iter()
            .filter(|(_, synced)| !**synced)
            .map(|(field, _)| field.as_str())
            .collect()
    }

    /// The diff set: every unsynchronized field with its current value.
    pub fn diff(&self) -> Document {
        self.values
            .iter()
            .filter(|(field, _)| !self.is_synced(field))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect()
    }

    /// The full current document.
    pub fn to_document(&self) -> Document {
        self.values
            .iter()
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect()
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

    #[test]
    fn test_hydrate_synced() {
        let mut tracker = FieldTracker::new();
        tracker.hydrate(doc(json!({"a": 1, "b": "x"})), true);

        assert!(tracker.is_synced("a"));
        assert!(tracker.is_synced("b"));
        assert!(tracker.diff().is_empty());
    }

    #[test]
    fn test_fresh_object_is_dirty() {
        let mut tracker = FieldTracker::new();
        tracker.hydrate(doc(json!({"a": 1})), false);

        assert!(!tracker.is_synced("a"));
        assert_eq!(tracker.diff(), doc(json!({"a": 1})));
    }

    #[test]
    fn test_write_marks_dirty_even_when_value_is_restored() {
        let mut tracker = FieldTracker::new();
        tracker.hydrate(doc(json!({"a": 1})), true);

        tracker.set("a", json!(2));
        assert!(!tracker.is_synced("a"));

        tracker.set("a", json!(1));
        assert!(!tracker.is_synced("a"));

        tracker.resync();
        assert!(tracker.is_synced("a"));
    }

    #[test]
    fn test_writing_the_same_value_keeps_sync() {
        let mut tracker = FieldTracker::new();
        tracker.hydrate(doc(json!({"a": 1})), true);

        let previous = tracker.set("a", json!(1));
        assert_eq!(previous, Some(json!(1)));
        assert!(tracker.is_synced("a"));
    }

    #[test]
    fn test_monotonic_dirty_over_write_sequences() {
        let sequences: Vec<Vec<Value>> = vec![
            vec![json!(1)],
            vec![json!(2), json!(1)],
            vec![json!("x"), json!(null), json!(1)],
            vec![json!(3), json!(3), json!(3)],
        ];

        for writes in sequences {
            let mut tracker = FieldTracker::new();
            tracker.hydrate(doc(json!({"f": 1})), true);

            let mut dirty = false;
            for value in writes {
                dirty = dirty || tracker.get("f") != Some(&value);
                tracker.set("f", value);
                assert_eq!(tracker.is_synced("f"), !dirty);
            }

            tracker.resync();
            assert!(tracker.is_synced("f"));
            tracker.set("f", json!(1));
            tracker.set("f", json!("changed"));
            assert!(!tracker.is_synced("f"));
        }
    }

    #[test]
    fn test_diff_contains_only_written_fields() {
        let mut tracker = FieldTracker::new();
        tracker.hydrate(doc(json!({"a": 1, "b": 2, "c": 3})), true);

        tracker.set("a", json!(10));
        tracker.set("b", json!(20));

        assert_eq!(tracker.diff(), doc(json!({"a": 10, "b": 20})));
        assert_eq!(tracker.dirty_fields(), vec!["a", "b"]);
    }

    #[test]
    fn test_track_is_exactly_once() {
        let mut tracker = FieldTracker::new();
        assert!(tracker.track("a", json!(1), true));
        assert!(!tracker.track("a", json!(2), false));

        assert_eq!(tracker.get("a"), Some(&json!(1)));
        assert!(tracker.is_synced("a"));
    }

    #[test]
    fn test_derived_fields_are_left_alone() {
        let mut tracker = FieldTracker::with_derived(["full_name"]);
        tracker.hydrate(doc(json!({"name": "Ada", "full_name": "Ada L."})), true);

        assert!(!tracker.is_tracked("full_name"));
        assert_eq!(tracker.set("full_name", json!("x")), None);
        assert!(!tracker.is_tracked("full_name"));
        assert!(tracker.is_derived("full_name"));
    }

    #[test]
    fn test_hydrate_replaces_values_wholesale() {
        let mut tracker = FieldTracker::new();
        tracker.hydrate(doc(json!({"a": 1, "stale": true})), false);
        tracker.hydrate(doc(json!({"a": 2})), true);

        assert_eq!(tracker.to_document(), doc(json!({"a": 2})));
        assert!(!tracker.is_tracked("stale"));
        assert!(tracker.is_synced("a"));
    }

    #[test]
    fn test_new_field_starts_dirty() {
        let mut tracker = FieldTracker::new();
        tracker.hydrate(doc(json!({"a": 1})), true);
        tracker.set("b", json!(true));

        assert!(!tracker.is_synced("b"));
        assert_eq!(tracker.fields().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
