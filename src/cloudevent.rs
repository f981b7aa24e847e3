//! CloudEvent model
//!
//! The event store persists [CloudEvents](https://cloudevents.io). This
//! module carries the attributes the store needs, without tying callers to a
//! particular payload format. `data` is opaque bytes; extension attributes
//! are free-form JSON values.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A CloudEvent as persisted by the event store
///
/// `(id, source)` is globally unique across the store. Everything else is
/// caller-chosen; `time` is optional per the CloudEvents specification.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudEvent {
    /// Identifier of the event, unique within its `source`
    pub id: String,

    /// URI-reference identifying the context in which the event happened
    pub source: String,

    /// Type of occurrence, e.g. `com.example.name-defined`
    pub event_type: String,

    /// When the occurrence happened
    pub time: Option<DateTime<Utc>>,

    /// Subject of the event in the context of the producer
    pub subject: Option<String>,

    /// Content type of `data`, e.g. `application/json`
    pub data_content_type: Option<String>,

    /// URI identifying the schema that `data` adheres to
    pub data_schema: Option<String>,

    /// Opaque event payload
    pub data: Option<Vec<u8>>,

    /// CloudEvents extension attributes
    pub extensions: HashMap<String, Value>,
}

impl CloudEvent {
    /// Create an event with the three required attributes.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            time: None,
            subject: None,
            data_content_type: None,
            data_schema: None,
            data: None,
            extensions: HashMap::new(),
        }
    }

    /// Set the occurrence time.
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Set the subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the payload and its content type.
    pub fn with_data(mut self, content_type: impl Into<String>, data: Vec<u8>) -> Self {
        self.data_content_type = Some(content_type.into());
        self.data = Some(data);
        self
    }

    /// Set the payload schema URI.
    pub fn with_data_schema(mut self, schema: impl Into<String>) -> Self {
        self.data_schema = Some(schema.into());
        self
    }

    /// Add an extension attribute.
    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn builder_sets_required_attributes() {
        let event = CloudEvent::new("1", "urn:test", "com.example.name-defined");

        assert_eq!(event.id, "1");
        assert_eq!(event.source, "urn:test");
        assert_eq!(event.event_type, "com.example.name-defined");
        assert!(event.time.is_none());
        assert!(event.data.is_none());
    }

    #[test]
    fn builder_sets_optional_attributes() {
        let now = Utc::now();
        let event = CloudEvent::new("1", "urn:test", "com.example.name-defined")
            .with_time(now)
            .with_subject("name")
            .with_data("application/json", br#"{"name":"John"}"#.to_vec())
            .with_data_schema("urn:schema:name")
            .with_extension("tenant", json!("acme"));

        assert_eq!(event.time, Some(now));
        assert_eq!(event.subject.as_deref(), Some("name"));
        assert_eq!(event.data_content_type.as_deref(), Some("application/json"));
        assert_eq!(event.data_schema.as_deref(), Some("urn:schema:name"));
        assert_eq!(event.data, Some(br#"{"name":"John"}"#.to_vec()));
        assert_eq!(event.extensions["tenant"], json!("acme"));
    }
}
