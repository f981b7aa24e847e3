//! BSON mapping between [`CloudEvent`]s and event collection documents
//!
//! One document is stored per event. Field names follow the CloudEvents
//! attribute names (`datacontenttype`, `dataschema`), with `streamId` and,
//! under the transactional guarantee, `streamOrder` added alongside.

use chrono::{DateTime, SecondsFormat, Utc};
use mongodb::bson::spec::BinarySubtype;
use mongodb::bson::{doc, Binary, Bson, Document};

use crate::cloudevent::CloudEvent;
use crate::config::TimeRepresentation;
use crate::errors::{EventStoreError, EventStoreResult};

/// Field names of the event collection
pub mod fields {
    pub const STREAM_ID: &str = "streamId";
    pub const STREAM_ORDER: &str = "streamOrder";
    pub const ID: &str = "id";
    pub const SOURCE: &str = "source";
    pub const TYPE: &str = "type";
    pub const TIME: &str = "time";
    pub const SUBJECT: &str = "subject";
    pub const DATA_CONTENT_TYPE: &str = "datacontenttype";
    pub const DATA_SCHEMA: &str = "dataschema";
    pub const DATA: &str = "data";
    pub const EXTENSIONS: &str = "extensions";
}

/// Map a CloudEvent to its persisted document.
///
/// `stream_order` is present only under the transactional guarantee.
pub fn to_document(
    event: &CloudEvent,
    stream_id: &str,
    stream_order: Option<u64>,
    time_representation: TimeRepresentation,
) -> EventStoreResult<Document> {
    let mut document = doc! {
        fields::STREAM_ID: stream_id,
        fields::ID: &event.id,
        fields::SOURCE: &event.source,
        fields::TYPE: &event.event_type,
    };

    if let Some(order) = stream_order {
        document.insert(fields::STREAM_ORDER, order as i64);
    }

    if let Some(time) = event.time {
        document.insert(fields::TIME, encode_time(time, time_representation));
    }

    if let Some(subject) = &event.subject {
        document.insert(fields::SUBJECT, subject);
    }

    if let Some(content_type) = &event.data_content_type {
        document.insert(fields::DATA_CONTENT_TYPE, content_type);
    }

    if let Some(schema) = &event.data_schema {
        document.insert(fields::DATA_SCHEMA, schema);
    }

    if let Some(data) = &event.data {
        document.insert(
            fields::DATA,
            Binary {
                subtype: BinarySubtype::Generic,
                bytes: data.clone(),
            },
        );
    }

    if !event.extensions.is_empty() {
        let mut extensions = Document::new();
        for (name, value) in &event.extensions {
            extensions.insert(name, mongodb::bson::to_bson(value)?);
        }
        document.insert(fields::EXTENSIONS, extensions);
    }

    Ok(document)
}

/// Map a persisted document back to a CloudEvent.
pub fn from_document(
    document: &Document,
    time_representation: TimeRepresentation,
) -> EventStoreResult<CloudEvent> {
    let mut event = CloudEvent::new(
        required_str(document, fields::ID)?,
        required_str(document, fields::SOURCE)?,
        required_str(document, fields::TYPE)?,
    );

    if let Some(time) = document.get(fields::TIME) {
        event.time = Some(decode_time(time, time_representation)?);
    }

    if let Ok(subject) = document.get_str(fields::SUBJECT) {
        event.subject = Some(subject.to_string());
    }

    if let Ok(content_type) = document.get_str(fields::DATA_CONTENT_TYPE) {
        event.data_content_type = Some(content_type.to_string());
    }

    if let Ok(schema) = document.get_str(fields::DATA_SCHEMA) {
        event.data_schema = Some(schema.to_string());
    }

    if let Some(Bson::Binary(binary)) = document.get(fields::DATA) {
        event.data = Some(binary.bytes.clone());
    }

    if let Ok(extensions) = document.get_document(fields::EXTENSIONS) {
        for (name, value) in extensions {
            let json = serde_json::to_value(value).map_err(|e| {
                EventStoreError::InvalidDocument(format!("extension {name}: {e}"))
            })?;
            event.extensions.insert(name.clone(), json);
        }
    }

    Ok(event)
}

/// The stream a persisted event document belongs to.
pub fn stream_id_of(document: &Document) -> EventStoreResult<String> {
    required_str(document, fields::STREAM_ID)
}

fn required_str(document: &Document, field: &str) -> EventStoreResult<String> {
    document
        .get_str(field)
        .map(str::to_string)
        .map_err(|_| EventStoreError::InvalidDocument(format!("missing field {field}")))
}

fn encode_time(time: DateTime<Utc>, representation: TimeRepresentation) -> Bson {
    match representation {
        TimeRepresentation::Rfc3339String => {
            Bson::String(time.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        // BSON dates are millisecond-precision; sub-millisecond detail is lost.
        TimeRepresentation::Date => Bson::DateTime(time.into()),
    }
}

fn decode_time(value: &Bson, representation: TimeRepresentation) -> EventStoreResult<DateTime<Utc>> {
    match (representation, value) {
        (TimeRepresentation::Rfc3339String, Bson::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| EventStoreError::InvalidDocument(format!("time {s:?}: {e}"))),
        (TimeRepresentation::Date, Bson::DateTime(dt)) => Ok(dt.to_chrono()),
        (_, other) => Err(EventStoreError::InvalidDocument(format!(
            "unexpected time representation: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    fn sample_event() -> CloudEvent {
        CloudEvent::new("1", "urn:test", "com.example.name-defined")
            .with_time(Utc.with_ymd_and_hms(2024, 5, 17, 12, 30, 0).unwrap())
            .with_subject("name")
            .with_data("application/json", br#"{"name":"John"}"#.to_vec())
            .with_extension("tenant", json!("acme"))
    }

    #[test_case(TimeRepresentation::Rfc3339String)]
    #[test_case(TimeRepresentation::Date)]
    fn document_round_trip(representation: TimeRepresentation) {
        let event = sample_event();

        let document = to_document(&event, "name", Some(1), representation).unwrap();
        let decoded = from_document(&document, representation).unwrap();

        assert_eq!(decoded, event);
        assert_eq!(stream_id_of(&document).unwrap(), "name");
        assert_eq!(document.get_i64(fields::STREAM_ORDER).unwrap(), 1);
    }

    #[test]
    fn rfc3339_representation_stores_time_as_string() {
        let document = to_document(
            &sample_event(),
            "name",
            None,
            TimeRepresentation::Rfc3339String,
        )
        .unwrap();

        assert!(matches!(document.get(fields::TIME), Some(Bson::String(_))));
        assert!(document.get(fields::STREAM_ORDER).is_none());
    }

    #[test]
    fn date_representation_stores_time_as_bson_date() {
        let document =
            to_document(&sample_event(), "name", None, TimeRepresentation::Date).unwrap();

        assert!(matches!(document.get(fields::TIME), Some(Bson::DateTime(_))));
    }

    #[test]
    fn absent_optional_fields_stay_absent() {
        let event = CloudEvent::new("1", "urn:test", "com.example.name-defined");
        let document =
            to_document(&event, "name", Some(1), TimeRepresentation::Rfc3339String).unwrap();

        for field in [
            fields::TIME,
            fields::SUBJECT,
            fields::DATA,
            fields::DATA_CONTENT_TYPE,
            fields::DATA_SCHEMA,
            fields::EXTENSIONS,
        ] {
            assert!(document.get(field).is_none(), "{field} should be absent");
        }

        let decoded = from_document(&document, TimeRepresentation::Rfc3339String).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let document = doc! { fields::STREAM_ID: "name", fields::ID: "1" };

        let result = from_document(&document, TimeRepresentation::Rfc3339String);

        assert!(matches!(
            result,
            Err(EventStoreError::InvalidDocument(_))
        ));
    }
}
