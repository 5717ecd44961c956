//! Event record and wire format, plus the [`EventTypeRegistry`] callers use
//! to register encoders/decoders for their own payload types.
//!
//! The source system this crate's behavior is modeled on threads a per-type
//! serializer handle through every store call (dynamic JSON type information,
//! or source-generated serializer contexts). Here the core only ever stores
//! and retrieves bytes plus a logical `eventType` name and `schemaVersion`;
//! the registry below plays the role a typed `Serde<T>` wrapper plays in a
//! single-type crate, but keyed by name so heterogeneous payload types can
//! share one store.

use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StreamEngineError;

/// Free-form string metadata attached to an event.
pub type Metadata = HashMap<String, String>;

fn metadata_is_empty(m: &Metadata) -> bool {
    m.is_empty()
}

/// Correlation/causation/idempotency context attached at the moment an event
/// was recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMetadata {
    /// Identifier correlating this event with others from the same logical
    /// operation.
    #[serde(rename = "CorrelationId", skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,

    /// Identifier of the command/event that caused this one.
    #[serde(rename = "CausationId", skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<String>,

    /// Opaque token naming the user that originated the action.
    #[serde(
        rename = "OriginatedFromUser",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub originated_from_user: Option<String>,

    /// When the event actually occurred, as distinct from when it was stored.
    #[serde(rename = "EventOccuredAt", skip_serializing_if = "Option::is_none", default)]
    pub event_occurred_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Caller-supplied key used to deduplicate retried appends.
    #[serde(rename = "IdempotentKey", skip_serializing_if = "Option::is_none", default)]
    pub idempotent_key: Option<String>,
}

impl ActionMetadata {
    /// True when every field is `None`, i.e. this value carries no actual
    /// context and should be omitted entirely from the wire form.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &ActionMetadata::default()
    }
}

fn action_is_omittable(action: &Option<ActionMetadata>) -> bool {
    match action {
        None => true,
        Some(action) => action.is_empty(),
    }
}

fn default_schema_version() -> u32 {
    1
}

fn is_default_schema_version(v: &u32) -> bool {
    *v == 1
}

/// An immutable event record. `payload` is opaque bytes, rendered as a
/// string on the wire (typically JSON) since the core never inspects it.
///
/// `eventVersion` is always the event's own zero-based offset in its
/// owning stream, never in a chunk; payload is never rewritten once
/// persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Opaque payload bytes, typically a JSON-encoded domain value.
    pub payload: String,

    /// Logical event type name, e.g. `"OrderCreated"`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Zero-based position of this event in its owning stream.
    pub version: i64,

    /// Schema version of `payload`'s encoding. Wire-default 1 is elided.
    #[serde(
        rename = "schemaVersion",
        skip_serializing_if = "is_default_schema_version",
        default = "default_schema_version"
    )]
    pub schema_version: u32,

    /// Optional cross-stream ordering hint.
    #[serde(rename = "exseq", skip_serializing_if = "Option::is_none", default)]
    pub external_sequencer: Option<String>,

    /// Optional correlation/causation/idempotency context.
    #[serde(
        rename = "action",
        skip_serializing_if = "action_is_omittable",
        default
    )]
    pub action_metadata: Option<ActionMetadata>,

    /// Free-form string metadata. Omitted entirely from the wire form when
    /// empty.
    #[serde(skip_serializing_if = "metadata_is_empty", default)]
    pub metadata: Metadata,
}

impl Event {
    /// Builds a new event payload ready to be appended. `version` must be
    /// filled in by the session at append time.
    #[must_use]
    pub fn new(payload: String, event_type: impl Into<String>) -> Self {
        Self {
            payload,
            event_type: event_type.into(),
            version: 0,
            schema_version: 1,
            external_sequencer: None,
            action_metadata: None,
            metadata: Metadata::new(),
        }
    }

    /// Well-known event type written to the tail of a migrated source
    /// stream, see [`crate::migration`].
    pub const STREAM_CLOSED_EVENT_TYPE: &'static str = "StreamClosed";

    /// True when this event is a [`Self::STREAM_CLOSED_EVENT_TYPE`] marker.
    #[must_use]
    pub fn is_stream_closed(&self) -> bool {
        self.event_type == Self::STREAM_CLOSED_EVENT_TYPE
    }
}

type EncodeFn = Box<dyn Fn(&dyn Any) -> Result<Vec<u8>, StreamEngineError> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, StreamEngineError> + Send + Sync>;

struct Codec {
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Registry mapping a logical event type name and schema version to the
/// encoder/decoder pair for a concrete payload type.
///
/// Callers register one entry per `(typeName, schemaVersion)` pair; the
/// engine itself never needs to know the concrete payload type, only that
/// it can round-trip bytes through whatever was registered.
#[derive(Default)]
pub struct EventTypeRegistry {
    codecs: HashMap<(String, u32), Codec>,
}

impl EventTypeRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the JSON codec for `T` under `type_name`/`schema_version`.
    pub fn register<T>(&mut self, type_name: &str, schema_version: u32)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let key = (type_name.to_string(), schema_version);
        let type_name_owned = type_name.to_string();

        let encode: EncodeFn = Box::new(move |value: &dyn Any| {
            let typed = value.downcast_ref::<T>().ok_or_else(|| {
                StreamEngineError::Serialization(format!(
                    "value passed to encode() does not match registered type for `{type_name_owned}`"
                ))
            })?;
            serde_json::to_vec(typed)
                .map_err(|e| StreamEngineError::Serialization(format!("encode failed: {e}")))
        });

        let decode: DecodeFn = Box::new(move |bytes: &[u8]| {
            let typed: T = serde_json::from_slice(bytes)
                .map_err(|e| StreamEngineError::Serialization(format!("decode failed: {e}")))?;
            Ok(Box::new(typed) as Box<dyn Any + Send>)
        });

        self.codecs.insert(key, Codec { encode, decode });
    }

    /// Encodes `value` using the codec registered for `type_name`/`schema_version`.
    pub fn encode(
        &self,
        type_name: &str,
        schema_version: u32,
        value: &dyn Any,
    ) -> Result<Vec<u8>, StreamEngineError> {
        let codec = self.lookup(type_name, schema_version)?;
        (codec.encode)(value)
    }

    /// Decodes `bytes` into `T` using the codec registered for
    /// `type_name`/`schema_version`.
    pub fn decode<T: Send + 'static>(
        &self,
        type_name: &str,
        schema_version: u32,
        bytes: &[u8],
    ) -> Result<T, StreamEngineError> {
        let codec = self.lookup(type_name, schema_version)?;
        let boxed = (codec.decode)(bytes)?;
        boxed.downcast::<T>().map(|b| *b).map_err(|_| {
            StreamEngineError::Serialization(format!(
                "decoded value for `{type_name}` does not match requested type"
            ))
        })
    }

    /// True when a codec is registered for `type_name`/`schema_version`.
    #[must_use]
    pub fn contains(&self, type_name: &str, schema_version: u32) -> bool {
        self.codecs
            .contains_key(&(type_name.to_string(), schema_version))
    }

    fn lookup(&self, type_name: &str, schema_version: u32) -> Result<&Codec, StreamEngineError> {
        self.codecs
            .get(&(type_name.to_string(), schema_version))
            .ok_or_else(|| {
                StreamEngineError::Serialization(format!(
                    "no codec registered for type `{type_name}` schema version {schema_version}"
                ))
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct OrderCreated {
        id: String,
    }

    #[test]
    fn action_metadata_with_all_fields_none_is_empty() {
        assert!(ActionMetadata::default().is_empty());
    }

    #[test]
    fn action_metadata_omitted_when_empty() {
        let event = Event::new("{}".to_string(), "OrderCreated");
        let json = serde_json::to_string(&event).expect("should serialize");
        assert!(!json.contains("\"action\""));
        assert!(!json.contains("\"metadata\""));
        assert!(!json.contains("\"schemaVersion\""));
    }

    #[test]
    fn action_metadata_present_when_non_empty() {
        let mut event = Event::new("{}".to_string(), "OrderCreated");
        event.action_metadata = Some(ActionMetadata {
            correlation_id: Some("corr-1".to_string()),
            ..Default::default()
        });

        let json = serde_json::to_string(&event).expect("should serialize");
        assert!(json.contains("\"action\""));
        assert!(json.contains("\"CorrelationId\":\"corr-1\""));
        assert!(!json.contains("CausationId"));
    }

    #[test]
    fn schema_version_elided_when_default() {
        let mut event = Event::new("{}".to_string(), "OrderCreated");
        event.schema_version = 2;
        let json = serde_json::to_string(&event).expect("should serialize");
        assert!(json.contains("\"schemaVersion\":2"));
    }

    #[test]
    fn registry_round_trips_registered_type() {
        let mut registry = EventTypeRegistry::new();
        registry.register::<OrderCreated>("OrderCreated", 1);

        let value = OrderCreated { id: "o1".to_string() };
        let bytes = registry
            .encode("OrderCreated", 1, &value)
            .expect("encode should succeed");

        let decoded: OrderCreated = registry
            .decode("OrderCreated", 1, &bytes)
            .expect("decode should succeed");

        assert_eq!(decoded, value);
    }

    #[test]
    fn registry_rejects_unregistered_type() {
        let registry = EventTypeRegistry::new();
        let err = registry.decode::<OrderCreated>("Missing", 1, b"{}");
        assert!(err.is_err());
    }
}
