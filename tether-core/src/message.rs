//! Wire message and wire-value schemas.
//!
//! Two encodings coexist on the wire. The current encoding uses string tags
//! (`"GET"`, `"RAW"`, ...); the legacy encoding uses numeric tags from the
//! fixed tables below. An endpoint is treated as legacy as soon as either the
//! wrap site declared it or an inbound message carried a numeric operation
//! tag; from then on every outbound tag for that endpoint uses the numeric
//! form.
//!
//! | Operation | legacy | | Wire tag | legacy |
//! |-----------|--------|-|----------|--------|
//! | GET       | 0      | | RAW      | 0      |
//! | SET       | 1      | | HANDLER  | 1      |
//! | APPLY     | 2      | |          |        |
//! | CONSTRUCT | 3      | |          |        |
//! | ENDPOINT  | 4      | |          |        |
//! | RELEASE   | 5      | |          |        |
//!
//! The two numeric namespaces never collide because the wire tag only ever
//! appears inside a reply's `value` field, while the operation tag is the
//! top-level `type` of a request.

use serde::{Deserialize, Serialize};

/// The six remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Read the value at a path.
    Get,
    /// Assign a value under the last path segment.
    Set,
    /// Invoke the function at a path, with the path's parent as receiver.
    Apply,
    /// Invoke the constructor at a path; the instance comes back proxied.
    Construct,
    /// Allocate a fresh sub-channel exposing the same object.
    Endpoint,
    /// Tear down the exposure and run the finalizer hook.
    Release,
}

impl Operation {
    /// Current (string) tag name.
    pub const fn name(self) -> &'static str {
        match self {
            Operation::Get => "GET",
            Operation::Set => "SET",
            Operation::Apply => "APPLY",
            Operation::Construct => "CONSTRUCT",
            Operation::Endpoint => "ENDPOINT",
            Operation::Release => "RELEASE",
        }
    }

    /// Legacy (numeric) tag.
    pub const fn legacy_code(self) -> u8 {
        match self {
            Operation::Get => 0,
            Operation::Set => 1,
            Operation::Apply => 2,
            Operation::Construct => 3,
            Operation::Endpoint => 4,
            Operation::Release => 5,
        }
    }

    /// Encode as a tag in the requested encoding.
    pub fn tag(self, legacy: bool) -> Tag {
        if legacy {
            Tag::Code(self.legacy_code())
        } else {
            Tag::Name(self.name().to_string())
        }
    }

    /// Decode from a tag under either encoding.
    pub fn from_tag(tag: &Tag) -> Option<Operation> {
        const ALL: [Operation; 6] = [
            Operation::Get,
            Operation::Set,
            Operation::Apply,
            Operation::Construct,
            Operation::Endpoint,
            Operation::Release,
        ];
        match tag {
            Tag::Name(name) => ALL.iter().copied().find(|op| op.name() == name),
            Tag::Code(code) => ALL.iter().copied().find(|op| op.legacy_code() == *code),
        }
    }
}

/// A dual-encoded tag: string in the current encoding, number in the legacy
/// one. Shared by the operation and wire-value namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Tag {
    /// Current encoding.
    Name(String),
    /// Legacy encoding.
    Code(u8),
}

impl Tag {
    /// Whether this tag uses the legacy numeric encoding.
    pub fn is_legacy(&self) -> bool {
        matches!(self, Tag::Code(_))
    }
}

/// A request message. `path` addresses a sub-value of the exposed object;
/// `value` is present for SET only, `argument_list` for APPLY/CONSTRUCT only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, opaque to the receiver.
    pub id: String,
    /// Operation tag, string or numeric.
    #[serde(rename = "type")]
    pub op: Tag,
    /// Navigation path; defaults to the root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    /// SET payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<WireValue>,
    /// APPLY/CONSTRUCT arguments.
    #[serde(
        rename = "argumentList",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub argument_list: Option<Vec<WireValue>>,
}

impl Request {
    /// Build a request with no value or argument list.
    pub fn new(id: String, op: Operation, path: Vec<String>, legacy: bool) -> Self {
        Self {
            id,
            op: op.tag(legacy),
            path,
            value: None,
            argument_list: None,
        }
    }
}

/// A reply message. Distinguished from a request by the absence of a
/// top-level `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    /// Correlation id, copied from the request.
    pub id: String,
    /// The encoded outcome.
    pub value: WireValue,
}

/// The two wire-value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    /// Delivered by the channel's own clone/transfer mechanism.
    Raw,
    /// Materialization deferred to a named transfer handler.
    Handler,
}

impl WireKind {
    const fn name(self) -> &'static str {
        match self {
            WireKind::Raw => "RAW",
            WireKind::Handler => "HANDLER",
        }
    }

    const fn legacy_code(self) -> u8 {
        match self {
            WireKind::Raw => 0,
            WireKind::Handler => 1,
        }
    }

    fn from_tag(tag: &Tag) -> Option<WireKind> {
        match tag {
            Tag::Name(name) => match name.as_str() {
                "RAW" => Some(WireKind::Raw),
                "HANDLER" => Some(WireKind::Handler),
                _ => None,
            },
            Tag::Code(0) => Some(WireKind::Raw),
            Tag::Code(1) => Some(WireKind::Handler),
            Tag::Code(_) => None,
        }
    }
}

/// A value in transit: RAW data or a handler-deferred payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireValue {
    /// Wire-value tag, string or numeric.
    #[serde(rename = "type")]
    pub tag: Tag,
    /// Handler name; present on HANDLER values only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The payload.
    pub value: WirePayload,
}

impl WireValue {
    /// A RAW wire value in the requested encoding.
    pub fn raw(value: WirePayload, legacy: bool) -> Self {
        Self {
            tag: kind_tag(WireKind::Raw, legacy),
            name: None,
            value,
        }
    }

    /// A HANDLER wire value in the requested encoding.
    pub fn handler(name: impl Into<String>, value: WirePayload, legacy: bool) -> Self {
        Self {
            tag: kind_tag(WireKind::Handler, legacy),
            name: Some(name.into()),
            value,
        }
    }

    /// Decode the tag; `None` for tags outside the wire-value namespace.
    pub fn kind(&self) -> Option<WireKind> {
        WireKind::from_tag(&self.tag)
    }

    /// Shift any port slot by `offset`. Called when merging per-value
    /// transfer lists into one envelope list.
    pub fn rebase_ports(&mut self, offset: usize) {
        if let WirePayload::Port(slot) = &mut self.value {
            *slot += offset;
        }
    }
}

fn kind_tag(kind: WireKind, legacy: bool) -> Tag {
    if legacy {
        Tag::Code(kind.legacy_code())
    } else {
        Tag::Name(kind.name().to_string())
    }
}

/// Payload of a wire value: a JSON tree, or a reference into the enclosing
/// envelope's transfer list. Ports travel out of band; payloads name them by
/// slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "v", rename_all = "snake_case")]
pub enum WirePayload {
    /// Structured-clone-safe data.
    Json(serde_json::Value),
    /// Index into the envelope's transfer list.
    Port(usize),
}

impl WirePayload {
    /// The JSON payload, if this is not a port slot.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            WirePayload::Json(value) => Some(value),
            WirePayload::Port(_) => None,
        }
    }
}

/// Flattened error-like object: what survives of a thrown error when it
/// crosses the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error type name, e.g. `"RangeError"`.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Stack trace, if the throwing side had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorObject {
    /// Build an error object with no stack.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

/// Serialized form of a thrown value, the `throw` transfer handler's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrownRecord {
    /// Whether `value` is a flattened [`ErrorObject`].
    #[serde(rename = "isError")]
    pub is_error: bool,
    /// The flattened error, or the raw thrown value verbatim.
    pub value: serde_json::Value,
}
