//! # tether-core
//!
//! Protocol primitives for the tether remote-object proxy system.
//!
//! This crate provides the framing: the wire message and wire-value schemas
//! (in both the current string-tagged and the legacy numeric-tagged
//! encodings), the error taxonomy shared by both sides of a channel, and the
//! inbound-origin policy. The live machinery (channels, codec, exposer,
//! proxies) lives in the `tether` crate and depends on these types.
//!
//! ## Wire format
//!
//! Every exchange is a single request/response pair, serialized through
//! `serde_json` (the structured-clone boundary):
//!
//! ```text
//! request:  { "id", "type": GET|SET|APPLY|CONSTRUCT|ENDPOINT|RELEASE,
//!             "path": [..], "value"?, "argumentList"? }
//! reply:    { "id", "value": { "type": RAW|HANDLER, "name"?, "value" } }
//! ```
//!
//! Operation tags and wire-value tags are two independent namespaces; each
//! has a string form (current) and a numeric form (legacy). See
//! [`message::Tag`].

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod error;
/// Wire message and wire-value schemas.
pub mod message;
mod origin;

pub use error::{CallError, ChannelError, RemoteThrow, WireError};
pub use message::{
    ErrorObject, Operation, Reply, Request, Tag, ThrownRecord, WireKind, WirePayload, WireValue,
};
pub use origin::{AllowedOrigins, OriginMatcher};
