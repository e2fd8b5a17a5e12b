//! # Tether
//!
//! Transparent remote-object proxies over asynchronous message channels.
//!
//! Two isolated contexts that can only exchange messages get a shared object
//! model: one side [`expose`]s a value, the other [`wrap`]s its end of the
//! channel and navigates the remote graph through a [`RemoteHandle`].
//! Property reads, writes, method calls, and constructor invocations each
//! become one request/response round-trip; results come back
//! structured-cloned, or, when marked with [`proxy`], as further remote
//! handles over dedicated sub-channels.
//!
//! ```text
//! ┌──────────────────────────────┐      ┌──────────────────────────────┐
//! │          Caller side          │      │         Exposer side          │
//! │  RemoteHandle (path, id)      │      │  HostValue graph              │
//! │  • get/fetch/set/call/...     │      │  • resolve path, dispatch     │
//! ├──────────────────────────────┤      ├──────────────────────────────┤
//! │  Correlator (one-shot ids)    │◄────►│  Exposer (persistent listener)│
//! ├──────────────────────────────┤      ├──────────────────────────────┤
//! │  Wire codec + transfer handlers: RAW clone or HANDLER (proxy/throw) │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  Endpoint: post / listen / unlisten / start? / close?               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`MessageChannel`] | In-memory duplex channel with transferable ports |
//! | [`expose`] | Evaluate inbound requests against a host object graph |
//! | [`wrap`] | Virtualizing handle rooted at the empty path |
//! | [`transfer`] / [`proxy`] | Move ports / route values through sub-channels |
//! | [`with_transfer_handlers`] | Extend the wire codec with named handlers |
//! | [`directed_endpoint`] | Window-style origin-qualified adapter |
//!
//! ## Quick start
//!
//! ```ignore
//! use std::rc::Rc;
//! use serde_json::json;
//! use tether::{expose, wrap, HostObject, HostValue, MessageChannel};
//!
//! let channel = MessageChannel::new();
//! expose(
//!     HostObject::new()
//!         .with_data("counter", json!(0))
//!         .with_method("inc", |ctx| { /* bump counter via ctx.receiver */ Ok(HostValue::null()) })
//!         .into_value(),
//!     Rc::new(channel.port1),
//! );
//!
//! let remote = wrap(Rc::new(channel.port2));
//! let value = remote.get("inc").call(vec![]).await?;
//! ```
//!
//! The engine is single-threaded cooperative: run it on a current-thread
//! tokio runtime inside a `LocalSet`. Concurrency exists only between the
//! two sides of a channel; in-flight calls on one side interleave freely and
//! correlate purely by id.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// Re-export protocol primitives for convenience.
pub use tether_core::{
    AllowedOrigins, CallError, ChannelError, ErrorObject, Operation, OriginMatcher, RemoteThrow,
    Reply, Request, Tag, ThrownRecord, WireError, WireKind, WirePayload, WireValue,
};

// =============================================================================
// Modules
// =============================================================================

/// Endpoint adapters over foreign channel shapes.
pub mod adapter;

/// Endpoint contract and in-memory message channels.
pub mod channel;

/// The exposer: request evaluation against a host object graph.
pub mod expose;

/// The virtualizing handle and request/response correlator.
pub mod handle;

/// Wire codec and the transfer-handler registry.
pub mod handlers;

/// Per-endpoint lifetime bookkeeping.
pub mod lifetime;

/// The dynamic value model.
pub mod value;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use adapter::{directed_endpoint, mpsc_endpoint_pair, DirectedEndpoint, MpscEndpoint};
pub use channel::{
    Endpoint, EndpointId, Listener, ListenerId, Message, MessageChannel, MessageEvent, MessagePort,
};
pub use expose::{expose, expose_with, ExposeOptions};
pub use handle::{new_call_id, wrap, wrap_legacy, RemoteHandle};
pub use handlers::{
    register_transfer_handler, remove_transfer_handler, transfer, with_transfer_handlers,
    HandlerRegistry, TransferHandler, TransferList,
};
pub use lifetime::{is_legacy, mark_legacy, proxy_count};
pub use value::{
    proxy, CallContext, HostConstructor, HostFunction, HostFuture, HostObject, HostResult,
    HostValue,
};
