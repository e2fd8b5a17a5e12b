//! Wire codec and the transfer-handler registry.
//!
//! [`to_wire`] walks the registered handlers in insertion order; the first
//! whose `can_handle` matches produces a HANDLER wire value. Everything else
//! is RAW: data is deep-cloned to JSON and ports travel through the
//! envelope's transfer list, gated by the one-shot transfer annotation.
//!
//! Two built-ins are present at initialization and cannot be removed:
//!
//! | name    | matches               | wire form                         |
//! |---------|-----------------------|-----------------------------------|
//! | `proxy` | proxy-marked values   | fresh sub-channel; port moves     |
//! | `throw` | thrown markers        | flattened `{name, message, stack}`|

use std::cell::RefCell;
use std::rc::Rc;

use tether_core::message::{ErrorObject, ThrownRecord, WirePayload, WireValue};
use tether_core::{WireError, WireKind};

use crate::channel::{Endpoint, MessageChannel, MessagePort};
use crate::expose::expose;
use crate::handle::wrap;
use crate::lifetime;
use crate::value::HostValue;

/// View over an envelope's transfer list, handed to handler deserialization.
pub struct TransferList<'a> {
    ports: &'a [MessagePort],
}

impl<'a> TransferList<'a> {
    /// Wrap an envelope's transfer list.
    pub fn new(ports: &'a [MessagePort]) -> Self {
        Self { ports }
    }

    /// The port at a payload slot.
    pub fn port(&self, slot: usize) -> Result<MessagePort, WireError> {
        self.ports
            .get(slot)
            .cloned()
            .ok_or(WireError::BadPortSlot { slot })
    }
}

/// A named codec over a subset of values.
pub trait TransferHandler {
    /// Whether this handler serializes the value.
    fn can_handle(&self, value: &HostValue) -> bool;

    /// Convert to a wire payload plus the ports to move with it.
    fn serialize(&self, value: HostValue) -> Result<(WirePayload, Vec<MessagePort>), WireError>;

    /// Rebuild the value on the receiving side.
    fn deserialize(
        &self,
        payload: WirePayload,
        ports: &TransferList<'_>,
    ) -> Result<HostValue, WireError>;
}

const BUILTIN_NAMES: [&str; 2] = ["proxy", "throw"];

/// Insertion-ordered collection of transfer handlers, keyed by unique name.
pub struct HandlerRegistry {
    entries: Vec<(String, Rc<dyn TransferHandler>)>,
}

impl HandlerRegistry {
    /// A registry with only the built-ins.
    pub fn with_builtins() -> Self {
        Self {
            entries: vec![
                ("proxy".to_string(), Rc::new(ProxyTransferHandler) as Rc<dyn TransferHandler>),
                ("throw".to_string(), Rc::new(ThrowTransferHandler)),
            ],
        }
    }

    /// Register a handler. A handler already registered under the same name
    /// is replaced in place, keeping its position in the iteration order.
    pub fn register(&mut self, name: impl Into<String>, handler: Rc<dyn TransferHandler>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = handler,
            None => self.entries.push((name, handler)),
        }
    }

    /// Remove a handler by name. Built-ins cannot be removed.
    pub fn remove(&mut self, name: &str) -> Result<(), WireError> {
        if BUILTIN_NAMES.contains(&name) {
            return Err(WireError::ReservedHandler {
                name: name.to_string(),
            });
        }
        self.entries.retain(|(existing, _)| existing != name);
        Ok(())
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Rc<dyn TransferHandler>> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, handler)| Rc::clone(handler))
    }

    /// First handler claiming the value, in registration order.
    fn find(&self, value: &HostValue) -> Option<(String, Rc<dyn TransferHandler>)> {
        self.entries
            .iter()
            .find(|(_, handler)| handler.can_handle(value))
            .map(|(name, handler)| (name.clone(), Rc::clone(handler)))
    }

    /// Registered names in iteration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }
}

thread_local! {
    static REGISTRY: RefCell<HandlerRegistry> = RefCell::new(HandlerRegistry::with_builtins());
}

/// Register a transfer handler in the shared registry. Call before exposing
/// or wrapping anything that the handler should cover.
pub fn register_transfer_handler(name: impl Into<String>, handler: Rc<dyn TransferHandler>) {
    REGISTRY.with(|registry| registry.borrow_mut().register(name, handler));
}

/// Remove a transfer handler from the shared registry.
pub fn remove_transfer_handler(name: &str) -> Result<(), WireError> {
    REGISTRY.with(|registry| registry.borrow_mut().remove(name))
}

/// Run a closure against the shared registry.
pub fn with_transfer_handlers<R>(f: impl FnOnce(&mut HandlerRegistry) -> R) -> R {
    REGISTRY.with(|registry| f(&mut registry.borrow_mut()))
}

// One-shot transfer annotation: value identity -> ports to move when that
// exact value is RAW-encoded.
thread_local! {
    static TRANSFER_CACHE: RefCell<Vec<(usize, Vec<MessagePort>)>> = RefCell::new(Vec::new());
}

fn value_identity(value: &HostValue) -> Option<usize> {
    match value {
        HostValue::Object(object) => Some(Rc::as_ptr(object) as usize),
        HostValue::Function(function) => Some(Rc::as_ptr(function) as usize),
        HostValue::Constructor(constructor) => Some(Rc::as_ptr(constructor) as usize),
        HostValue::Port(port) => Some(port.identity()),
        HostValue::Data(_)
        | HostValue::Error(_)
        | HostValue::Remote(_)
        | HostValue::Thrown(_) => None,
    }
}

/// Declare which ports move with a value when it is RAW-encoded. The
/// association is consumed by the next encoding of that exact value; it is
/// never persisted on the wire, and reuse requires re-annotation.
pub fn transfer(value: HostValue, ports: Vec<MessagePort>) -> HostValue {
    if let Some(identity) = value_identity(&value) {
        TRANSFER_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            cache.retain(|(existing, _)| *existing != identity);
            cache.push((identity, ports));
        });
    } else {
        tracing::warn!("transfer() ignored for a value without identity");
    }
    value
}

fn take_transfer_annotation(value: &HostValue) -> Option<Vec<MessagePort>> {
    let identity = value_identity(value)?;
    TRANSFER_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        let index = cache
            .iter()
            .position(|(existing, _)| *existing == identity)?;
        Some(cache.remove(index).1)
    })
}

/// Encode a value for the wire. Returns the wire value and the ports to move
/// with it; port slots in the payload index the returned list, so callers
/// merging several values into one envelope must
/// [rebase](WireValue::rebase_ports) the slots.
pub fn to_wire(
    value: HostValue,
    legacy: bool,
) -> Result<(WireValue, Vec<MessagePort>), WireError> {
    if let Some((name, handler)) = REGISTRY.with(|registry| registry.borrow().find(&value)) {
        let (payload, ports) = handler.serialize(value)?;
        return Ok((WireValue::handler(name, payload, legacy), ports));
    }

    let annotated = take_transfer_annotation(&value).unwrap_or_default();
    let payload = match &value {
        HostValue::Port(port) => {
            let slot = annotated
                .iter()
                .position(|candidate| candidate.same_port(port))
                .ok_or_else(|| {
                    WireError::unserializable(
                        "port was not declared transferable; annotate it with transfer()",
                    )
                })?;
            WirePayload::Port(slot)
        }
        other => WirePayload::Json(
            other
                .clone_to_json()
                .map_err(WireError::unserializable)?,
        ),
    };
    Ok((WireValue::raw(payload, legacy), annotated))
}

/// Decode a wire value against an envelope's transfer list. A legacy tag of
/// either family marks the referenced port's endpoint as legacy, so proxies
/// wrapped over it keep the numeric encoding.
pub fn from_wire(wire: WireValue, ports: &[MessagePort]) -> Result<HostValue, WireError> {
    if wire.tag.is_legacy()
        && let WirePayload::Port(slot) = &wire.value
        && let Some(port) = ports.get(*slot)
    {
        lifetime::mark_legacy(port.id());
    }

    let list = TransferList::new(ports);
    match wire.kind() {
        Some(WireKind::Raw) => match wire.value {
            WirePayload::Json(value) => Ok(HostValue::Data(value)),
            WirePayload::Port(slot) => Ok(HostValue::Port(list.port(slot)?)),
        },
        Some(WireKind::Handler) => {
            let name = wire
                .name
                .ok_or_else(|| WireError::unserializable("HANDLER value without a name"))?;
            let handler = REGISTRY
                .with(|registry| registry.borrow().get(&name))
                .ok_or(WireError::UnknownHandler { name })?;
            handler.deserialize(wire.value, &list)
        }
        None => Err(WireError::unserializable("unknown wire-value tag")),
    }
}

/// Built-in handler for proxy-marked values: spawns a sub-channel, exposes
/// the value on one port, and moves the other.
struct ProxyTransferHandler;

impl TransferHandler for ProxyTransferHandler {
    fn can_handle(&self, value: &HostValue) -> bool {
        match value {
            HostValue::Object(object) => object.is_proxied(),
            HostValue::Function(function) => function.is_proxied(),
            _ => false,
        }
    }

    fn serialize(&self, value: HostValue) -> Result<(WirePayload, Vec<MessagePort>), WireError> {
        let channel = MessageChannel::new();
        // The exposure is live before the transfer completes: messages the
        // peer sends on first access queue on port2 until it starts.
        expose(value, Rc::new(channel.port1.clone()));
        Ok((WirePayload::Port(0), vec![channel.port2]))
    }

    fn deserialize(
        &self,
        payload: WirePayload,
        ports: &TransferList<'_>,
    ) -> Result<HostValue, WireError> {
        let WirePayload::Port(slot) = payload else {
            return Err(WireError::unserializable("proxy payload must be a port"));
        };
        let port = ports.port(slot)?;
        Ok(HostValue::Remote(wrap(Rc::new(port))))
    }
}

/// Built-in handler for thrown markers: errors flatten to
/// `{name, message, stack}`, everything else passes through verbatim.
struct ThrowTransferHandler;

impl TransferHandler for ThrowTransferHandler {
    fn can_handle(&self, value: &HostValue) -> bool {
        value.is_thrown()
    }

    fn serialize(&self, value: HostValue) -> Result<(WirePayload, Vec<MessagePort>), WireError> {
        let HostValue::Thrown(inner) = value else {
            return Err(WireError::unserializable("throw handler fed a non-thrown value"));
        };
        let record = match *inner {
            HostValue::Error(error) => ThrownRecord {
                is_error: true,
                value: serde_json::to_value(error)?,
            },
            other => ThrownRecord {
                is_error: false,
                value: other.clone_to_json().map_err(WireError::unserializable)?,
            },
        };
        Ok((WirePayload::Json(serde_json::to_value(record)?), Vec::new()))
    }

    fn deserialize(
        &self,
        payload: WirePayload,
        _ports: &TransferList<'_>,
    ) -> Result<HostValue, WireError> {
        let WirePayload::Json(value) = payload else {
            return Err(WireError::unserializable("thrown payload must be JSON"));
        };
        let record: ThrownRecord = serde_json::from_value(value)?;
        let inner = if record.is_error {
            match serde_json::from_value::<ErrorObject>(record.value.clone()) {
                Ok(error) => HostValue::Error(error),
                Err(_) => HostValue::Error(ErrorObject::new("Error", record.value.to_string())),
            }
        } else {
            HostValue::Data(record.value)
        };
        Ok(HostValue::Thrown(Box::new(inner)))
    }
}
