//! The dynamic value model both sides of a channel evaluate against.
//!
//! Rust has no host-provided dynamic objects, so the universe of values a
//! proxy can reach is spelled out here: structured-clone-safe data, mutable
//! member objects, async-capable functions, constructors, transferable
//! ports, remote handles, and the thrown marker. [`HostObject`] and
//! [`HostFunction`] carry the proxy marker; [`HostObject`] may also carry a
//! finalizer hook, invoked once after its exposure receives RELEASE.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use tether_core::ErrorObject;

use crate::channel::{Endpoint, MessagePort};
use crate::handle::RemoteHandle;

/// Outcome of a host function: the return value, or the thrown value.
pub type HostResult = Result<HostValue, HostValue>;

/// Boxed future returned by host functions.
pub type HostFuture = Pin<Box<dyn Future<Output = HostResult>>>;

/// A value that can live in an exposed object graph or cross the wire.
#[derive(Clone)]
pub enum HostValue {
    /// Structured-clone-safe data.
    Data(serde_json::Value),
    /// An error-like object; clones as `{name, message, stack}`.
    Error(ErrorObject),
    /// A mutable object with named members.
    Object(Rc<HostObject>),
    /// A callable. Only crosses the wire when proxy-marked.
    Function(Rc<HostFunction>),
    /// A constructible. CONSTRUCT stamps the instance with the proxy marker.
    Constructor(Rc<HostConstructor>),
    /// One half of a message channel; crosses the wire by transfer.
    Port(MessagePort),
    /// A proxy over a dedicated sub-channel (the deserialized form of a
    /// proxy-marked value).
    Remote(RemoteHandle),
    /// The thrown marker, wrapping the raised value.
    Thrown(Box<HostValue>),
}

impl HostValue {
    /// The empty value.
    pub fn null() -> Self {
        HostValue::Data(serde_json::Value::Null)
    }

    /// An error-like value with no stack.
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        HostValue::Error(ErrorObject::new(name, message))
    }

    /// The JSON payload, for data values.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            HostValue::Data(value) => Some(value),
            _ => None,
        }
    }

    /// The object, for object values.
    pub fn as_object(&self) -> Option<&Rc<HostObject>> {
        match self {
            HostValue::Object(object) => Some(object),
            _ => None,
        }
    }

    /// The remote handle, for proxy values.
    pub fn as_remote(&self) -> Option<&RemoteHandle> {
        match self {
            HostValue::Remote(handle) => Some(handle),
            _ => None,
        }
    }

    /// The port, for transferable values.
    pub fn as_port(&self) -> Option<&MessagePort> {
        match self {
            HostValue::Port(port) => Some(port),
            _ => None,
        }
    }

    /// Whether this value carries the thrown marker.
    pub fn is_thrown(&self) -> bool {
        matches!(self, HostValue::Thrown(_))
    }

    /// Deep-convert to a JSON tree, the clone half of structured clone.
    ///
    /// Fails with a reason for values the channel cannot clone: functions,
    /// constructors, remote handles, thrown markers, and ports (ports move
    /// as standalone transferables, never inside a cloned tree).
    pub fn clone_to_json(&self) -> Result<serde_json::Value, String> {
        match self {
            HostValue::Data(value) => Ok(value.clone()),
            HostValue::Error(error) => {
                serde_json::to_value(error).map_err(|error| error.to_string())
            }
            HostValue::Object(object) => {
                let members = object.members.borrow();
                let mut map = serde_json::Map::with_capacity(members.len());
                for (key, member) in members.iter() {
                    map.insert(key.clone(), member.clone_to_json()?);
                }
                Ok(serde_json::Value::Object(map))
            }
            HostValue::Function(_) => Err("functions cannot be cloned; mark with proxy()".into()),
            HostValue::Constructor(_) => Err("constructors cannot be cloned".into()),
            HostValue::Port(_) => {
                Err("ports must be transferred as standalone values, not cloned".into())
            }
            HostValue::Remote(_) => Err("remote handles cannot be re-serialized".into()),
            HostValue::Thrown(_) => Err("thrown markers cannot be cloned".into()),
        }
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        HostValue::Data(value)
    }
}

impl std::fmt::Debug for HostValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostValue::Data(value) => f.debug_tuple("Data").field(value).finish(),
            HostValue::Error(error) => f.debug_tuple("Error").field(error).finish(),
            HostValue::Object(object) => f
                .debug_struct("Object")
                .field("proxied", &object.is_proxied())
                .field("members", &object.members.borrow().len())
                .finish(),
            HostValue::Function(function) => f
                .debug_struct("Function")
                .field("proxied", &function.is_proxied())
                .finish(),
            HostValue::Constructor(_) => f.write_str("Constructor"),
            HostValue::Port(port) => f.debug_tuple("Port").field(&port.id()).finish(),
            HostValue::Remote(handle) => f.debug_tuple("Remote").field(handle).finish(),
            HostValue::Thrown(inner) => f.debug_tuple("Thrown").field(inner).finish(),
        }
    }
}

/// Arguments to a host function invocation. APPLY passes the path's parent
/// object as the receiver.
pub struct CallContext {
    /// The object the function was reached through, if any.
    pub receiver: Option<Rc<HostObject>>,
    /// Decoded argument list.
    pub args: Vec<HostValue>,
}

/// An async-capable callable.
pub struct HostFunction {
    call: Box<dyn Fn(CallContext) -> HostFuture>,
    proxied: Cell<bool>,
}

impl HostFunction {
    /// A function returning a future.
    pub fn new(call: impl Fn(CallContext) -> HostFuture + 'static) -> Rc<Self> {
        Rc::new(Self {
            call: Box::new(call),
            proxied: Cell::new(false),
        })
    }

    /// A synchronous function, lifted into an immediately-ready future.
    pub fn sync(call: impl Fn(CallContext) -> HostResult + 'static) -> Rc<Self> {
        Self::new(move |context| {
            let outcome = call(context);
            Box::pin(async move { outcome })
        })
    }

    /// Invoke with the given context.
    pub fn invoke(&self, context: CallContext) -> HostFuture {
        (self.call)(context)
    }

    /// Whether the proxy marker is set.
    pub fn is_proxied(&self) -> bool {
        self.proxied.get()
    }

    pub(crate) fn mark_proxied(&self) {
        self.proxied.set(true);
    }
}

/// A constructible. Invoked by CONSTRUCT; the exposer stamps the instance
/// with the proxy marker before replying.
pub struct HostConstructor {
    construct: Box<dyn Fn(Vec<HostValue>) -> Result<Rc<HostObject>, HostValue>>,
}

impl HostConstructor {
    /// A constructor from a closure over the decoded argument list.
    pub fn new(
        construct: impl Fn(Vec<HostValue>) -> Result<Rc<HostObject>, HostValue> + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            construct: Box::new(construct),
        })
    }

    /// Invoke as a constructor.
    pub fn construct(&self, args: Vec<HostValue>) -> Result<Rc<HostObject>, HostValue> {
        (self.construct)(args)
    }
}

type Finalizer = Box<dyn FnOnce(&HostObject)>;

/// A mutable object with named members, built with the `with_*` methods and
/// mutated at runtime through [`HostObject::set_member`].
#[derive(Default)]
pub struct HostObject {
    members: RefCell<BTreeMap<String, HostValue>>,
    proxied: Cell<bool>,
    finalizer: RefCell<Option<Finalizer>>,
}

impl HostObject {
    /// An empty object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a data member.
    pub fn with_data(self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.with_value(key, HostValue::Data(value))
    }

    /// Add a member of any kind.
    pub fn with_value(self, key: impl Into<String>, value: HostValue) -> Self {
        self.members.borrow_mut().insert(key.into(), value);
        self
    }

    /// Add a synchronous method.
    pub fn with_method(
        self,
        key: impl Into<String>,
        call: impl Fn(CallContext) -> HostResult + 'static,
    ) -> Self {
        self.with_value(key, HostValue::Function(HostFunction::sync(call)))
    }

    /// Add an async method.
    pub fn with_async_method(
        self,
        key: impl Into<String>,
        call: impl Fn(CallContext) -> HostFuture + 'static,
    ) -> Self {
        self.with_value(key, HostValue::Function(HostFunction::new(call)))
    }

    /// Add a constructor member.
    pub fn with_constructor(
        self,
        key: impl Into<String>,
        construct: impl Fn(Vec<HostValue>) -> Result<Rc<HostObject>, HostValue> + 'static,
    ) -> Self {
        self.with_value(key, HostValue::Constructor(HostConstructor::new(construct)))
    }

    /// Install the finalizer hook, invoked exactly once after this object's
    /// exposure receives RELEASE.
    pub fn with_finalizer(self, finalizer: impl FnOnce(&HostObject) + 'static) -> Self {
        *self.finalizer.borrow_mut() = Some(Box::new(finalizer));
        self
    }

    /// Finish building.
    pub fn into_value(self) -> HostValue {
        HostValue::Object(Rc::new(self))
    }

    /// Read a member. Clones the handle, not the underlying object.
    pub fn member(&self, key: &str) -> Option<HostValue> {
        self.members.borrow().get(key).cloned()
    }

    /// Insert or replace a member.
    pub fn set_member(&self, key: impl Into<String>, value: HostValue) {
        self.members.borrow_mut().insert(key.into(), value);
    }

    /// Mutate a member in place. Returns `None` when the member is absent.
    pub fn update_member<R>(&self, key: &str, update: impl FnOnce(&mut HostValue) -> R) -> Option<R> {
        self.members.borrow_mut().get_mut(key).map(update)
    }

    /// Whether the proxy marker is set.
    pub fn is_proxied(&self) -> bool {
        self.proxied.get()
    }

    pub(crate) fn mark_proxied(&self) {
        self.proxied.set(true);
    }

    pub(crate) fn take_finalizer(&self) -> Option<Finalizer> {
        self.finalizer.borrow_mut().take()
    }
}

/// Stamp the proxy marker: when this value is serialized it routes through a
/// fresh sub-channel instead of being cloned. Returns the value unchanged;
/// values that cannot carry the marker pass through untouched.
pub fn proxy(value: HostValue) -> HostValue {
    match &value {
        HostValue::Object(object) => object.mark_proxied(),
        HostValue::Function(function) => function.mark_proxied(),
        _ => {}
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_members_and_mutation() {
        let value = HostObject::new()
            .with_data("counter", json!(0))
            .with_data("name", json!("c"))
            .into_value();
        let object = value.as_object().expect("object");

        assert_eq!(
            object.member("counter").and_then(|v| v.as_json().cloned()),
            Some(json!(0))
        );
        object.set_member("counter", HostValue::Data(json!(3)));
        assert_eq!(
            object.member("counter").and_then(|v| v.as_json().cloned()),
            Some(json!(3))
        );
        assert!(object.member("missing").is_none());
    }

    #[test]
    fn test_clone_to_json_plain_tree() {
        let value = HostObject::new()
            .with_data("a", json!({"b": 5}))
            .with_value("nested", HostObject::new().with_data("x", json!(1)).into_value())
            .into_value();
        assert_eq!(
            value.clone_to_json().expect("clone"),
            json!({"a": {"b": 5}, "nested": {"x": 1}})
        );
    }

    #[test]
    fn test_clone_to_json_rejects_functions() {
        let value = HostObject::new()
            .with_method("f", |_| Ok(HostValue::null()))
            .into_value();
        let reason = value.clone_to_json().expect_err("should reject");
        assert!(reason.contains("proxy()"));
    }

    #[test]
    fn test_error_value_clones_flat() {
        let value = HostValue::error("RangeError", "nope");
        assert_eq!(
            value.clone_to_json().expect("clone"),
            json!({"name": "RangeError", "message": "nope"})
        );
    }

    #[test]
    fn test_proxy_marks_objects_and_functions() {
        let object = proxy(HostObject::new().into_value());
        assert!(object.as_object().expect("object").is_proxied());

        let function = proxy(HostValue::Function(HostFunction::sync(|_| {
            Ok(HostValue::null())
        })));
        match function {
            HostValue::Function(f) => assert!(f.is_proxied()),
            other => panic!("unexpected value: {other:?}"),
        }

        // Data passes through untouched.
        let data = proxy(HostValue::Data(json!(1)));
        assert_eq!(data.as_json(), Some(&json!(1)));
    }

    #[test]
    fn test_finalizer_taken_once() {
        let object = Rc::new(
            HostObject::new()
                .with_data("cleanup", json!(0))
                .with_finalizer(|this| {
                    this.set_member("cleanup", HostValue::Data(json!(1)));
                }),
        );
        let finalizer = object.take_finalizer().expect("finalizer present");
        finalizer(&object);
        assert_eq!(
            object.member("cleanup").and_then(|v| v.as_json().cloned()),
            Some(json!(1))
        );
        assert!(object.take_finalizer().is_none());
    }

    #[tokio::test]
    async fn test_sync_function_lifts_to_future() {
        let function = HostFunction::sync(|context| {
            let doubled = context.args[0]
                .as_json()
                .and_then(|v| v.as_i64())
                .map(|n| n * 2)
                .ok_or_else(|| HostValue::error("TypeError", "expected a number"))?;
            Ok(HostValue::Data(json!(doubled)))
        });
        let outcome = function
            .invoke(CallContext {
                receiver: None,
                args: vec![HostValue::Data(json!(21))],
            })
            .await;
        assert_eq!(
            outcome.expect("ok").as_json().cloned(),
            Some(json!(42))
        );
    }
}
