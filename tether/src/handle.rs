//! The virtualizing handle and the request/response correlator.
//!
//! [`wrap`] returns a [`RemoteHandle`] rooted at the empty path. Navigation
//! (`get`) is lazy and free of wire traffic; `fetch`, `set`, `call`,
//! `construct`, and `create_endpoint` each perform one request/response
//! round-trip, correlated purely by a per-request opaque id. The correlator
//! never fails a call on its own: errors surface only when the reply decodes
//! to a thrown marker.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use rand::Rng;
use tether_core::message::{Operation, Reply, Request, WireValue};
use tether_core::{CallError, RemoteThrow, WireError};

use crate::channel::{Endpoint, EndpointId, Listener, Message, MessageEvent, MessagePort};
use crate::handlers::{from_wire, to_wire};
use crate::lifetime::{self, ProxyGuard};
use crate::value::HostValue;

/// Generate a call id: four random 52-bit hex chunks, unique for all
/// practical purposes within an endpoint's lifetime.
pub fn new_call_id() -> String {
    const MASK: u64 = (1 << 52) - 1;
    let mut rng = rand::rng();
    let mut id = String::with_capacity(52);
    for _ in 0..4 {
        let chunk: u64 = rng.random::<u64>() & MASK;
        id.push_str(&format!("{chunk:013x}"));
    }
    id
}

/// Wrap an endpoint in a proxy rooted at the empty path.
pub fn wrap(endpoint: Rc<dyn Endpoint>) -> RemoteHandle {
    wrap_with(endpoint, false)
}

/// Wrap an endpoint whose peer speaks the legacy numeric encoding.
pub fn wrap_legacy(endpoint: Rc<dyn Endpoint>) -> RemoteHandle {
    wrap_with(endpoint, true)
}

fn wrap_with(endpoint: Rc<dyn Endpoint>, legacy: bool) -> RemoteHandle {
    if legacy {
        lifetime::mark_legacy(endpoint.id());
    }
    endpoint.start();
    RemoteHandle::root(endpoint)
}

/// Local stand-in for a remote value: an endpoint plus a navigation path.
///
/// Handles are cheap to derive and clone; each live handle counts toward the
/// endpoint's proxy refcount, and the last one dropped releases the
/// endpoint. All handles derived from one [`wrap`] share a released flag, so
/// releasing any of them retires the whole family.
#[derive(Clone)]
pub struct RemoteHandle {
    endpoint: Rc<dyn Endpoint>,
    path: Vec<String>,
    released: Rc<Cell<bool>>,
    _guard: Rc<ProxyGuard>,
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHandle")
            .field("endpoint", &self.endpoint.id())
            .field("path", &self.path)
            .field("released", &self.released.get())
            .finish()
    }
}

impl RemoteHandle {
    fn root(endpoint: Rc<dyn Endpoint>) -> Self {
        let guard = Rc::new(lifetime::register(&endpoint));
        Self {
            endpoint,
            path: Vec::new(),
            released: Rc::new(Cell::new(false)),
            _guard: guard,
        }
    }

    /// The navigation path of this handle.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Identity of the underlying endpoint.
    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// Derive a sub-handle one segment deeper. Pure navigation: no wire
    /// traffic until an operation is invoked on the result.
    pub fn get(&self, key: impl Into<String>) -> RemoteHandle {
        let mut path = self.path.clone();
        path.push(key.into());
        RemoteHandle {
            endpoint: Rc::clone(&self.endpoint),
            path,
            released: Rc::clone(&self.released),
            _guard: Rc::new(lifetime::register(&self.endpoint)),
        }
    }

    /// Binding is a no-op for remote functions; the receiver is always the
    /// path's parent on the remote side.
    pub fn bind(&self) -> RemoteHandle {
        self.clone()
    }

    fn ensure_live(&self) -> Result<(), CallError> {
        if self.released.get() {
            Err(CallError::Released)
        } else {
            Ok(())
        }
    }

    fn legacy(&self) -> bool {
        lifetime::is_legacy(self.endpoint.id())
    }

    /// Read the value at this path: one GET round-trip.
    pub async fn fetch(&self) -> Result<HostValue, CallError> {
        self.ensure_live()?;
        let request = Request::new(
            new_call_id(),
            Operation::Get,
            self.path.clone(),
            self.legacy(),
        );
        let value = round_trip(&self.endpoint, request, Vec::new()).await?;
        settle(value)
    }

    /// Assign under `key` at this path: one SET round-trip resolving once
    /// the remote assignment reports back.
    pub async fn set(&self, key: impl Into<String>, value: HostValue) -> Result<(), CallError> {
        self.ensure_live()?;
        let (wire, ports) = to_wire(value, self.legacy())?;
        let mut path = self.path.clone();
        path.push(key.into());
        let mut request = Request::new(new_call_id(), Operation::Set, path, self.legacy());
        request.value = Some(wire);
        let reply = round_trip(&self.endpoint, request, ports).await?;
        settle(reply).map(|_| ())
    }

    /// Invoke the function at this path: one APPLY round-trip. A terminal
    /// `"bind"` segment never reaches the wire; the call collapses to a
    /// handle one segment up.
    pub async fn call(&self, args: Vec<HostValue>) -> Result<HostValue, CallError> {
        self.ensure_live()?;
        if self.path.last().map(String::as_str) == Some("bind") {
            let mut path = self.path.clone();
            path.pop();
            return Ok(HostValue::Remote(RemoteHandle {
                endpoint: Rc::clone(&self.endpoint),
                path,
                released: Rc::clone(&self.released),
                _guard: Rc::new(lifetime::register(&self.endpoint)),
            }));
        }
        let (wires, ports) = encode_arguments(args, self.legacy())?;
        let mut request = Request::new(
            new_call_id(),
            Operation::Apply,
            self.path.clone(),
            self.legacy(),
        );
        request.argument_list = Some(wires);
        let reply = round_trip(&self.endpoint, request, ports).await?;
        settle(reply)
    }

    /// Invoke the constructor at this path: one CONSTRUCT round-trip. The
    /// instance comes back proxied over its own sub-channel.
    pub async fn construct(&self, args: Vec<HostValue>) -> Result<RemoteHandle, CallError> {
        self.ensure_live()?;
        let (wires, ports) = encode_arguments(args, self.legacy())?;
        let mut request = Request::new(
            new_call_id(),
            Operation::Construct,
            self.path.clone(),
            self.legacy(),
        );
        request.argument_list = Some(wires);
        let reply = round_trip(&self.endpoint, request, ports).await?;
        match settle(reply)? {
            HostValue::Remote(handle) => Ok(handle),
            other => Err(CallError::Protocol {
                message: format!("CONSTRUCT reply was not a proxy: {other:?}"),
            }),
        }
    }

    /// Ask the remote side for a fresh port exposing the same object.
    pub async fn create_endpoint(&self) -> Result<MessagePort, CallError> {
        self.ensure_live()?;
        let request = Request::new(
            new_call_id(),
            Operation::Endpoint,
            Vec::new(),
            self.legacy(),
        );
        let reply = round_trip(&self.endpoint, request, Vec::new()).await?;
        match settle(reply)? {
            HostValue::Port(port) => Ok(port),
            other => Err(CallError::Protocol {
                message: format!("ENDPOINT reply was not a port: {other:?}"),
            }),
        }
    }

    /// Release the proxy family: send RELEASE, await the reply, then close
    /// the endpoint if it is a port-like sub-channel. Every handle sharing
    /// this one's released flag fails from here on.
    pub async fn release(self) -> Result<(), CallError> {
        self.ensure_live()?;
        let request = Request::new(
            new_call_id(),
            Operation::Release,
            Vec::new(),
            self.legacy(),
        );
        let outcome = round_trip(&self.endpoint, request, Vec::new()).await;
        self.released.set(true);
        self._guard.disarm();
        if lifetime::begin_teardown(self.endpoint.id()) && self.endpoint.closeable() {
            self.endpoint.close();
        }
        outcome.and_then(settle).map(|_| ())
    }
}

fn encode_arguments(
    args: Vec<HostValue>,
    legacy: bool,
) -> Result<(Vec<WireValue>, Vec<MessagePort>), CallError> {
    let mut wires = Vec::with_capacity(args.len());
    let mut ports = Vec::new();
    for arg in args {
        let (mut wire, arg_ports) = to_wire(arg, legacy)?;
        wire.rebase_ports(ports.len());
        ports.extend(arg_ports);
        wires.push(wire);
    }
    Ok((wires, ports))
}

/// Decode a settled reply, converting a thrown marker into the call's error.
fn settle(value: HostValue) -> Result<HostValue, CallError> {
    match value {
        HostValue::Thrown(inner) => Err(CallError::Remote(match *inner {
            HostValue::Error(error) => RemoteThrow::Error(error),
            HostValue::Data(raw) => RemoteThrow::Value(raw),
            other => RemoteThrow::Value(serde_json::Value::String(format!("{other:?}"))),
        })),
        value => Ok(value),
    }
}

struct PendingReply {
    reply: Option<(Reply, Vec<MessagePort>)>,
    waker: Option<Waker>,
    listener: Option<crate::channel::ListenerId>,
}

/// Post a request and await the matching reply, then decode it. The one-shot
/// listener ignores every message whose id differs, consumes the first
/// match, and removes itself.
async fn round_trip(
    endpoint: &Rc<dyn Endpoint>,
    request: Request,
    ports: Vec<MessagePort>,
) -> Result<HostValue, CallError> {
    let state = Rc::new(RefCell::new(PendingReply {
        reply: None,
        waker: None,
        listener: None,
    }));

    let expected = request.id.clone();
    let listener: Listener = {
        let state = Rc::clone(&state);
        let endpoint = Rc::clone(endpoint);
        Rc::new(move |event: &MessageEvent| {
            let Ok(reply) = serde_json::from_value::<Reply>(event.data.clone()) else {
                return;
            };
            if reply.id != expected {
                return;
            }
            let mut pending = state.borrow_mut();
            if pending.reply.is_some() {
                return;
            }
            pending.reply = Some((reply, event.ports.clone()));
            if let Some(id) = pending.listener.take() {
                endpoint.unlisten(id);
            }
            if let Some(waker) = pending.waker.take() {
                waker.wake();
            }
        })
    };

    let id = endpoint.listen(listener);
    state.borrow_mut().listener = Some(id);
    endpoint.start();

    let data = serde_json::to_value(&request).map_err(WireError::from)?;
    endpoint.post(Message { data, ports })?;

    let (reply, reply_ports) = ReplyFuture { state }.await;
    Ok(from_wire(reply.value, &reply_ports)?)
}

/// One-shot future resolved by the correlator's listener.
struct ReplyFuture {
    state: Rc<RefCell<PendingReply>>,
}

impl Future for ReplyFuture {
    type Output = (Reply, Vec<MessagePort>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut pending = self.state.borrow_mut();
        if let Some(reply) = pending.reply.take() {
            return Poll::Ready(reply);
        }
        pending.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use serde_json::json;
    use tether_core::message::{WirePayload, WireValue};

    fn reply_to(port: &MessagePort, id: &str, value: serde_json::Value) {
        let reply = Reply {
            id: id.to_string(),
            value: WireValue::raw(WirePayload::Json(value), false),
        };
        port.post(Message::data(
            serde_json::to_value(&reply).expect("serialize reply"),
        ))
        .expect("post reply");
    }

    #[test]
    fn test_call_ids_are_distinct_hex() {
        let a = new_call_id();
        let b = new_call_id();
        assert_eq!(a.len(), 52);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_get_is_pure_navigation() {
        let channel = MessageChannel::new();
        let seen = Rc::new(RefCell::new(0u32));
        let sink = Rc::clone(&seen);
        channel.port2.listen(Rc::new(move |_event: &MessageEvent| {
            *sink.borrow_mut() += 1;
        }));
        channel.port2.start();

        let handle = wrap(Rc::new(channel.port1.clone()));
        let deep = handle.get("a").get("b").get("c");
        assert_eq!(deep.path(), ["a", "b", "c"]);
        assert_eq!(*seen.borrow(), 0);
    }

    #[test]
    fn test_handles_count_toward_refcount() {
        let channel = MessageChannel::new();
        let handle = wrap(Rc::new(channel.port1.clone()));
        let id = handle.endpoint_id();
        assert_eq!(lifetime::proxy_count(id), 1);

        let sub = handle.get("a");
        assert_eq!(lifetime::proxy_count(id), 2);

        drop(sub);
        assert_eq!(lifetime::proxy_count(id), 1);
    }

    #[tokio::test]
    async fn test_round_trip_matches_by_id() {
        let channel = MessageChannel::new();
        let responder = channel.port2.clone();

        // Answer each request by echoing its path length, after first
        // replying to a different id that must be ignored.
        channel.port2.listen(Rc::new(move |event: &MessageEvent| {
            let request: Request =
                serde_json::from_value(event.data.clone()).expect("request shape");
            reply_to(&responder, "bogus", json!("ignore me"));
            reply_to(&responder, &request.id, json!(request.path.len()));
        }));
        channel.port2.start();

        let handle = wrap(Rc::new(channel.port1.clone()));
        let value = handle.get("a").get("b").fetch().await.expect("fetch");
        assert_eq!(value.as_json(), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_out_of_order() {
        let channel = MessageChannel::new();
        let server = channel.port2.clone();
        let held: Rc<RefCell<Vec<Request>>> = Rc::new(RefCell::new(Vec::new()));

        let queue = Rc::clone(&held);
        server.listen(Rc::new(move |event: &MessageEvent| {
            let request: Request =
                serde_json::from_value(event.data.clone()).expect("request shape");
            queue.borrow_mut().push(request);
        }));
        channel.port2.start();

        let handle = wrap(Rc::new(channel.port1.clone()));
        let one_ref = handle.get("one");
        let two_ref = handle.get("two");
        let first = one_ref.fetch();
        let second = two_ref.fetch();
        let mut first = Box::pin(first);
        let mut second = Box::pin(second);

        // Drive both futures once so the requests go out.
        futures_poll_once(&mut first).await;
        futures_poll_once(&mut second).await;
        assert_eq!(held.borrow().len(), 2);

        // Reply in reverse order.
        let requests = held.borrow().clone();
        reply_to(&channel.port2, &requests[1].id, json!("two"));
        reply_to(&channel.port2, &requests[0].id, json!("one"));

        assert_eq!(
            second.await.expect("second").as_json(),
            Some(&json!("two"))
        );
        assert_eq!(first.await.expect("first").as_json(), Some(&json!("one")));
    }

    async fn futures_poll_once<F: Future + Unpin>(future: &mut F) {
        std::future::poll_fn(|cx| {
            let _ = Pin::new(&mut *future).poll(cx);
            Poll::Ready(())
        })
        .await;
    }

    #[tokio::test]
    async fn test_released_handle_fails_synchronously() {
        let channel = MessageChannel::new();
        let responder = channel.port2.clone();
        channel.port2.listen(Rc::new(move |event: &MessageEvent| {
            let request: Request =
                serde_json::from_value(event.data.clone()).expect("request shape");
            reply_to(&responder, &request.id, json!(null));
        }));
        channel.port2.start();

        let handle = wrap(Rc::new(channel.port1.clone()));
        let sibling = handle.get("x");
        handle.release().await.expect("release");

        let error = sibling.fetch().await.expect_err("must be released");
        assert!(matches!(error, CallError::Released));
        assert_eq!(
            error.to_string(),
            "Proxy has been released and is not useable"
        );
        assert!(channel.port1.is_closed());
    }

    #[tokio::test]
    async fn test_bind_is_a_no_op() {
        let channel = MessageChannel::new();
        let handle = wrap(Rc::new(channel.port1.clone()));

        let via_method = handle.get("foo").bind();
        assert_eq!(via_method.path(), ["foo"]);

        // The terminal "bind" segment collapses without wire traffic.
        let via_segment = handle
            .get("foo")
            .get("bind")
            .call(vec![HostValue::Data(json!(null))])
            .await
            .expect("bind call");
        assert_eq!(
            via_segment.as_remote().expect("remote").path(),
            ["foo"]
        );
    }
}
