//! Per-endpoint lifetime bookkeeping.
//!
//! Two tables, both keyed by [`EndpointId`]: a refcount of live local
//! proxies, and the legacy-encoding membership set. Every proxy handle owns
//! a [`ProxyGuard`]; dropping the last guard for an endpoint fires RELEASE
//! and closes the endpoint if it is a port-like sub-channel. Explicit
//! release goes through [`begin_teardown`] first so teardown happens at most
//! once per endpoint.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tether_core::message::{Operation, Request};

use crate::channel::{Endpoint, EndpointId, Message};
use crate::handle::new_call_id;

thread_local! {
    static REFCOUNTS: RefCell<HashMap<EndpointId, usize>> = RefCell::new(HashMap::new());
    static TORN_DOWN: RefCell<HashSet<EndpointId>> = RefCell::new(HashSet::new());
    static LEGACY: RefCell<HashSet<EndpointId>> = RefCell::new(HashSet::new());
}

/// Mark an endpoint as using the legacy numeric encoding.
pub fn mark_legacy(id: EndpointId) {
    LEGACY.with(|legacy| legacy.borrow_mut().insert(id));
}

/// Whether an endpoint uses the legacy numeric encoding.
pub fn is_legacy(id: EndpointId) -> bool {
    LEGACY.with(|legacy| legacy.borrow().contains(&id))
}

/// Number of live proxies registered against an endpoint.
pub fn proxy_count(id: EndpointId) -> usize {
    REFCOUNTS.with(|counts| counts.borrow().get(&id).copied().unwrap_or(0))
}

/// Record that teardown for this endpoint is happening now. Returns `false`
/// if it already happened.
pub(crate) fn begin_teardown(id: EndpointId) -> bool {
    TORN_DOWN.with(|torn| torn.borrow_mut().insert(id))
}

/// Register one live proxy against the endpoint.
pub(crate) fn register(endpoint: &Rc<dyn Endpoint>) -> ProxyGuard {
    let id = endpoint.id();
    REFCOUNTS.with(|counts| *counts.borrow_mut().entry(id).or_insert(0) += 1);
    ProxyGuard {
        endpoint: Rc::clone(endpoint),
        armed: Cell::new(true),
    }
}

/// Ownership token for one live proxy. Dropping the last guard for an
/// endpoint fires the automatic RELEASE path.
pub struct ProxyGuard {
    endpoint: Rc<dyn Endpoint>,
    armed: Cell<bool>,
}

impl ProxyGuard {
    /// Keep the drop-side decrement but skip the automatic RELEASE; used by
    /// explicit release, which has already sent it.
    pub(crate) fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for ProxyGuard {
    fn drop(&mut self) {
        let id = self.endpoint.id();
        let remaining = REFCOUNTS.with(|counts| {
            let mut counts = counts.borrow_mut();
            match counts.get_mut(&id) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    let remaining = *count;
                    if remaining == 0 {
                        counts.remove(&id);
                    }
                    remaining
                }
                None => 0,
            }
        });
        if remaining == 0 && self.armed.get() && begin_teardown(id) {
            release_endpoint(&self.endpoint);
        }
    }
}

/// Fire-and-forget RELEASE, then close port-like endpoints. The reply is not
/// awaited; this runs from drop contexts.
fn release_endpoint(endpoint: &Rc<dyn Endpoint>) {
    let id = endpoint.id();
    tracing::debug!(endpoint = %id, "releasing endpoint on last proxy drop");
    let request = Request::new(new_call_id(), Operation::Release, Vec::new(), is_legacy(id));
    match serde_json::to_value(&request) {
        Ok(data) => {
            if let Err(error) = endpoint.post(Message::data(data)) {
                tracing::debug!(endpoint = %id, %error, "release message not delivered");
            }
        }
        Err(error) => tracing::debug!(endpoint = %id, %error, "failed to encode release"),
    }
    if endpoint.closeable() {
        endpoint.close();
    }
}
