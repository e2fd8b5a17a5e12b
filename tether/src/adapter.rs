//! Endpoint adapters over foreign channel shapes.
//!
//! [`DirectedEndpoint`] is the window-style adapter: it posts into one
//! context (origin-qualified) and listens in another. [`MpscEndpoint`]
//! adapts a tokio unbounded channel pair for worker-thread-style plumbing
//! that clones data but cannot move ports.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tether_core::ChannelError;
use tokio::sync::mpsc;

use crate::channel::{
    next_endpoint_id, Endpoint, EndpointId, Listener, ListenerId, Message, MessageEvent,
    MessagePort,
};

/// Window-style endpoint: posts to a target context through one port,
/// qualified by a target origin, and listens on another.
///
/// Posts whose target context does not match `target_origin` are discarded
/// silently, the way an origin-qualified window post would be. Outbound
/// events are stamped with the listening context's origin.
pub struct DirectedEndpoint {
    id: EndpointId,
    post_to: MessagePort,
    listen_on: MessagePort,
    target_origin: String,
}

/// Synthesize a window-style endpoint from a posting port, a listening
/// context, and a target origin (`"*"` to skip the check).
pub fn directed_endpoint(
    post_to: MessagePort,
    listen_on: MessagePort,
    target_origin: impl Into<String>,
) -> Rc<DirectedEndpoint> {
    Rc::new(DirectedEndpoint {
        id: next_endpoint_id(),
        post_to,
        listen_on,
        target_origin: target_origin.into(),
    })
}

impl Endpoint for DirectedEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn post(&self, message: Message) -> Result<(), ChannelError> {
        if self.target_origin != "*"
            && self.post_to.peer_context_origin().as_deref() != Some(self.target_origin.as_str())
        {
            tracing::debug!(
                endpoint = %self.id,
                target = %self.target_origin,
                "discarding post to non-matching target origin"
            );
            return Ok(());
        }
        let origin = self.listen_on.context_origin();
        self.post_to.post_from(message.data, message.ports, origin)
    }

    fn listen(&self, listener: Listener) -> ListenerId {
        self.listen_on.listen(listener)
    }

    fn unlisten(&self, listener: ListenerId) {
        self.listen_on.unlisten(listener);
    }

    fn start(&self) {
        self.listen_on.start();
    }
}

/// Endpoint over a tokio unbounded channel pair. Data-only: the channel has
/// no transfer mechanism, so posting a message with ports fails with
/// [`ChannelError::TransferUnsupported`], and proxy-marked values cannot
/// cross it.
pub struct MpscEndpoint {
    id: EndpointId,
    sender: mpsc::UnboundedSender<serde_json::Value>,
    receiver: RefCell<Option<mpsc::UnboundedReceiver<serde_json::Value>>>,
    listeners: Rc<RefCell<Vec<(ListenerId, Listener)>>>,
    next_listener: Cell<u64>,
    started: Cell<bool>,
}

impl MpscEndpoint {
    /// Build one endpoint from a send/receive pair.
    pub fn new(
        sender: mpsc::UnboundedSender<serde_json::Value>,
        receiver: mpsc::UnboundedReceiver<serde_json::Value>,
    ) -> Rc<Self> {
        Rc::new(Self {
            id: next_endpoint_id(),
            sender,
            receiver: RefCell::new(Some(receiver)),
            listeners: Rc::new(RefCell::new(Vec::new())),
            next_listener: Cell::new(1),
            started: Cell::new(false),
        })
    }
}

/// Two cross-wired [`MpscEndpoint`]s, the in-process analog of a worker
/// boundary.
pub fn mpsc_endpoint_pair() -> (Rc<MpscEndpoint>, Rc<MpscEndpoint>) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    (MpscEndpoint::new(tx_a, rx_b), MpscEndpoint::new(tx_b, rx_a))
}

impl Endpoint for MpscEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn post(&self, message: Message) -> Result<(), ChannelError> {
        if !message.ports.is_empty() {
            return Err(ChannelError::TransferUnsupported);
        }
        self.sender
            .send(message.data)
            .map_err(|_| ChannelError::Closed)
    }

    fn listen(&self, listener: Listener) -> ListenerId {
        let id = ListenerId::from_raw(self.next_listener.get());
        self.next_listener.set(self.next_listener.get() + 1);
        self.listeners.borrow_mut().push((id, listener));
        id
    }

    fn unlisten(&self, listener: ListenerId) {
        self.listeners
            .borrow_mut()
            .retain(|(id, _)| *id != listener);
    }

    /// Spawn the pump task on first start; later starts are no-ops.
    fn start(&self) {
        if self.started.get() {
            return;
        }
        self.started.set(true);
        let Some(mut receiver) = self.receiver.borrow_mut().take() else {
            return;
        };
        let listeners = Rc::clone(&self.listeners);
        tokio::task::spawn_local(async move {
            while let Some(data) = receiver.recv().await {
                let event = MessageEvent {
                    data,
                    ports: Vec::new(),
                    origin: None,
                };
                let snapshot: Vec<Listener> = listeners
                    .borrow()
                    .iter()
                    .map(|(_, listener)| Rc::clone(listener))
                    .collect();
                for listener in snapshot {
                    listener(&event);
                }
            }
        });
    }
}
