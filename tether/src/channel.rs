//! Endpoint contract and in-memory message channels.
//!
//! An [`Endpoint`] is the minimal capability set the engine needs from a
//! bidirectional channel: post a message with optional transferables,
//! subscribe/unsubscribe to inbound events, and optional start/close.
//! [`MessageChannel`] is the built-in implementation: two entangled
//! [`MessagePort`]s sharing a pair of inboxes. Ports queue inbound events
//! until started, and transferring a port *moves* it: the sender's handle is
//! neutered and the receiver re-materializes a live one.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tether_core::ChannelError;

/// Identity of an endpoint, keying the lifetime tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

thread_local! {
    static NEXT_ENDPOINT_ID: Cell<u64> = const { Cell::new(1) };
}

/// Allocate a fresh endpoint id. Endpoint implementations outside this crate
/// call this once at construction.
pub fn next_endpoint_id() -> EndpointId {
    NEXT_ENDPOINT_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        EndpointId(id)
    })
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Build from a raw counter value. Endpoint implementations outside this
    /// module allocate their own listener ids.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Inbound-event callback.
pub type Listener = Rc<dyn Fn(&MessageEvent)>;

/// An outbound message: the serialized payload plus its transfer list.
#[derive(Debug)]
pub struct Message {
    /// Serialized payload; crossing the channel deep-copies it.
    pub data: serde_json::Value,
    /// Ports to move with the message. Each is neutered on the sending side
    /// once the post succeeds.
    pub ports: Vec<MessagePort>,
}

impl Message {
    /// A message with an empty transfer list.
    pub fn data(data: serde_json::Value) -> Self {
        Self {
            data,
            ports: Vec::new(),
        }
    }
}

/// An inbound event delivered to listeners.
#[derive(Debug)]
pub struct MessageEvent {
    /// The payload.
    pub data: serde_json::Value,
    /// Ports moved with the message, live on this side.
    pub ports: Vec<MessagePort>,
    /// Origin of the sending context; `None` on origin-less channels.
    pub origin: Option<String>,
}

/// Minimal contract over a bidirectional channel.
pub trait Endpoint {
    /// Identity for the lifetime and legacy-encoding tables.
    fn id(&self) -> EndpointId;

    /// Post a message, moving any ports in its transfer list.
    fn post(&self, message: Message) -> Result<(), ChannelError>;

    /// Register a listener for inbound events.
    fn listen(&self, listener: Listener) -> ListenerId;

    /// Remove a previously registered listener.
    fn unlisten(&self, listener: ListenerId);

    /// Begin delivering queued events. Idempotent.
    fn start(&self) {}

    /// Tear the endpoint down.
    fn close(&self) {}

    /// Capability probe: whether [`Endpoint::close`] actually tears down a
    /// port-like sub-channel.
    fn closeable(&self) -> bool {
        false
    }
}

struct PortState {
    id: EndpointId,
    peer: RefCell<Weak<PortState>>,
    inbox: RefCell<VecDeque<MessageEvent>>,
    listeners: RefCell<Vec<(ListenerId, Listener)>>,
    next_listener: Cell<u64>,
    started: Cell<bool>,
    closed: Cell<bool>,
    delivering: Cell<bool>,
    generation: Cell<u64>,
    context_origin: RefCell<Option<String>>,
}

impl PortState {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            id: next_endpoint_id(),
            peer: RefCell::new(Weak::new()),
            inbox: RefCell::new(VecDeque::new()),
            listeners: RefCell::new(Vec::new()),
            next_listener: Cell::new(1),
            started: Cell::new(false),
            closed: Cell::new(false),
            delivering: Cell::new(false),
            generation: Cell::new(0),
            context_origin: RefCell::new(None),
        })
    }

    fn push_event(self: &Rc<Self>, event: MessageEvent) {
        if self.closed.get() {
            return;
        }
        self.inbox.borrow_mut().push_back(event);
        self.flush();
    }

    /// Deliver queued events to the current listener set. Guarded against
    /// reentry: a listener that triggers another delivery only enqueues, and
    /// the outer loop drains.
    fn flush(self: &Rc<Self>) {
        if self.delivering.get() || !self.started.get() || self.closed.get() {
            return;
        }
        self.delivering.set(true);
        loop {
            let Some(event) = self.inbox.borrow_mut().pop_front() else {
                break;
            };
            let listeners: Vec<Listener> = self
                .listeners
                .borrow()
                .iter()
                .map(|(_, listener)| Rc::clone(listener))
                .collect();
            for listener in listeners {
                listener(&event);
            }
        }
        self.delivering.set(false);
    }
}

/// One half of a [`MessageChannel`]. Cloning yields another handle to the
/// same half; transferring the port invalidates all prior handles.
#[derive(Clone)]
pub struct MessagePort {
    state: Rc<PortState>,
    generation: u64,
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.state.id)
            .field("neutered", &self.is_neutered())
            .field("closed", &self.state.closed.get())
            .finish()
    }
}

impl MessagePort {
    fn from_state(state: Rc<PortState>) -> Self {
        let generation = state.generation.get();
        Self { state, generation }
    }

    /// Whether this handle has been invalidated by a transfer.
    pub fn is_neutered(&self) -> bool {
        self.generation != self.state.generation.get()
    }

    /// Whether the port has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.closed.get()
    }

    /// Origin of the context holding this port, stamped on events it sends
    /// through origin-aware adapters.
    pub fn context_origin(&self) -> Option<String> {
        self.state.context_origin.borrow().clone()
    }

    /// Declare the origin of the context holding this port.
    pub fn set_context_origin(&self, origin: Option<String>) {
        *self.state.context_origin.borrow_mut() = origin;
    }

    pub(crate) fn peer_context_origin(&self) -> Option<String> {
        self.state
            .peer
            .borrow()
            .upgrade()
            .and_then(|peer| peer.context_origin.borrow().clone())
    }

    /// Pointer identity of the underlying port, shared by all handles.
    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.state) as usize
    }

    /// Whether two handles refer to the same underlying port.
    pub fn same_port(&self, other: &MessagePort) -> bool {
        self.identity() == other.identity()
    }

    fn live(&self) -> Result<(), ChannelError> {
        if self.is_neutered() {
            Err(ChannelError::Neutered)
        } else {
            Ok(())
        }
    }

    /// Move the port: invalidate every existing handle (including `self`),
    /// drop its listener set and started flag, and return the handle the
    /// receiving side will use. Queued events survive the move.
    pub(crate) fn ship(&self) -> Result<MessagePort, ChannelError> {
        self.live()?;
        let state = &self.state;
        state.generation.set(state.generation.get() + 1);
        state.listeners.borrow_mut().clear();
        state.started.set(false);
        Ok(MessagePort::from_state(Rc::clone(state)))
    }

    pub(crate) fn post_from(
        &self,
        data: serde_json::Value,
        ports: Vec<MessagePort>,
        origin: Option<String>,
    ) -> Result<(), ChannelError> {
        self.live()?;
        let shipped: Vec<MessagePort> = ports
            .iter()
            .map(MessagePort::ship)
            .collect::<Result<_, _>>()?;
        if self.state.closed.get() {
            // Posting on a closed port discards silently; the transfer list
            // is still consumed.
            return Ok(());
        }
        let Some(peer) = self.state.peer.borrow().upgrade() else {
            return Ok(());
        };
        peer.push_event(MessageEvent {
            data,
            ports: shipped,
            origin,
        });
        Ok(())
    }
}

impl Endpoint for MessagePort {
    fn id(&self) -> EndpointId {
        self.state.id
    }

    fn post(&self, message: Message) -> Result<(), ChannelError> {
        let origin = self.context_origin();
        self.post_from(message.data, message.ports, origin)
    }

    fn listen(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.state.next_listener.get());
        self.state.next_listener.set(id.0 + 1);
        if self.is_neutered() {
            return id;
        }
        self.state.listeners.borrow_mut().push((id, listener));
        id
    }

    fn unlisten(&self, listener: ListenerId) {
        self.state
            .listeners
            .borrow_mut()
            .retain(|(id, _)| *id != listener);
    }

    fn start(&self) {
        if self.is_neutered() || self.state.started.get() {
            return;
        }
        self.state.started.set(true);
        self.state.flush();
    }

    fn close(&self) {
        self.state.closed.set(true);
        self.state.inbox.borrow_mut().clear();
        self.state.listeners.borrow_mut().clear();
    }

    fn closeable(&self) -> bool {
        true
    }
}

/// An in-memory duplex channel: two entangled ports.
pub struct MessageChannel {
    /// First half.
    pub port1: MessagePort,
    /// Second half.
    pub port2: MessagePort,
}

impl MessageChannel {
    /// Allocate a fresh channel. Both ports queue events until started.
    pub fn new() -> Self {
        let state1 = PortState::new();
        let state2 = PortState::new();
        *state1.peer.borrow_mut() = Rc::downgrade(&state2);
        *state2.peer.borrow_mut() = Rc::downgrade(&state1);
        Self {
            port1: MessagePort::from_state(state1),
            port2: MessagePort::from_state(state2),
        }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}
