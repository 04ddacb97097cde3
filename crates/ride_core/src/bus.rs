//! Room-scoped real-time event bus.
//!
//! Each authenticated connection owns a bounded inbox. Rooms map a [`Topic`]
//! to the connections subscribed to it; publishing copies the event into
//! every member's inbox with `try_send`. Delivery is best-effort and
//! at-most-once: a full or closed inbox drops the event, and consumers are
//! expected to re-fetch authoritative state from the store.
//!
//! There is no global broadcast. Offers reach a driver's personal channel,
//! availability reaches the region room, and ride updates reach the ride room.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::auth::{IdentityProvider, Principal, Role};
use crate::config::BusConfig;
use crate::error::Result;
use crate::events::{Envelope, RideEvent, Topic};
use crate::geo::GeoPoint;

/// Identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

#[derive(Default)]
struct BusState {
    inboxes: HashMap<ConnectionId, mpsc::Sender<Envelope>>,
    rooms: HashMap<Topic, HashSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashSet<Topic>>,
}

impl BusState {
    fn join(&mut self, conn: ConnectionId, topic: Topic) -> bool {
        if !self.inboxes.contains_key(&conn) {
            return false;
        }
        self.rooms.entry(topic).or_default().insert(conn);
        self.memberships.entry(conn).or_default().insert(topic);
        true
    }

    fn leave(&mut self, conn: ConnectionId, topic: Topic) {
        if let Some(members) = self.rooms.get_mut(&topic) {
            members.remove(&conn);
            if members.is_empty() {
                self.rooms.remove(&topic);
            }
        }
        if let Some(topics) = self.memberships.get_mut(&conn) {
            topics.remove(&topic);
        }
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        for topic in self.memberships.remove(&conn).unwrap_or_default() {
            if let Some(members) = self.rooms.get_mut(&topic) {
                members.remove(&conn);
                if members.is_empty() {
                    self.rooms.remove(&topic);
                }
            }
        }
        self.inboxes.remove(&conn);
    }
}

struct BusInner {
    identity: Arc<dyn IdentityProvider>,
    config: BusConfig,
    next_id: AtomicU64,
    state: RwLock<BusState>,
}

/// Handle to the bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(identity: Arc<dyn IdentityProvider>, config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                identity,
                config,
                next_id: AtomicU64::new(1),
                state: RwLock::new(BusState::default()),
            }),
        }
    }

    // Room bookkeeping never leaves the state half-written, so a poisoned
    // lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, BusState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BusState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Authenticates `token` and opens a connection subscribed to the
    /// caller's personal channel.
    ///
    /// Invalid or inactive principals are rejected with `Unauthorized`.
    pub fn connect(&self, token: &str) -> Result<Connection> {
        let principal = self.inner.identity.authenticate(token)?;
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.config.inbox_capacity.max(1));
        {
            let mut state = self.write();
            state.inboxes.insert(id, tx);
            state.join(id, Topic::User(principal.user_id));
        }
        tracing::debug!(connection = id.0, user_id = %principal.user_id, "bus connection opened");
        Ok(Connection {
            id,
            principal,
            rx,
            bus: self.clone(),
        })
    }

    /// Subscribes a live connection to `topic`. Returns false for closed connections.
    pub(crate) fn join(&self, conn: ConnectionId, topic: Topic) -> bool {
        self.write().join(conn, topic)
    }

    pub(crate) fn leave(&self, conn: ConnectionId, topic: Topic) {
        self.write().leave(conn, topic);
    }

    fn disconnect(&self, conn: ConnectionId) {
        self.write().disconnect(conn);
        tracing::debug!(connection = conn.0, "bus connection closed");
    }

    /// Delivers `event` to every member of `topic`. Returns how many inboxes
    /// accepted it.
    pub fn publish(&self, topic: Topic, event: RideEvent) -> usize {
        let state = self.read();
        let Some(members) = state.rooms.get(&topic) else {
            return 0;
        };
        let envelope = Envelope { topic, event };
        let mut delivered = 0;
        for conn in members {
            let Some(inbox) = state.inboxes.get(conn) else {
                continue;
            };
            match inbox.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(
                        connection = conn.0,
                        %topic,
                        event = envelope.event.name(),
                        "inbox full, event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Number of connections subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.read().rooms.get(topic).map_or(0, HashSet::len)
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.read().inboxes.len()
    }
}

/// One authenticated subscriber. Leaves every room when dropped.
pub struct Connection {
    id: ConnectionId,
    principal: Principal,
    rx: mpsc::Receiver<Envelope>,
    bus: EventBus,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Waits for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next buffered event, if any.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Drains every buffered event.
    pub fn drain(&mut self) -> Vec<Envelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Moves a driver's subscription to the region room containing `point`.
    /// Requesters may watch a region too.
    pub fn watch_region(&self, point: GeoPoint) -> Option<Topic> {
        let topic = Topic::region_of(point)?;
        let mut state = self.bus.write();
        if self.principal.role == Role::Driver {
            let current: Vec<Topic> = state
                .memberships
                .get(&self.id)
                .into_iter()
                .flatten()
                .filter(|t| matches!(t, Topic::Region(_)) && **t != topic)
                .copied()
                .collect();
            for old in current {
                state.leave(self.id, old);
            }
        }
        state.join(self.id, topic).then_some(topic)
    }

    /// Unsubscribes from `topic`. The personal channel cannot be left.
    pub fn leave(&self, topic: Topic) {
        if topic != Topic::User(self.principal.user_id) {
            self.bus.leave(self.id, topic);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.bus.disconnect(self.id);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.principal.user_id)
            .finish_non_exhaustive()
    }
}
