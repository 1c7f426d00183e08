//! Fan-out of presence events to connected observers
//!
//! Every observer owns a bounded buffer. Publishing only enqueues into those
//! buffers and never waits on a consumer, so one slow observer cannot hold up
//! the publisher or its peers:
//! - a full buffer drops either its oldest or the incoming event, depending
//!   on the configured [`OverflowPolicy`]
//! - an observer whose buffer has stayed full for longer than the delivery
//!   timeout is disconnected, either by the next publish or by
//!   [`BroadcastHub::reap_stalled`], which the server runs periodically
//!
//! Events for one id reach every observer in publish order. The updater
//! publishes while holding the store's per-id writer lock, which makes
//! publish order equal to commit order.

use crate::presence::PresenceEvent;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub const DEFAULT_BUFFER_CAPACITY: usize = 64;
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

pub type ObserverId = u64;

/// What to discard when an observer's buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
    pub delivery_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            overflow: OverflowPolicy::DropOldest,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }
}

/// Why an observer stopped receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Unsubscribed,
    DeliveryTimeout,
}

#[derive(Debug)]
struct ObserverQueue {
    buffer: VecDeque<PresenceEvent>,
    /// Set when the buffer reaches capacity, cleared once an event is taken
    full_since: Option<Instant>,
    closed: Option<DisconnectReason>,
    dropped: u64,
}

#[derive(Debug)]
struct ObserverSlot {
    id: ObserverId,
    queue: Mutex<ObserverQueue>,
    notify: Notify,
}

impl ObserverSlot {
    fn new(id: ObserverId, capacity: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(ObserverQueue {
                buffer: VecDeque::with_capacity(capacity),
                full_since: None,
                closed: None,
                dropped: 0,
            }),
            notify: Notify::new(),
        }
    }

    fn close(&self, reason: DisconnectReason) {
        {
            let mut queue = self.queue.lock();
            if queue.closed.is_some() {
                return;
            }
            queue.closed = Some(reason);
            queue.buffer.clear();
        }
        self.notify.notify_one();
    }

    /// Enqueues `event`, returning false if the observer must be disconnected.
    fn offer(&self, event: &PresenceEvent, config: &HubConfig, now: Instant) -> bool {
        {
            let mut queue = self.queue.lock();
            if queue.closed.is_some() {
                return true;
            }

            let capacity = config.buffer_capacity.max(1);
            if queue.buffer.len() >= capacity {
                match queue.full_since {
                    Some(since) if now.duration_since(since) > config.delivery_timeout => {
                        return false;
                    }
                    Some(_) => {}
                    None => queue.full_since = Some(now),
                }

                queue.dropped += 1;
                match config.overflow {
                    OverflowPolicy::DropOldest => {
                        queue.buffer.pop_front();
                        queue.buffer.push_back(event.clone());
                    }
                    OverflowPolicy::DropNewest => {}
                }
                debug!("Observer {} buffer full, dropped one event", self.id);
            } else {
                queue.buffer.push_back(event.clone());
                if queue.buffer.len() >= capacity {
                    queue.full_since = Some(now);
                }
            }
        }
        self.notify.notify_one();
        true
    }

    /// True if the buffer has been full for longer than `timeout`.
    fn is_stalled(&self, timeout: Duration, now: Instant) -> bool {
        let queue = self.queue.lock();
        match queue.full_since {
            Some(since) => queue.closed.is_none() && now.duration_since(since) > timeout,
            None => false,
        }
    }
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct ObserverHandle {
    slot: Arc<ObserverSlot>,
}

impl ObserverHandle {
    pub fn id(&self) -> ObserverId {
        self.slot.id
    }

    /// Waits for the next event. Returns None once the observer has been
    /// disconnected.
    ///
    /// Cancel safe: an event is only taken from the buffer when this
    /// future completes.
    pub async fn recv(&self) -> Option<PresenceEvent> {
        loop {
            let notified = self.slot.notify.notified();
            match self.poll_queue() {
                Ok(event) => return event,
                Err(()) => notified.await,
            }
        }
    }

    /// Takes the next buffered event without waiting.
    pub fn try_recv(&self) -> Option<PresenceEvent> {
        self.poll_queue().ok().flatten()
    }

    // Ok(Some) for an event, Ok(None) when closed, Err when empty and open
    fn poll_queue(&self) -> Result<Option<PresenceEvent>, ()> {
        let mut queue = self.slot.queue.lock();
        if let Some(event) = queue.buffer.pop_front() {
            queue.full_since = None;
            return Ok(Some(event));
        }
        if queue.closed.is_some() {
            return Ok(None);
        }
        Err(())
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.slot.queue.lock().closed
    }

    /// Number of events lost to buffer overflow so far.
    pub fn dropped(&self) -> u64 {
        self.slot.queue.lock().dropped
    }

    pub fn buffered(&self) -> usize {
        self.slot.queue.lock().buffer.len()
    }
}

pub struct BroadcastHub {
    observers: RwLock<HashMap<ObserverId, Arc<ObserverSlot>>>,
    next_observer_id: AtomicU64,
    config: HubConfig,
}

impl BroadcastHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            next_observer_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn subscribe(&self) -> ObserverHandle {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ObserverSlot::new(id, self.config.buffer_capacity));

        self.observers.write().insert(id, Arc::clone(&slot));
        info!("Observer {} subscribed", id);

        ObserverHandle { slot }
    }

    /// Removes the observer. Safe to call more than once.
    pub fn unsubscribe(&self, handle: &ObserverHandle) {
        self.disconnect(handle.id(), DisconnectReason::Unsubscribed);
    }

    /// Removes an observer by id, closing its buffer. Returns false if it
    /// was already gone.
    pub fn disconnect(&self, id: ObserverId, reason: DisconnectReason) -> bool {
        let removed = self.observers.write().remove(&id);
        match removed {
            Some(slot) => {
                slot.close(reason);
                info!("Observer {} disconnected ({:?})", id, reason);
                true
            }
            None => false,
        }
    }

    /// Enqueues `event` for every current observer. Never blocks on delivery.
    pub fn publish(&self, event: &PresenceEvent) {
        let slots: Vec<Arc<ObserverSlot>> = self.observers.read().values().cloned().collect();
        let now = Instant::now();

        let timed_out: Vec<ObserverId> = slots
            .iter()
            .filter(|slot| !slot.offer(event, &self.config, now))
            .map(|slot| slot.id)
            .collect();

        for id in timed_out {
            warn!(
                "Observer {} did not drain its buffer within {:?}",
                id, self.config.delivery_timeout
            );
            self.disconnect(id, DisconnectReason::DeliveryTimeout);
        }
    }

    /// Disconnects every observer whose buffer has stayed full past the
    /// delivery timeout, even when no further events are published.
    /// Returns the number of observers removed.
    pub fn reap_stalled(&self) -> usize {
        self.reap_stalled_at(Instant::now())
    }

    fn reap_stalled_at(&self, now: Instant) -> usize {
        let timeout = self.config.delivery_timeout;
        let stalled: Vec<ObserverId> = self
            .observers
            .read()
            .values()
            .filter(|slot| slot.is_stalled(timeout, now))
            .map(|slot| slot.id)
            .collect();

        let mut reaped = 0;
        for id in stalled {
            warn!("Observer {} stalled for more than {:?}", id, timeout);
            if self.disconnect(id, DisconnectReason::DeliveryTimeout) {
                reaped += 1;
            }
        }
        reaped
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}
