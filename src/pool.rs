//! Per-address connection pool.
//!
//! Each address owns a [`StreamsPool`]: an arena of connection slots linked
//! into an *available* list and a *busy* list. A connection carries up to
//! `max_streams` concurrent calls before it is parked on the busy list; it
//! returns to the available list when a call on it is released.
//!
//! All bookkeeping happens under one lock. Dialing and closing never do.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::transport::{Connection, ConnectivityState, DialOptions, Transport};
use crate::{Error, Result};

/// Pool limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Tracked connections per address.
    pub size: usize,
    /// Age after which an unused connection is closed.
    #[serde(deserialize_with = "crate::secs::deserialize")]
    pub ttl: Duration,
    /// Concurrent calls per connection before it counts as busy.
    pub max_streams: usize,
    /// Idle connections kept per address.
    pub max_idle: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 100,
            ttl: Duration::from_secs(60),
            max_streams: 20,
            max_idle: 50,
        }
    }
}

impl PoolOptions {
    /// Set the per-address connection limit.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the connection time to live.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the per-connection stream limit. Zero is treated as one.
    pub fn max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = max_streams.max(1);
        self
    }

    /// Set the idle connection limit.
    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }
}

/// A connection leased from the pool.
///
/// Hand it back with [`Pool::release`].
pub struct PooledConn {
    address: String,
    conn: Arc<dyn Connection>,
    id: u64,
    slot: Option<usize>,
    created: Instant,
}

impl PooledConn {
    /// The underlying connection.
    pub fn conn(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Address this connection was dialed to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the pool tracks this connection.
    pub fn is_tracked(&self) -> bool {
        self.slot.is_some()
    }
}

impl fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn")
            .field("address", &self.address)
            .field("id", &self.id)
            .field("tracked", &self.slot.is_some())
            .finish()
    }
}

/// Snapshot of one address's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Tracked connections.
    pub count: usize,
    /// Tracked connections with no active calls.
    pub idle: usize,
    /// Connections on the available list.
    pub available: usize,
    /// Connections on the busy list.
    pub busy: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Available,
    Busy,
}

struct Slot {
    id: u64,
    conn: Arc<dyn Connection>,
    streams: usize,
    created: Instant,
    list: List,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct StreamsPool {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    available: Option<usize>,
    busy: Option<usize>,
    count: usize,
    idle: usize,
}

impl StreamsPool {
    fn slot(&self, i: usize) -> Option<&Slot> {
        self.slots.get(i).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, i: usize) -> Option<&mut Slot> {
        self.slots.get_mut(i).and_then(Option::as_mut)
    }

    fn head_mut(&mut self, list: List) -> &mut Option<usize> {
        match list {
            List::Available => &mut self.available,
            List::Busy => &mut self.busy,
        }
    }

    /// Put a fresh slot at the front of the available list.
    fn insert(&mut self, id: u64, conn: Arc<dyn Connection>, created: Instant) -> usize {
        let slot = Slot {
            id,
            conn,
            streams: 1,
            created,
            list: List::Available,
            prev: None,
            next: None,
        };
        let i = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.count += 1;
        self.push_front(i, List::Available);
        i
    }

    fn push_front(&mut self, i: usize, list: List) {
        let old = *self.head_mut(list);
        if let Some(slot) = self.slot_mut(i) {
            slot.list = list;
            slot.prev = None;
            slot.next = old;
        }
        if let Some(old) = old.and_then(|o| self.slot_mut(o)) {
            old.prev = Some(i);
        }
        *self.head_mut(list) = Some(i);
    }

    fn unlink(&mut self, i: usize) {
        let Some((list, prev, next)) = self.slot(i).map(|s| (s.list, s.prev, s.next)) else {
            return;
        };
        match prev.and_then(|p| self.slot_mut(p)) {
            Some(p) => p.next = next,
            None => *self.head_mut(list) = next,
        }
        if let Some(n) = next.and_then(|n| self.slot_mut(n)) {
            n.prev = prev;
        }
    }

    /// Unlink and free a slot, returning its connection.
    fn remove(&mut self, i: usize) -> Option<Arc<dyn Connection>> {
        self.unlink(i);
        let slot = self.slots.get_mut(i)?.take()?;
        self.free.push(i);
        self.count -= 1;
        Some(slot.conn)
    }

    /// Scan the available list for a usable connection.
    ///
    /// Dead or expired connections are never leased; idle ones are pushed to
    /// `evicted`. Connections at their stream limit move to the busy list.
    fn lease(
        &mut self,
        opts: &PoolOptions,
        now: Instant,
        evicted: &mut Vec<Arc<dyn Connection>>,
    ) -> Option<(usize, u64, Arc<dyn Connection>, Instant)> {
        let mut cursor = self.available;
        while let Some(i) = cursor {
            let (next, state, streams, created) = {
                let slot = self.slot(i)?;
                (slot.next, slot.conn.state(), slot.streams, slot.created)
            };
            cursor = next;

            if state == ConnectivityState::Connecting {
                continue;
            }
            let dead = matches!(
                state,
                ConnectivityState::Shutdown | ConnectivityState::TransientFailure
            );
            let expired = now.saturating_duration_since(created) > opts.ttl;
            if dead || expired {
                // Calls still in flight keep it alive; release closes it later.
                if streams == 0 {
                    trace!(slot = i, ?state, expired, "evicting connection");
                    if let Some(conn) = self.remove(i) {
                        evicted.push(conn);
                    }
                    self.idle = self.idle.saturating_sub(1);
                }
                continue;
            }
            if streams >= opts.max_streams {
                self.unlink(i);
                self.push_front(i, List::Busy);
                continue;
            }

            if streams == 0 {
                self.idle = self.idle.saturating_sub(1);
            }
            let slot = self.slot_mut(i)?;
            slot.streams += 1;
            return Some((i, slot.id, Arc::clone(&slot.conn), slot.created));
        }
        None
    }

    fn len(&self, mut cursor: Option<usize>) -> usize {
        let mut n = 0;
        while let Some(i) = cursor {
            n += 1;
            cursor = self.slot(i).and_then(|s| s.next);
        }
        n
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            count: self.count,
            idle: self.idle,
            available: self.len(self.available),
            busy: self.len(self.busy),
        }
    }

    fn drain(&mut self) -> Vec<Arc<dyn Connection>> {
        let conns = self.slots.drain(..).flatten().map(|s| s.conn).collect();
        *self = Self::default();
        conns
    }
}

/// Connection pool keyed by address.
pub struct Pool {
    opts: PoolOptions,
    transport: Arc<dyn Transport>,
    conns: Mutex<HashMap<String, StreamsPool>>,
    next_id: AtomicU64,
}

impl Pool {
    /// Create a pool that dials through `transport`.
    pub fn new(opts: PoolOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            opts,
            transport,
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Pool limits.
    pub fn options(&self) -> &PoolOptions {
        &self.opts
    }

    /// Lease a connection to `address`, dialing if none is usable.
    ///
    /// A freshly dialed connection is tracked only while the address has
    /// fewer than `size` tracked connections.
    pub async fn get_conn(&self, address: &str, opts: &DialOptions) -> Result<PooledConn> {
        let mut evicted = Vec::new();
        let leased = {
            let mut conns = self.conns.lock();
            let sp = conns.entry(address.to_string()).or_default();
            let leased = sp.lease(&self.opts, Instant::now(), &mut evicted);
            if sp.count == 0 {
                conns.remove(address);
            }
            leased
        };
        for conn in evicted {
            conn.close();
        }
        if let Some((slot, id, conn, created)) = leased {
            return Ok(PooledConn {
                address: address.to_string(),
                conn,
                id,
                slot: Some(slot),
                created,
            });
        }

        let conn = self.transport.dial(address, opts).await?;
        let created = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let slot = {
            let mut conns = self.conns.lock();
            let sp = conns.entry(address.to_string()).or_default();
            (sp.count < self.opts.size).then(|| sp.insert(id, Arc::clone(&conn), created))
        };
        debug!(address, tracked = slot.is_some(), "dialed new connection");

        Ok(PooledConn {
            address: address.to_string(),
            conn,
            id,
            slot,
            created,
        })
    }

    /// Return a leased connection.
    ///
    /// `err` is the outcome of the call; a failed call's connection is closed
    /// once it has no other calls in flight.
    pub fn release(&self, pc: PooledConn, err: Option<&Error>) {
        let close = {
            let mut conns = self.conns.lock();
            let sp = conns.entry(pc.address.clone()).or_default();
            let close = self.release_locked(sp, &pc, err);
            if sp.count == 0 {
                conns.remove(&pc.address);
            }
            close
        };
        if close {
            trace!(address = %pc.address, "closing released connection");
            pc.conn.close();
        }
    }

    /// Returns whether the connection must be closed.
    fn release_locked(&self, sp: &mut StreamsPool, pc: &PooledConn, err: Option<&Error>) -> bool {
        let tracked = pc
            .slot
            .filter(|&i| sp.slot(i).is_some_and(|s| s.id == pc.id));
        let slot = match tracked {
            Some(i) => i,
            None if sp.count < self.opts.size => sp.insert(pc.id, Arc::clone(&pc.conn), pc.created),
            None => return true,
        };

        let Some(streams) = sp.slot(slot).map(|s| s.streams) else {
            return true;
        };
        if streams >= self.opts.max_streams {
            sp.unlink(slot);
            sp.push_front(slot, List::Available);
        }

        let (streams, created) = match sp.slot_mut(slot) {
            Some(s) => {
                s.streams = s.streams.saturating_sub(1);
                (s.streams, s.created)
            }
            None => return true,
        };
        if streams > 0 {
            return false;
        }

        let expired = Instant::now().saturating_duration_since(created) > self.opts.ttl;
        if err.is_some() || sp.idle >= self.opts.max_idle || expired {
            sp.remove(slot);
            true
        } else {
            sp.idle += 1;
            false
        }
    }

    /// Counters for `address`.
    pub fn stats(&self, address: &str) -> PoolStats {
        self.conns
            .lock()
            .get(address)
            .map(StreamsPool::stats)
            .unwrap_or_default()
    }

    /// Close every tracked connection.
    pub fn close(&self) {
        let conns: Vec<_> = {
            let mut pools = self.conns.lock();
            pools.drain().flat_map(|(_, mut sp)| sp.drain()).collect()
        };
        debug!(count = conns.len(), "closing pool");
        for conn in conns {
            conn.close();
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("opts", &self.opts)
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}
