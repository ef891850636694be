//! Live connection registry
//!
//! A connection is present exactly while it is `Active`: it is added before
//! its tasks start and erased by whichever path first drains it.

use dashmap::DashMap;
use std::sync::Arc;

use crate::network::connection::{Connection, ConnectionId};
use crate::protocol::Frame;

/// Cloneable handle to the shared set of live connections
#[derive(Clone, Default)]
pub struct Registry {
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id(), conn);
    }

    /// Drain `conn` and erase it. Returns `false` when another caller got
    /// there first, in which case nothing happens.
    pub fn remove(&self, conn: &Connection) -> bool {
        if !conn.begin_drain() {
            return false;
        }
        self.connections.remove(&conn.id());
        true
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Visit every live connection. `f` runs while a shard lock is held, so
    /// it must not block or touch the registry.
    pub fn for_each_active<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for entry in self.connections.iter() {
            if entry.value().is_active() {
                f(entry.value());
            }
        }
    }

    /// Push `frame` onto every live connection's queue. Returns how many
    /// connections accepted it.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let mut delivered = 0;
        self.for_each_active(|conn| {
            if conn.enqueue(frame.clone()) {
                delivered += 1;
            }
        });
        delivered
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Force every connection into draining and return them for joining
    pub fn drain_all(&self) -> Vec<Arc<Connection>> {
        let conns = self.snapshot();
        for conn in &conns {
            self.remove(conn);
        }
        conns
    }

    /// Frames discarded by backpressure across all live connections
    pub fn total_dropped(&self) -> u64 {
        self.connections
            .iter()
            .map(|entry| entry.value().queue().dropped_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_add_remove() {
        let registry = Registry::new();
        let a = Connection::detached(4);
        let b = Connection::detached(4);
        registry.add(a.clone());
        registry.add(b.clone());
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&a.id()).is_some());

        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&a.id()).is_none());
        assert!(!a.is_active());
        assert!(b.is_active());
    }

    #[test]
    fn test_broadcast_shares_one_buffer() {
        let registry = Registry::new();
        let conns: Vec<_> = (0..4).map(|_| Connection::detached(4)).collect();
        for conn in &conns {
            registry.add(conn.clone());
        }
        registry.remove(&conns[3]);

        let frame = Bytes::from(vec![1u8; 3840]);
        assert_eq!(registry.broadcast(&frame), 3);

        for conn in &conns[..3] {
            let got = conn.queue().try_pop().unwrap();
            assert_eq!(got.as_ptr(), frame.as_ptr());
        }
        assert!(conns[3].queue().is_empty());
    }

    #[test]
    fn test_slow_queue_does_not_affect_others() {
        let registry = Registry::new();
        let slow = Connection::detached(2);
        let fast = Connection::detached(2);
        registry.add(slow.clone());
        registry.add(fast.clone());

        for i in 0..10u8 {
            registry.broadcast(&Bytes::from(vec![i]));
            fast.queue().try_pop().unwrap();
        }

        assert_eq!(slow.queue().len(), 2);
        assert_eq!(slow.queue().dropped_count(), 8);
        assert_eq!(fast.queue().dropped_count(), 0);
        assert_eq!(registry.total_dropped(), 8);
    }

    #[test]
    fn test_drain_all() {
        let registry = Registry::new();
        for _ in 0..3 {
            registry.add(Connection::detached(4));
        }
        let drained = registry.drain_all();
        assert_eq!(drained.len(), 3);
        assert!(registry.is_empty());
        assert!(drained.iter().all(|c| c.queue().is_closed()));
    }
}
