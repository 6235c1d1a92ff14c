//! Bounded store for replies to noblock requests.
//!
//! Each entry parks the receiving end of the request's reply slot. Retention
//! policy:
//!
//! - entries older than the TTL are purged on every insert and read;
//! - when the cache is still full after purging, the oldest entry is evicted;
//! - a reply is handed out exactly once, after which its id is unknown.
//!
//! Eviction returns the affected ids so the connection can drop their
//! correlation waiters as well.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::protocol::{Reply, RequestId};

/// A parked reply slot.
#[derive(Debug)]
pub struct PendingReply {
    pub(crate) receiver: oneshot::Receiver<Reply>,
    inserted: Instant,
    sequence: u64,
}

/// Why a parked reply could not be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    /// Never parked, already read or evicted.
    Unknown,
    /// Parked for longer than the TTL; the entry is now gone.
    Expired,
}

/// Bounded, TTL-limited noblock reply store.
#[derive(Debug)]
pub struct ReplyCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<RequestId, PendingReply>,
    next_sequence: u64,
}

impl ReplyCache {
    /// Create an empty cache. A zero capacity is treated as one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Number of parked replies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` is parked.
    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    /// Park a reply slot. Returns the ids that were purged or evicted.
    pub fn insert(&mut self, id: RequestId, receiver: oneshot::Receiver<Reply>) -> Vec<RequestId> {
        let mut dropped = self.purge_expired();
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.sequence)
                .map(|(id, _)| *id);
            match oldest {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    tracing::debug!("reply cache full, evicted {}", oldest);
                    dropped.push(oldest);
                }
                None => break,
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            id,
            PendingReply {
                receiver,
                inserted: Instant::now(),
                sequence,
            },
        );
        dropped
    }

    /// Remove a parked slot for reading. An expired entry is removed too.
    pub fn take(&mut self, id: &RequestId) -> Result<PendingReply, Missing> {
        let entry = self.entries.remove(id).ok_or(Missing::Unknown)?;
        if entry.inserted.elapsed() >= self.ttl {
            tracing::debug!("reply {} expired before it was read", id);
            return Err(Missing::Expired);
        }
        Ok(entry)
    }

    /// Put back a slot whose read timed out, keeping its age and position.
    pub fn restore(&mut self, id: RequestId, entry: PendingReply) {
        self.entries.insert(id, entry);
    }

    /// Drop entries older than the TTL.
    pub fn purge_expired(&mut self) -> Vec<RequestId> {
        let ttl = self.ttl;
        let expired: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.inserted.elapsed() >= ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!("purged {} expired replies", expired.len());
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> oneshot::Receiver<Reply> {
        oneshot::channel().1
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let mut cache = ReplyCache::new(2, Duration::from_secs(60));
        let (a, b, c) = (RequestId::new(), RequestId::new(), RequestId::new());
        assert!(cache.insert(a, slot()).is_empty());
        assert!(cache.insert(b, slot()).is_empty());
        assert_eq!(cache.insert(c, slot()), vec![a]);
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b) && cache.contains(&c));
    }

    #[test]
    fn test_take_is_exactly_once() {
        let mut cache = ReplyCache::new(4, Duration::from_secs(60));
        let id = RequestId::new();
        cache.insert(id, slot());
        assert!(cache.take(&id).is_ok());
        assert_eq!(cache.take(&id).err(), Some(Missing::Unknown));
    }

    #[test]
    fn test_restore_keeps_position() {
        let mut cache = ReplyCache::new(2, Duration::from_secs(60));
        let (a, b, c) = (RequestId::new(), RequestId::new(), RequestId::new());
        cache.insert(a, slot());
        cache.insert(b, slot());
        let entry = cache.take(&a).unwrap();
        cache.restore(a, entry);
        // a is still the oldest
        assert_eq!(cache.insert(c, slot()), vec![a]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let mut cache = ReplyCache::new(8, Duration::from_secs(60));
        let old = RequestId::new();
        cache.insert(old, slot());

        tokio::time::advance(Duration::from_secs(61)).await;
        let fresh = RequestId::new();
        assert_eq!(cache.insert(fresh, slot()), vec![old]);
        assert_eq!(cache.len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.take(&fresh).err(), Some(Missing::Expired));
        assert!(cache.is_empty());
    }
}
