//! Per-node protocol state: routing table, local map and the parking area
//! for frames awaiting a route.
//!
//! All three stores are owned exclusively by their node's task; nothing here
//! is synchronized. Expiry is enforced both by the periodic housekeeping
//! sweep and at every lookup, so an expired entry is never observable.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::frame::Frame;
use crate::spatial::Position;

/// One learned route: destination, the neighbor to relay through, a hard
/// expiry, and a lower-is-better metric in effective hop count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub destination: u32,
    pub next_hop: u32,
    pub expire_time: DateTime<Utc>,
    pub metric: u32,
}

impl RoutingEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }

    /// Remaining lifetime in seconds (negative once expired).
    pub fn time_to_live(&self, now: DateTime<Utc>) -> f64 {
        (self.expire_time - now).num_milliseconds() as f64 / 1_000.0
    }
}

/// Destination-keyed route store with TTL expiry.
///
/// The update rule is insert-if-absent, replace only when the existing entry
/// has expired or the candidate metric is strictly lower. Entries keyed by
/// the owning node are never created.
#[derive(Debug)]
pub struct RoutingTable {
    owner: u32,
    entries: HashMap<u32, RoutingEntry>,
}

impl RoutingTable {
    pub fn new(owner: u32) -> Self {
        Self {
            owner,
            entries: HashMap::new(),
        }
    }

    /// Applies the update rule. Returns `true` when the table changed, i.e.
    /// a usable route to `destination` was installed or refreshed.
    pub fn upsert(
        &mut self,
        destination: u32,
        next_hop: u32,
        metric: u32,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> bool {
        if destination == self.owner {
            return false;
        }
        if let Some(existing) = self.entries.get(&destination) {
            if !existing.is_expired(now) && metric >= existing.metric {
                return false;
            }
        }
        let expire_time = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| {
            chrono::Duration::seconds(60)
        });
        self.entries.insert(
            destination,
            RoutingEntry {
                destination,
                next_hop,
                expire_time,
                metric,
            },
        );
        true
    }

    /// Looks up a usable route, pruning the entry first if it has expired.
    pub fn route_to(&mut self, destination: u32, now: DateTime<Utc>) -> Option<&RoutingEntry> {
        if let Some(entry) = self.entries.get(&destination) {
            if entry.is_expired(now) {
                self.entries.remove(&destination);
                return None;
            }
        }
        self.entries.get(&destination)
    }

    pub fn remove(&mut self, destination: u32) -> Option<RoutingEntry> {
        self.entries.remove(&destination)
    }

    /// Drops every expired entry, returning the destinations removed.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> Vec<u32> {
        let gone: Vec<u32> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.destination)
            .collect();
        for id in &gone {
            self.entries.remove(id);
        }
        gone
    }

    /// Unexpired entries, sorted by destination for stable presentation.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<RoutingEntry> {
        let mut entries: Vec<RoutingEntry> = self
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.destination);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a node has heard about: position and last-seen instant per peer.
/// Always contains the owner's own entry.
#[derive(Debug)]
pub struct LocalMap {
    owner: u32,
    entries: HashMap<u32, MapEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapEntry {
    pub position: Position,
    pub last_seen: DateTime<Utc>,
}

impl LocalMap {
    pub fn new(owner: u32, position: Position, now: DateTime<Utc>) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            owner,
            MapEntry {
                position,
                last_seen: now,
            },
        );
        Self { owner, entries }
    }

    /// Records a peer sighting from a received position record.
    pub fn observe(&mut self, id: u32, position: Position, seen_at: DateTime<Utc>) {
        self.entries.insert(
            id,
            MapEntry {
                position,
                last_seen: seen_at,
            },
        );
    }

    /// Refreshes the owner's own entry after motion integration.
    pub fn refresh_own(&mut self, position: Position, now: DateTime<Utc>) {
        self.entries.insert(
            self.owner,
            MapEntry {
                position,
                last_seen: now,
            },
        );
    }

    /// Drops entries not refreshed within `timeout`, returning the removed
    /// ids. The owner's entry is exempt.
    pub fn prune_stale(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<u32> {
        let horizon = chrono::Duration::from_std(timeout).unwrap_or_else(|_| {
            chrono::Duration::seconds(5)
        });
        let owner = self.owner;
        let gone: Vec<u32> = self
            .entries
            .iter()
            .filter(|(id, e)| **id != owner && now - e.last_seen > horizon)
            .map(|(id, _)| *id)
            .collect();
        for id in &gone {
            self.entries.remove(id);
        }
        gone
    }

    pub fn get(&self, id: u32) -> Option<&MapEntry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Known peers, owner excluded.
    pub fn neighbors(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .entries
            .keys()
            .copied()
            .filter(|id| *id != self.owner)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self) -> Vec<(u32, MapEntry)> {
        let mut entries: Vec<(u32, MapEntry)> =
            self.entries.iter().map(|(id, e)| (*id, *e)).collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Frames parked per destination until a route appears. Order within a
/// destination is preserved so delayed traffic leaves in the order it was
/// submitted.
#[derive(Debug, Default)]
pub struct DelayedFrames {
    queues: HashMap<u32, VecDeque<Frame>>,
}

impl DelayedFrames {
    pub fn park(&mut self, destination: u32, frame: Frame) {
        self.queues.entry(destination).or_default().push_back(frame);
    }

    /// Removes and returns everything parked for `destination`. The caller
    /// re-parks whatever fails to transmit.
    pub fn take(&mut self, destination: u32) -> VecDeque<Frame> {
        self.queues.remove(&destination).unwrap_or_default()
    }

    pub fn pending(&self, destination: u32) -> usize {
        self.queues.get(&destination).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(VecDeque::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn upsert_inserts_then_keeps_the_better_metric() {
        let mut table = RoutingTable::new(1);
        assert!(table.upsert(5, 2, 3, t0(), TTL));
        // Worse or equal metric does not displace a live entry.
        assert!(!table.upsert(5, 9, 3, t0(), TTL));
        assert!(!table.upsert(5, 9, 7, t0(), TTL));
        assert_eq!(table.route_to(5, t0()).unwrap().next_hop, 2);
        // Strictly better metric does.
        assert!(table.upsert(5, 4, 1, t0(), TTL));
        assert_eq!(table.route_to(5, t0()).unwrap().next_hop, 4);
    }

    #[test]
    fn upsert_replaces_an_expired_entry_regardless_of_metric() {
        let mut table = RoutingTable::new(1);
        assert!(table.upsert(5, 2, 1, t0(), Duration::from_secs(1)));
        let later = t0() + chrono::Duration::seconds(2);
        assert!(table.upsert(5, 9, 8, later, TTL));
        assert_eq!(table.route_to(5, later).unwrap().next_hop, 9);
    }

    #[test]
    fn lookup_prunes_expired_entries() {
        let mut table = RoutingTable::new(1);
        table.upsert(5, 2, 1, t0(), Duration::from_secs(1));
        let later = t0() + chrono::Duration::seconds(2);
        assert!(table.route_to(5, later).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn no_route_to_self_is_ever_created() {
        let mut table = RoutingTable::new(1);
        assert!(!table.upsert(1, 2, 1, t0(), TTL));
        assert!(table.is_empty());
    }

    #[test]
    fn prune_expired_reports_removed_destinations() {
        let mut table = RoutingTable::new(1);
        table.upsert(5, 2, 1, t0(), Duration::from_secs(1));
        table.upsert(6, 2, 1, t0(), TTL);
        let mut gone = table.prune_expired(t0() + chrono::Duration::seconds(2));
        gone.sort_unstable();
        assert_eq!(gone, vec![5]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn snapshot_hides_expired_entries() {
        let mut table = RoutingTable::new(1);
        table.upsert(5, 2, 1, t0(), Duration::from_secs(1));
        table.upsert(6, 3, 2, t0(), TTL);
        let snap = table.snapshot(t0() + chrono::Duration::seconds(2));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].destination, 6);
    }

    #[test]
    fn local_map_keeps_the_owner_through_pruning() {
        let mut map = LocalMap::new(1, Position::new(0.0, 0.0), t0());
        map.observe(2, Position::new(10.0, 0.0), t0());
        let later = t0() + chrono::Duration::seconds(30);
        let gone = map.prune_stale(later, Duration::from_secs(5));
        assert_eq!(gone, vec![2]);
        assert!(map.contains(1));
        assert_eq!(map.neighbors(), Vec::<u32>::new());
    }

    #[test]
    fn delayed_frames_keep_per_destination_order() {
        let now = t0();
        let mut delayed = DelayedFrames::default();
        delayed.park(5, Frame::data(1, 5, b"first".to_vec(), now));
        delayed.park(5, Frame::data(1, 5, b"second".to_vec(), now));
        delayed.park(6, Frame::data(1, 6, b"other".to_vec(), now));

        assert_eq!(delayed.pending(5), 2);
        let frames = delayed.take(5);
        let payloads: Vec<&[u8]> = frames.iter().map(|f| f.payload()).collect();
        assert_eq!(payloads, vec![b"first".as_ref(), b"second".as_ref()]);
        assert_eq!(delayed.pending(5), 0);
        assert_eq!(delayed.pending(6), 1);
    }
}
