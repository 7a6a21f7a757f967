//! The simulated radio channel.
//!
//! The channel owns the registry of live nodes and the global delivery
//! queue. `transmit` applies, in order, the range check, the probabilistic
//! loss model and the delay model, then schedules the frame on a min-heap
//! keyed by `(delivery_time, seq)`; the strictly increasing sequence number
//! makes ordering total even for identical delivery times. `tick` drains the
//! heap strictly up to the current instant and hands each surviving frame to
//! its receiver's inbox.
//!
//! Failure policy: `transmit` never raises. Unknown endpoints, out-of-range
//! receivers and loss-model drops all come back as `false`, with the latter
//! two accounted in the counters (`total = success + failed_distance +
//! failed_transmission`).
//!
//! Locking discipline: the registry is a sharded concurrent map so transmit
//! calls from node tasks read peer positions without contending on the
//! queue; the heap, the random source and nothing else sit behind short
//! mutexes that are never held across an await or an I/O call.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::SimClock;
use crate::config::{ChannelConfig, PROPAGATION_SPEED, TICK_INTERVAL};
use crate::error::ChannelError;
use crate::frame::Frame;
use crate::spatial::{NodeState, Position};
use crate::viz::{NodeSite, TopologySnapshot};

/// Control messages the channel forwards into a node task.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeControl {
    /// Operator moved the node; the task re-anchors its kinematics there.
    MoveTo(Position),
}

/// Registry entry for a live node: how to reach its task, plus a mirror of
/// its kinematic state for radio geometry and persistence.
#[derive(Debug)]
pub(crate) struct NodeLink {
    pub(crate) inbox: mpsc::UnboundedSender<Frame>,
    pub(crate) control: mpsc::UnboundedSender<NodeControl>,
    pub(crate) state: NodeState,
    pub(crate) bitrate: u32,
}

/// A frame waiting in the delivery queue.
#[derive(Debug, Clone)]
struct Scheduled {
    delivery_time: DateTime<Utc>,
    seq: u64,
    frame: Frame,
    receiver: u32,
}

impl Eq for Scheduled {}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.delivery_time == other.delivery_time && self.seq == other.seq
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // `BinaryHeap` is a max-heap; reverse so the earliest (time, seq)
        // pops first.
        other
            .delivery_time
            .cmp(&self.delivery_time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct DeliveryQueue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

impl DeliveryQueue {
    fn push(&mut self, delivery_time: DateTime<Utc>, frame: Frame, receiver: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled {
            delivery_time,
            seq,
            frame,
            receiver,
        });
    }

    /// Pops every entry due at or before `now`, in (time, seq) order.
    fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Scheduled> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.delivery_time > now {
                break;
            }
            due.push(self.heap.pop().expect("peek followed by pop"));
        }
        due
    }

    /// Drops every entry whose sender or receiver is `id`.
    fn purge(&mut self, id: u32) -> usize {
        let before = self.heap.len();
        self.heap
            .retain(|s| s.receiver != id && s.frame.sender() != id);
        before - self.heap.len()
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// Transmission accounting. The identity `total = success + failed_distance
/// + failed_transmission` holds by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransmitCounters {
    pub success: u64,
    pub failed_distance: u64,
    pub failed_transmission: u64,
    pub total: u64,
}

#[derive(Debug, Default)]
struct Stats {
    success: AtomicU64,
    failed_distance: AtomicU64,
    failed_transmission: AtomicU64,
}

/// Per-frame delivery probability:
/// `exp(-alpha * d / radius)` attenuated by a payload-size factor and a
/// bitrate factor, clamped to `[0, 1]` (large payloads at high rates would
/// otherwise push it negative).
pub fn delivery_probability(
    distance: f64,
    radius: f64,
    alpha: f64,
    payload_len: usize,
    bitrate: u32,
) -> f64 {
    let base = (-alpha * distance / radius).exp();
    let size_factor = 1.0 - 0.1 * (payload_len as f64 / 1024.0).min(1.0);
    let rate_factor = 1.0 - 0.05 * (bitrate as f64 / 10_000.0).min(1.0);
    (base * size_factor * rate_factor).clamp(0.0, 1.0)
}

#[derive(Debug)]
pub struct Channel {
    clock: Arc<SimClock>,
    config: ChannelConfig,
    links: DashMap<u32, NodeLink>,
    queue: Mutex<DeliveryQueue>,
    rng: Mutex<StdRng>,
    stats: Stats,
}

impl Channel {
    pub fn new(clock: Arc<SimClock>, config: ChannelConfig) -> Arc<Self> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Arc::new(Self {
            clock,
            config,
            links: DashMap::new(),
            queue: Mutex::new(DeliveryQueue::default()),
            rng: Mutex::new(rng),
            stats: Stats::default(),
        })
    }

    pub fn clock(&self) -> &Arc<SimClock> {
        &self.clock
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Registers a node's endpoints. Fails without touching the registry if
    /// the id is already taken.
    pub(crate) fn register(
        &self,
        id: u32,
        state: NodeState,
        bitrate: u32,
        inbox: mpsc::UnboundedSender<Frame>,
        control: mpsc::UnboundedSender<NodeControl>,
    ) -> Result<(), ChannelError> {
        match self.links.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ChannelError::DuplicateId(id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(NodeLink {
                    inbox,
                    control,
                    state,
                    bitrate,
                });
                debug!(node = id, "registered with the channel");
                Ok(())
            }
        }
    }

    /// Unregisters `id` and purges every queued frame it sent or was about
    /// to receive. Removing an unknown id warns and does nothing.
    pub fn remove_node(&self, id: u32) -> bool {
        if self.links.remove(&id).is_none() {
            warn!(node = id, "remove_node: id is not registered");
            return false;
        }
        let purged = self.queue.lock().expect("queue lock poisoned").purge(id);
        debug!(node = id, purged, "node removed");
        true
    }

    /// Teleports a node. The registry mirror moves immediately so radio
    /// geometry is consistent; the owning task is told to re-anchor its own
    /// state at the same spot.
    pub fn move_node(&self, id: u32, position: Position) -> bool {
        let now = self.clock.now();
        match self.links.get_mut(&id) {
            Some(mut link) => {
                link.state.teleport(position, now);
                let _ = link.control.send(NodeControl::MoveTo(position));
                true
            }
            None => {
                warn!(node = id, "move_node: id is not registered");
                false
            }
        }
    }

    /// Refreshes the registry mirror after a node integrated its motion.
    pub(crate) fn publish_state(&self, id: u32, state: NodeState) {
        if let Some(mut link) = self.links.get_mut(&id) {
            link.state = state;
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.links.contains_key(&id)
    }

    /// Registered ids, sorted.
    pub fn node_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.links.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn node_count(&self) -> usize {
        self.links.len()
    }

    /// Attempts a single-hop transmission. Returns whether a delivery was
    /// scheduled; the three failure modes are an unknown endpoint, an
    /// out-of-range receiver and a loss-model drop.
    pub fn transmit(&self, frame: Frame, sender_id: u32, receiver_id: u32) -> bool {
        let (sender_pos, bitrate) = match self.links.get(&sender_id) {
            Some(link) => (link.state.position, link.bitrate),
            None => {
                debug!(sender = sender_id, "transmit from an unregistered node");
                return false;
            }
        };
        let receiver_pos = match self.links.get(&receiver_id) {
            Some(link) => link.state.position,
            None => {
                debug!(receiver = receiver_id, "transmit to an unregistered node");
                return false;
            }
        };

        let distance = sender_pos.distance_to(&receiver_pos);
        if distance > self.config.coverage_radius {
            self.stats.failed_distance.fetch_add(1, Ordering::Relaxed);
            debug!(
                sender = sender_id,
                receiver = receiver_id,
                distance = format_args!("{distance:.1}"),
                "receiver outside coverage"
            );
            return false;
        }

        let jitter = {
            let mut rng = self.rng.lock().expect("rng lock poisoned");
            if self.config.loss_enabled {
                let p = delivery_probability(
                    distance,
                    self.config.coverage_radius,
                    self.config.path_loss_alpha,
                    frame.payload().len(),
                    bitrate,
                );
                if rng.gen::<f64>() > p {
                    self.stats
                        .failed_transmission
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(
                        sender = sender_id,
                        receiver = receiver_id,
                        p = format_args!("{p:.3}"),
                        "frame lost in transmission"
                    );
                    return false;
                }
            }
            rng.gen_range(0.9..=1.1)
        };

        // Modeled frame size: header + payload + CRC + timestamp, in bits.
        let bits = 8.0 * (4 + frame.payload().len() + 2 + 8) as f64;
        let transmission_time = bits / bitrate as f64;
        let propagation_time = distance / PROPAGATION_SPEED;
        let delay = (transmission_time + propagation_time) * jitter;

        let delivery_time =
            self.clock.now() + chrono::Duration::microseconds((delay * 1e6) as i64);
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .push(delivery_time, frame, receiver_id);
        self.stats.success.fetch_add(1, Ordering::Relaxed);
        debug!(
            sender = sender_id,
            receiver = receiver_id,
            delay = format_args!("{delay:.4}"),
            "delivery scheduled"
        );
        true
    }

    /// Delivers every frame due at or before the current instant. The
    /// deadline is read once on entry, so frames enqueued during the drain
    /// wait for the next round. Returns the number of frames delivered.
    pub fn tick(&self) -> usize {
        let now = self.clock.now();
        let due = self
            .queue
            .lock()
            .expect("queue lock poisoned")
            .pop_due(now);

        let mut delivered = 0;
        for scheduled in due {
            // The receiver may have been removed since scheduling; such
            // frames are dropped silently.
            if let Some(link) = self.links.get(&scheduled.receiver) {
                if link.inbox.send(scheduled.frame).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Spawns the background task that calls [`Channel::tick`] on a fixed
    /// cadence.
    pub fn spawn_pump(self: &Arc<Self>) -> ChannelPump {
        let stop = Arc::new(AtomicBool::new(false));
        let channel = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while !flag.load(Ordering::Relaxed) {
                ticker.tick().await;
                channel.tick();
            }
        });
        ChannelPump { stop, task }
    }

    pub fn counters(&self) -> TransmitCounters {
        let success = self.stats.success.load(Ordering::Relaxed);
        let failed_distance = self.stats.failed_distance.load(Ordering::Relaxed);
        let failed_transmission = self.stats.failed_transmission.load(Ordering::Relaxed);
        TransmitCounters {
            success,
            failed_distance,
            failed_transmission,
            total: success + failed_distance + failed_transmission,
        }
    }

    /// Frames still in flight.
    pub fn pending_len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    /// Read-only topology view for the visualization seam.
    pub fn snapshot_state(&self, observer: Option<u32>) -> TopologySnapshot {
        let mut nodes: Vec<NodeSite> = self
            .links
            .iter()
            .map(|entry| NodeSite {
                node_id: *entry.key(),
                position: entry.value().state.position,
            })
            .collect();
        nodes.sort_by_key(|site| site.node_id);
        TopologySnapshot {
            captured_at: self.clock.now(),
            coverage_radius: self.config.coverage_radius,
            observer,
            nodes,
        }
    }

    /// Mirror of each registered node's state, for persistence.
    pub(crate) fn export_links(&self) -> Vec<(u32, NodeState, u32)> {
        let mut links: Vec<(u32, NodeState, u32)> = self
            .links
            .iter()
            .map(|e| (*e.key(), e.value().state.clone(), e.value().bitrate))
            .collect();
        links.sort_by_key(|(id, _, _)| *id);
        links
    }

    /// In-flight frames ordered by delivery time, for persistence.
    pub(crate) fn export_pending(&self) -> Vec<(DateTime<Utc>, u32, Frame)> {
        let queue = self.queue.lock().expect("queue lock poisoned");
        let mut pending: Vec<&Scheduled> = queue.heap.iter().collect();
        pending.sort_by(|a, b| (a.delivery_time, a.seq).cmp(&(b.delivery_time, b.seq)));
        pending
            .into_iter()
            .map(|s| (s.delivery_time, s.receiver, s.frame.clone()))
            .collect()
    }

    /// Re-schedules frames from a restored session.
    pub(crate) fn restore_pending(&self, entries: Vec<(DateTime<Utc>, u32, Frame)>) {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        for (delivery_time, receiver, frame) in entries {
            queue.push(delivery_time, frame, receiver);
        }
    }

    /// Restores counters from a saved session.
    pub(crate) fn restore_counters(&self, counters: TransmitCounters) {
        self.stats.success.store(counters.success, Ordering::Relaxed);
        self.stats
            .failed_distance
            .store(counters.failed_distance, Ordering::Relaxed);
        self.stats
            .failed_transmission
            .store(counters.failed_transmission, Ordering::Relaxed);
    }
}

/// Handle to the background tick task.
pub struct ChannelPump {
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ChannelPump {
    pub async fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn lossless_config() -> ChannelConfig {
        ChannelConfig {
            loss_enabled: false,
            seed: Some(7),
            ..ChannelConfig::default()
        }
    }

    fn attach(
        channel: &Channel,
        id: u32,
        position: Position,
        bitrate: u32,
    ) -> (
        mpsc::UnboundedReceiver<Frame>,
        mpsc::UnboundedReceiver<NodeControl>,
    ) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let state = NodeState::new(position, 0.0, 0.0, t0());
        channel
            .register(id, state, bitrate, inbox_tx, ctl_tx)
            .expect("register");
        (inbox_rx, ctl_rx)
    }

    #[test]
    fn duplicate_registration_is_rejected_without_mutation() {
        let clock = SimClock::manual(t0());
        let channel = Channel::new(clock, lossless_config());
        let _a = attach(&channel, 1, Position::new(0.0, 0.0), 10_000);

        let (tx, _rx) = mpsc::unbounded_channel();
        let (ctl, _crx) = mpsc::unbounded_channel();
        let err = channel
            .register(1, NodeState::new(Position::new(5.0, 5.0), 0.0, 0.0, t0()), 500, tx, ctl)
            .unwrap_err();
        assert_eq!(err, ChannelError::DuplicateId(1));
        assert_eq!(channel.node_ids(), vec![1]);
        // The original registration is untouched.
        let snap = channel.snapshot_state(None);
        assert_eq!(snap.nodes[0].position, Position::new(0.0, 0.0));
    }

    #[test]
    fn out_of_range_frames_are_dropped_and_counted() {
        let clock = SimClock::manual(t0());
        let channel = Channel::new(clock, lossless_config());
        let _a = attach(&channel, 1, Position::new(0.0, 0.0), 10_000);
        let (mut b_inbox, _b_ctl) = attach(&channel, 2, Position::new(20_000.0, 0.0), 10_000);

        let frame = Frame::data(1, 2, b"x".to_vec(), t0());
        assert!(!channel.transmit(frame, 1, 2));

        let counters = channel.counters();
        assert_eq!(counters.failed_distance, 1);
        assert_eq!(counters.success, 0);
        assert_eq!(counters.total, 1);
        assert_eq!(channel.pending_len(), 0);
        assert!(b_inbox.try_recv().is_err());
    }

    #[test]
    fn unknown_endpoints_fail_without_touching_counters() {
        let clock = SimClock::manual(t0());
        let channel = Channel::new(clock, lossless_config());
        let _a = attach(&channel, 1, Position::new(0.0, 0.0), 10_000);

        assert!(!channel.transmit(Frame::data(1, 9, vec![], t0()), 1, 9));
        assert!(!channel.transmit(Frame::data(9, 1, vec![], t0()), 9, 1));
        assert_eq!(channel.counters().total, 0);
    }

    #[test]
    fn in_range_frames_are_scheduled_and_delivered_on_tick() {
        let clock = SimClock::manual(t0());
        let channel = Channel::new(clock.clone(), lossless_config());
        let _a = attach(&channel, 1, Position::new(0.0, 0.0), 10_000);
        let (mut b_inbox, _b_ctl) = attach(&channel, 2, Position::new(1_000.0, 0.0), 10_000);

        assert!(channel.transmit(Frame::data(1, 2, b"ping".to_vec(), t0()), 1, 2));
        assert_eq!(channel.pending_len(), 1);
        // Not due yet: nothing moves.
        assert_eq!(channel.tick(), 0);

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(channel.tick(), 1);
        let got = b_inbox.try_recv().expect("frame delivered");
        assert_eq!(got.payload(), b"ping");

        let counters = channel.counters();
        assert_eq!(counters.success, 1);
        assert_eq!(
            counters.total,
            counters.success + counters.failed_distance + counters.failed_transmission
        );
        // Idempotent on an empty queue.
        assert_eq!(channel.tick(), 0);
    }

    #[test]
    fn scheduled_delay_stays_within_the_jitter_envelope() {
        let clock = SimClock::manual(t0());
        let channel = Channel::new(clock, lossless_config());
        let _a = attach(&channel, 1, Position::new(0.0, 0.0), 10_000);
        let _b = attach(&channel, 2, Position::new(1_000.0, 0.0), 10_000);

        let payload = vec![0u8; 50];
        assert!(channel.transmit(Frame::data(1, 2, payload.clone(), t0()), 1, 2));

        let base = 8.0 * (4 + payload.len() + 2 + 8) as f64 / 10_000.0
            + 1_000.0 / PROPAGATION_SPEED;
        let pending = channel.export_pending();
        assert_eq!(pending.len(), 1);
        let delay = (pending[0].0 - t0()).num_microseconds().unwrap() as f64 / 1e6;
        assert!(delay >= base * 0.9 - 1e-6, "delay {delay} below envelope");
        assert!(delay <= base * 1.1 + 1e-6, "delay {delay} above envelope");
    }

    #[test]
    fn removal_purges_queued_frames_in_both_directions() {
        let clock = SimClock::manual(t0());
        let channel = Channel::new(clock.clone(), lossless_config());
        let _a = attach(&channel, 1, Position::new(0.0, 0.0), 10_000);
        let (mut b_inbox, _b_ctl) = attach(&channel, 2, Position::new(1_000.0, 0.0), 10_000);

        assert!(channel.transmit(Frame::data(1, 2, b"to b".to_vec(), t0()), 1, 2));
        assert!(channel.transmit(Frame::data(2, 1, b"from b".to_vec(), t0()), 2, 1));
        assert_eq!(channel.pending_len(), 2);

        assert!(channel.remove_node(2));
        assert_eq!(channel.pending_len(), 0);

        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(channel.tick(), 0);
        assert!(b_inbox.try_recv().is_err());

        // Removing again is a warning no-op.
        assert!(!channel.remove_node(2));
    }

    #[test]
    fn move_node_updates_the_mirror_and_notifies_the_task() {
        let clock = SimClock::manual(t0());
        let channel = Channel::new(clock, lossless_config());
        let (_inbox, mut ctl) = attach(&channel, 1, Position::new(0.0, 0.0), 10_000);

        assert!(channel.move_node(1, Position::new(2_500.0, 100.0)));
        let snap = channel.snapshot_state(Some(1));
        assert_eq!(snap.nodes[0].position, Position::new(2_500.0, 100.0));
        assert_eq!(
            ctl.try_recv().unwrap(),
            NodeControl::MoveTo(Position::new(2_500.0, 100.0))
        );
        assert!(!channel.move_node(99, Position::new(0.0, 0.0)));
    }

    #[test]
    fn same_instant_deliveries_keep_submission_order() {
        let mut queue = DeliveryQueue::default();
        let at = t0();
        for n in 0..3u32 {
            queue.push(at, Frame::data(1, 2, vec![n as u8], at), 2);
        }
        queue.push(at - chrono::Duration::seconds(1), Frame::data(1, 2, b"early".to_vec(), at), 2);

        let due = queue.pop_due(at);
        assert_eq!(due.len(), 4);
        assert_eq!(due[0].frame.payload(), b"early");
        assert_eq!(due[1].frame.payload(), &[0]);
        assert_eq!(due[2].frame.payload(), &[1]);
        assert_eq!(due[3].frame.payload(), &[2]);
    }

    #[test]
    fn loss_probability_is_clamped() {
        // A pathological payload/bitrate combination must not go negative.
        let p = delivery_probability(9_999.0, 10_000.0, 0.3, 1 << 20, 1_000_000);
        assert!((0.0..=1.0).contains(&p));
        // And a short frame at close range is nearly certain.
        let p = delivery_probability(10.0, 10_000.0, 0.3, 8, 1_000);
        assert!(p > 0.9);
    }

    #[test]
    fn lossy_channel_accounts_every_attempt() {
        let clock = SimClock::manual(t0());
        let config = ChannelConfig {
            loss_enabled: true,
            seed: Some(42),
            ..ChannelConfig::default()
        };
        let channel = Channel::new(clock, config);
        let _a = attach(&channel, 1, Position::new(0.0, 0.0), 10_000);
        let _b = attach(&channel, 2, Position::new(9_500.0, 0.0), 10_000);

        for _ in 0..200 {
            channel.transmit(Frame::data(1, 2, vec![0u8; 512], t0()), 1, 2);
        }
        let counters = channel.counters();
        assert_eq!(counters.total, 200);
        assert_eq!(
            counters.total,
            counters.success + counters.failed_distance + counters.failed_transmission
        );
        // At 9.5 km the loss model should bite at least once in 200 draws.
        assert!(counters.failed_transmission > 0);
        assert!(counters.success > 0);
    }
}
