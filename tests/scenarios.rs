//! End-to-end protocol scenarios, driven deterministically: manual clock,
//! loss disabled, channel ticked by hand. Node state machines are exercised
//! through the same handlers the async tasks use.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use manet_sim::{
    event_channel, Channel, ChannelConfig, ChannelError, EventStream, Frame, Node, NodeConfig,
    NodeEvent, Position, PositionRecord, SimClock,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn lossless() -> ChannelConfig {
    ChannelConfig {
        loss_enabled: false,
        seed: Some(1),
        ..ChannelConfig::default()
    }
}

struct Sim {
    clock: Arc<SimClock>,
    channel: Arc<Channel>,
    events: EventStream,
    events_tx: manet_sim::EventSender,
}

impl Sim {
    fn new() -> Self {
        let clock = SimClock::manual(t0());
        let channel = Channel::new(clock.clone(), lossless());
        let (events_tx, events) = event_channel();
        Self {
            clock,
            channel,
            events,
            events_tx,
        }
    }

    fn node(&self, id: u32, x: f64, y: f64, config: NodeConfig) -> Node {
        Node::new(id, Position::new(x, y), config, &self.channel, self.events_tx.clone())
            .expect("node registers")
    }

    /// Advances 100 ms (enough for every modeled delay at these ranges),
    /// ticks the channel and lets the given nodes react.
    fn step(&self, nodes: &mut [&mut Node]) {
        self.clock.advance(chrono::Duration::milliseconds(100));
        self.channel.tick();
        for node in nodes {
            node.poll_inbox();
        }
    }

    fn next_delivery(&mut self) -> Option<(u32, u32, Vec<u8>)> {
        while let Ok(event) = self.events.try_recv() {
            if let NodeEvent::DataDelivered {
                node_id,
                from,
                payload,
            } = event
            {
                return Some((node_id, from, payload));
            }
        }
        None
    }
}

/// Two nodes within range find each other after one beacon
/// period and hold symmetric single-hop routes.
#[test]
fn two_node_neighbor_discovery() {
    let sim = Sim::new();
    let config = NodeConfig::with_bitrate(10_000);
    let mut a = sim.node(1, 0.0, 0.0, config.clone());
    let mut b = sim.node(2, 1_000.0, 0.0, config);

    sim.clock.advance(chrono::Duration::seconds(6));
    a.housekeeping();
    b.housekeeping();
    sim.step(&mut [&mut a, &mut b]); // beacons land, ACKs go out
    sim.step(&mut [&mut a, &mut b]); // ACKs land

    assert!(a.knows_peer(2));
    assert!(b.knows_peer(1));
    let ab = a.route_to(2).expect("a routes to b");
    assert_eq!((ab.next_hop, ab.metric), (2, 1));
    let ba = b.route_to(1).expect("b routes to a");
    assert_eq!((ba.next_hop, ba.metric), (1, 1));
}

/// One full beacon round with everyone in range leaves every local map
/// complete.
#[test]
fn full_beacon_round_completes_every_local_map() {
    let sim = Sim::new();
    let config = NodeConfig::with_bitrate(10_000);
    let mut nodes = vec![
        sim.node(1, 0.0, 0.0, config.clone()),
        sim.node(2, 1_000.0, 0.0, config.clone()),
        sim.node(3, 0.0, 1_000.0, config.clone()),
        sim.node(4, 1_000.0, 1_000.0, config),
    ];

    sim.clock.advance(chrono::Duration::seconds(6));
    for node in &mut nodes {
        node.housekeeping();
    }
    let mut refs: Vec<&mut Node> = nodes.iter_mut().collect();
    sim.step(&mut refs);

    for node in &nodes {
        assert_eq!(node.local_map_len(), 4, "node {} sees everyone", node.id());
        for id in 1..=4 {
            assert!(node.knows_peer(id));
        }
    }
}

/// Out-of-range nodes stay invisible to each other and every
/// attempt lands on the distance counter.
#[test]
fn out_of_range_silence() {
    let sim = Sim::new();
    let config = NodeConfig::with_bitrate(10_000);
    let mut a = sim.node(1, 0.0, 0.0, config.clone());
    let mut b = sim.node(2, 20_000.0, 0.0, config);

    for _ in 0..3 {
        sim.clock.advance(chrono::Duration::seconds(6));
        a.housekeeping();
        b.housekeeping();
        sim.step(&mut [&mut a, &mut b]);
    }

    assert!(!a.knows_peer(2));
    assert!(!b.knows_peer(1));
    assert_eq!(a.local_map_len(), 1);
    assert_eq!(b.local_map_len(), 1);

    let counters = sim.channel.counters();
    assert!(counters.failed_distance >= 6, "every beacon attempt counted");
    assert_eq!(counters.success, 0);
    assert_eq!(counters.total, counters.failed_distance);
}

/// A chain A - B - C where each end only reaches the middle. A's
/// send triggers discovery; the RREQ reaches C, the RREP comes back, and
/// the delayed DATA is delivered across two hops.
#[test]
fn three_hop_route_discovery_delivers_delayed_data() {
    let mut sim = Sim::new();
    // Short route TTL so the warm neighbor routes from the beacon round can
    // be aged out while the local maps stay populated.
    let config = NodeConfig {
        bitrate: 10_000,
        scan_interval: Duration::from_secs(1),
        neighbor_timeout: Duration::from_secs(3_600),
        route_ttl: Duration::from_secs(1),
        ..NodeConfig::default()
    };
    let mut a = sim.node(1, 0.0, 0.0, config.clone());
    let mut b = sim.node(2, 8_000.0, 0.0, config.clone());
    let mut c = sim.node(3, 16_000.0, 0.0, config);

    // Beacon round: everyone learns their radio neighbors.
    sim.clock.advance(chrono::Duration::milliseconds(1_500));
    a.housekeeping();
    b.housekeeping();
    c.housekeeping();
    sim.step(&mut [&mut a, &mut b, &mut c]);
    sim.step(&mut [&mut a, &mut b, &mut c]);
    assert!(a.knows_peer(2) && !a.knows_peer(3));
    assert!(b.knows_peer(1) && b.knows_peer(3));
    assert!(c.knows_peer(2) && !c.knows_peer(1));

    // Age the neighbor routes out; the maps survive.
    sim.clock.advance(chrono::Duration::milliseconds(1_500));
    assert!(b.route_to(3).is_none());

    // Refresh only the A<->B adjacency so the reply path home exists.
    a.housekeeping();
    sim.step(&mut [&mut b]); // B: beacon in, ACK out, route to A
    sim.step(&mut [&mut a]); // A: ACK in, route to B

    // The send has no route: the frame parks and an RREQ goes to B.
    a.send_data(3, b"hi").unwrap();
    assert_eq!(a.delayed_pending(3), 1);

    sim.step(&mut [&mut b]); // B relays the RREQ to C (A excluded)
    sim.step(&mut [&mut c]); // C answers with an RREP toward A
    sim.step(&mut [&mut b]); // B forwards the RREP and learns 3 via C
    sim.step(&mut [&mut a]); // A installs the route and flushes the DATA
    sim.step(&mut [&mut b]); // B relays the DATA
    sim.step(&mut [&mut c]); // C delivers it

    let route = a.route_to(3).expect("discovered route");
    assert_eq!(route.next_hop, 2);
    assert!(route.metric >= 2);
    assert_eq!(a.delayed_pending(3), 0);

    let learned = b.route_to(3).expect("relay learned the route");
    assert_eq!(learned.next_hop, 3);

    let (node_id, from, payload) = sim.next_delivery().expect("application observed the message");
    assert_eq!((node_id, from), (3, 1));
    assert_eq!(payload, b"hi");
}

/// A second registration under a taken id fails and mutates
/// nothing.
#[test]
fn duplicate_id_registration_is_rejected() {
    let sim = Sim::new();
    let config = NodeConfig::with_bitrate(10_000);
    let _a = sim.node(1, 0.0, 0.0, config.clone());

    let err = Node::new(
        1,
        Position::new(9_999.0, 9_999.0),
        config,
        &sim.channel,
        sim.events_tx.clone(),
    )
    .unwrap_err();
    assert_eq!(err, ChannelError::DuplicateId(1));

    assert_eq!(sim.channel.node_ids(), vec![1]);
    let snapshot = sim.channel.snapshot_state(None);
    assert_eq!(snapshot.nodes[0].position, Position::new(0.0, 0.0));
    assert_eq!(sim.channel.counters().total, 0);
}

/// Removing a node purges its queued deliveries; the pending
/// frame never fires.
#[test]
fn node_removal_purges_the_delivery_queue() {
    let sim = Sim::new();
    let config = NodeConfig::with_bitrate(10_000);
    let mut a = sim.node(1, 0.0, 0.0, config.clone());
    let mut b = sim.node(2, 1_000.0, 0.0, config);

    let record = PositionRecord::new(b.position(), sim.clock.now());
    a.handle_frame(Frame::ack(2, 1, &record));
    a.send_data(2, b"doomed").unwrap();
    assert_eq!(sim.channel.pending_len(), 1);

    assert!(sim.channel.remove_node(2));
    assert_eq!(sim.channel.pending_len(), 0);

    sim.clock.advance(chrono::Duration::seconds(5));
    assert_eq!(sim.channel.tick(), 0, "tick is a no-op after the purge");
    assert_eq!(b.poll_inbox(), 0, "the delivery never fired");
}

/// An expired route disappears from the published snapshot and
/// the next send falls back to a fresh discovery.
#[test]
fn route_expiry_triggers_rediscovery() {
    let mut sim = Sim::new();
    let config = NodeConfig {
        bitrate: 10_000,
        route_ttl: Duration::from_millis(500),
        neighbor_timeout: Duration::from_secs(3_600),
        ..NodeConfig::default()
    };
    let mut a = sim.node(1, 0.0, 0.0, config.clone());
    let mut b = sim.node(2, 1_000.0, 0.0, config);

    let record = PositionRecord::new(b.position(), sim.clock.now());
    a.handle_frame(Frame::ack(2, 1, &record));
    assert!(a.route_to(2).is_some());

    // Past the TTL the snapshot no longer lists the route.
    sim.clock.advance(chrono::Duration::seconds(1));
    a.command_sender().send("route".to_string()).unwrap();
    a.housekeeping();
    match sim.events.try_recv().unwrap() {
        NodeEvent::Routes { entries, .. } => assert!(entries.is_empty()),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(a.route_to(2).is_none());

    // The next send parks the frame and re-discovers; B answers its own
    // RREQ, the route comes back and the frame flows.
    a.send_data(2, b"retry").unwrap();
    assert_eq!(a.delayed_pending(2), 1);

    sim.step(&mut [&mut b]); // RREQ reaches B, RREP comes back
    sim.step(&mut [&mut a]); // A reinstalls the route, flushes the DATA
    sim.step(&mut [&mut b]); // B delivers

    let (node_id, from, payload) = sim.next_delivery().expect("message arrived after rediscovery");
    assert_eq!((node_id, from), (2, 1));
    assert_eq!(payload, b"retry");
}

/// The counter identity `total = success + failed_distance +
/// failed_transmission` survives a mix of outcomes.
#[test]
fn counter_identity_holds_under_mixed_outcomes() {
    let sim = Sim::new();
    let config = NodeConfig::with_bitrate(10_000);
    let mut a = sim.node(1, 0.0, 0.0, config.clone());
    let _b = sim.node(2, 1_000.0, 0.0, config.clone());
    let _far = sim.node(3, 25_000.0, 0.0, config);

    let now = sim.clock.now();
    let rec = PositionRecord::new(a.position(), now);
    a.handle_frame(Frame::ack(2, 1, &rec)); // route to 2
    a.send_data(2, b"ok").unwrap(); // success
    a.send_data(3, b"too far").unwrap(); // parks; RREQ to 2 (in range)

    // Direct attempts to the far node fail on distance.
    sim.channel.transmit(Frame::data(1, 3, b"x".to_vec(), now), 1, 3);

    let counters = sim.channel.counters();
    assert_eq!(
        counters.total,
        counters.success + counters.failed_distance + counters.failed_transmission
    );
    assert!(counters.success >= 2);
    assert_eq!(counters.failed_distance, 1);
}
