//! A mesh node and its control loop.
//!
//! Each node owns its kinematic state, routing table, local map and
//! delayed-frame queue outright; nothing else touches them. The task drains
//! three inputs through `select!`: a ~100 ms housekeeping tick, the inbound
//! frame queue fed by the channel, and a control queue for operator moves.
//! Operator command lines arrive through a separate mailbox drained at most
//! one per tick.
//!
//! All protocol handling is synchronous (`transmit` is a plain call into
//! the channel), so the state machine can also be driven by hand, which is
//! how the deterministic scenario tests work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, NodeControl};
use crate::clock::SimClock;
use crate::command::{NodeCommand, Verbosity, HELP_TEXT};
use crate::config::NodeConfig;
use crate::error::{ChannelError, CommandError};
use crate::events::{EventSender, NeighborView, NodeEvent, NodeSummary, RouteView};
use crate::frame::{Frame, FrameKind, PositionRecord, RouteReply, RouteRequest};
use crate::routing::{DelayedFrames, LocalMap, RoutingEntry, RoutingTable};
use crate::spatial::{NodeState, Position};

#[derive(Debug)]
pub struct Node {
    id: u32,
    config: NodeConfig,
    state: NodeState,
    channel: Arc<Channel>,
    clock: Arc<SimClock>,
    routing: RoutingTable,
    local_map: LocalMap,
    delayed: DelayedFrames,
    inbox: mpsc::UnboundedReceiver<Frame>,
    control: mpsc::UnboundedReceiver<NodeControl>,
    commands: mpsc::UnboundedReceiver<String>,
    command_tx: mpsc::UnboundedSender<String>,
    events: EventSender,
    last_beacon: DateTime<Utc>,
    stop: Arc<AtomicBool>,
    verbosity: Verbosity,
    errors_seen: u64,
}

impl Node {
    /// Creates a node and registers it with the channel. Fails with
    /// [`ChannelError::DuplicateId`] when the id is taken, leaving the
    /// channel untouched.
    pub fn new(
        id: u32,
        position: Position,
        config: NodeConfig,
        channel: &Arc<Channel>,
        events: EventSender,
    ) -> Result<Self, ChannelError> {
        let clock = Arc::clone(channel.clock());
        let now = clock.now();
        let state = NodeState::new(position, config.velocity, config.direction, now);

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        channel.register(id, state.clone(), config.bitrate, inbox_tx, ctl_tx)?;
        info!(
            node = id,
            x = format_args!("{:.1}", position.x),
            y = format_args!("{:.1}", position.y),
            "node created"
        );

        Ok(Self {
            id,
            state,
            channel: Arc::clone(channel),
            clock,
            routing: RoutingTable::new(id),
            local_map: LocalMap::new(id, position, now),
            delayed: DelayedFrames::default(),
            inbox: inbox_rx,
            control: ctl_rx,
            commands: command_rx,
            command_tx,
            events,
            last_beacon: now,
            stop: Arc::new(AtomicBool::new(false)),
            verbosity: Verbosity::Info,
            errors_seen: 0,
            config,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn position(&self) -> Position {
        self.state.position
    }

    pub fn bitrate(&self) -> u32 {
        self.config.bitrate
    }

    /// Sender half of the operator command mailbox.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<String> {
        self.command_tx.clone()
    }

    /// Usable route to `destination`, pruning an expired entry on the way.
    pub fn route_to(&mut self, destination: u32) -> Option<RoutingEntry> {
        let now = self.clock.now();
        self.routing.route_to(destination, now).cloned()
    }

    /// Whether `id` is present in the local map.
    pub fn knows_peer(&self, id: u32) -> bool {
        self.local_map.contains(id)
    }

    pub fn local_map_len(&self) -> usize {
        self.local_map.len()
    }

    pub fn delayed_pending(&self, destination: u32) -> usize {
        self.delayed.pending(destination)
    }

    /// One control-loop iteration: expire, integrate motion, beacon when
    /// due, and execute at most one pending operator command.
    pub fn housekeeping(&mut self) {
        let now = self.clock.now();

        // 1. Expiry. A peer dropped from the local map takes its route along.
        let stale = self.local_map.prune_stale(now, self.config.neighbor_timeout);
        for id in &stale {
            if self.verbosity >= Verbosity::Debug {
                debug!(node = self.id, peer = id, "peer timed out of the local map");
            }
            self.routing.remove(*id);
        }
        let expired = self.routing.prune_expired(now);
        if !expired.is_empty() && self.verbosity >= Verbosity::Debug {
            debug!(node = self.id, routes = ?expired, "routes expired");
        }

        // 2. Motion.
        if self.state.advance_to(now) {
            self.local_map.refresh_own(self.state.position, now);
            self.channel.publish_state(self.id, self.state.clone());
        }

        // 3. Beacon.
        let scan_due = chrono::Duration::from_std(self.config.scan_interval)
            .map(|period| now - self.last_beacon >= period)
            .unwrap_or(false);
        if scan_due {
            self.emit_beacon(now);
            self.last_beacon = now;
        }

        // 4. At most one operator command per tick.
        if let Ok(line) = self.commands.try_recv() {
            self.execute_command(&line);
        }
    }

    /// Drains every frame currently in the inbox. The async loop reacts per
    /// frame; this is the hand-driven equivalent used by scenario tests.
    pub fn poll_inbox(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(frame) = self.inbox.try_recv() {
            self.handle_frame(frame);
            handled += 1;
        }
        handled
    }

    /// Drains pending control messages.
    pub fn poll_control(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(ctl) = self.control.try_recv() {
            self.handle_control(ctl);
            handled += 1;
        }
        handled
    }

    fn handle_control(&mut self, ctl: NodeControl) {
        match ctl {
            NodeControl::MoveTo(position) => {
                let now = self.clock.now();
                self.state.teleport(position, now);
                self.local_map.refresh_own(position, now);
                self.channel.publish_state(self.id, self.state.clone());
                info!(
                    node = self.id,
                    x = format_args!("{:.1}", position.x),
                    y = format_args!("{:.1}", position.y),
                    "moved by operator"
                );
            }
        }
    }

    /// Protocol dispatch for one received frame. Malformed frames are
    /// dropped here; nothing a peer sends can take the node down.
    pub fn handle_frame(&mut self, frame: Frame) {
        if !frame.verify_crc() {
            warn!(node = self.id, %frame, "crc mismatch; frame dropped");
            return;
        }
        let now = self.clock.now();
        if self.verbosity >= Verbosity::Debug {
            debug!(node = self.id, %frame, "frame received");
        }

        // Position-carrying frames refresh the local map before dispatch.
        let mut record = None;
        if frame.kind().carries_position() {
            match PositionRecord::parse(frame.payload()) {
                Ok(rec) => {
                    self.local_map.observe(frame.sender(), rec.position, rec.timestamp);
                    record = Some(rec);
                }
                Err(err) => {
                    warn!(node = self.id, sender = frame.sender(), %err, "bad position record");
                    return;
                }
            }
        }

        match frame.kind() {
            FrameKind::Beacon => self.handle_beacon(&frame, now),
            FrameKind::Ack => self.handle_ack(&frame, now),
            FrameKind::Syn => {
                let record = record.expect("position record parsed above");
                self.handle_syn(&frame, record, now);
            }
            FrameKind::Rreq => self.handle_rreq(&frame, now),
            FrameKind::Rrep => self.handle_rrep(&frame, now),
            FrameKind::Data => self.handle_data(&frame, now),
            FrameKind::Error => self.handle_error(&frame),
        }
    }

    fn handle_beacon(&mut self, frame: &Frame, now: DateTime<Utc>) {
        let record = PositionRecord::new(self.state.position, now);
        let ack = Frame::ack(self.id, frame.sender(), &record);
        self.channel.transmit(ack, self.id, frame.sender());
        self.install_route(frame.sender(), frame.sender(), 1, now);
    }

    fn handle_ack(&mut self, frame: &Frame, now: DateTime<Utc>) {
        self.install_route(frame.sender(), frame.sender(), 1, now);
    }

    fn handle_syn(&mut self, frame: &Frame, record: PositionRecord, now: DateTime<Utc>) {
        let distance = self.state.position.distance_to(&record.position);
        if distance > self.channel.config().coverage_radius {
            if self.verbosity >= Verbosity::Debug {
                debug!(node = self.id, sender = frame.sender(), "SYN from outside coverage");
            }
            return;
        }
        let own = PositionRecord::new(self.state.position, now);
        let ack = Frame::ack(self.id, frame.sender(), &own);
        self.channel.transmit(ack, self.id, frame.sender());
        self.install_route(frame.sender(), frame.sender(), 1, now);
    }

    fn handle_rreq(&mut self, frame: &Frame, now: DateTime<Utc>) {
        let request = match RouteRequest::parse(frame.payload()) {
            Ok(req) => req,
            Err(err) => {
                warn!(node = self.id, %err, "malformed RREQ; dropped");
                return;
            }
        };
        let hops_here = frame.hop_count() + 1;

        // Our own request relayed back to us.
        if frame.sender() == self.id {
            return;
        }

        if request.target_id == self.id {
            let reply = RouteReply {
                source_id: self.id,
                target_id: request.source_id,
                hop_count: hops_here,
                metric: hops_here,
            };
            self.channel
                .transmit(Frame::rrep(self.id, &reply, now), self.id, frame.sender());
            return;
        }

        if let Some(metric) = self
            .routing
            .route_to(request.target_id, now)
            .map(|entry| entry.metric)
        {
            let total = hops_here + metric;
            let reply = RouteReply {
                source_id: request.target_id,
                target_id: request.source_id,
                hop_count: total,
                metric: total,
            };
            self.channel
                .transmit(Frame::rrep(self.id, &reply, now), self.id, frame.sender());
            return;
        }

        if hops_here >= request.max_hops {
            if self.verbosity >= Verbosity::Debug {
                debug!(node = self.id, target = request.target_id, "RREQ hop cap reached");
            }
            return;
        }

        // Nothing to answer with: spread the request, skipping whoever just
        // sent it to us.
        let relay = Frame::rreq(self.id, &request, hops_here, now);
        for neighbor in self.local_map.neighbors() {
            if neighbor != frame.sender() {
                self.channel.transmit(relay.clone(), self.id, neighbor);
            }
        }
    }

    fn handle_rrep(&mut self, frame: &Frame, now: DateTime<Utc>) {
        let reply = match RouteReply::parse(frame.payload()) {
            Ok(rep) => rep,
            Err(err) => {
                warn!(node = self.id, %err, "malformed RREP; dropped");
                return;
            }
        };

        if reply.target_id == self.id {
            // Discovery we initiated has come home.
            self.install_route(reply.source_id, frame.sender(), reply.hop_count, now);
            return;
        }

        let next_hop = self
            .routing
            .route_to(reply.target_id, now)
            .map(|entry| entry.next_hop);
        match next_hop {
            Some(next_hop) => {
                let forwarded = RouteReply {
                    hop_count: reply.hop_count + 1,
                    ..reply
                };
                self.channel
                    .transmit(Frame::rrep(self.id, &forwarded, now), self.id, next_hop);
                self.install_route(reply.source_id, frame.sender(), reply.hop_count, now);
            }
            None => {
                if self.verbosity >= Verbosity::Debug {
                    debug!(
                        node = self.id,
                        requester = reply.target_id,
                        "no route back to the requester; RREP dropped"
                    );
                }
            }
        }
    }

    fn handle_data(&mut self, frame: &Frame, now: DateTime<Utc>) {
        match frame.destination() {
            Some(destination) if destination == self.id => {
                info!(node = self.id, from = frame.sender(), "message delivered");
                self.publish(NodeEvent::DataDelivered {
                    node_id: self.id,
                    from: frame.sender(),
                    payload: frame.payload().to_vec(),
                });
            }
            Some(destination) => {
                let next_hop = self
                    .routing
                    .route_to(destination, now)
                    .map(|entry| entry.next_hop);
                match next_hop {
                    Some(next_hop) => match frame.with_incremented_hop() {
                        Some(relay) => {
                            self.channel.transmit(relay, self.id, next_hop);
                        }
                        None => {
                            if self.verbosity >= Verbosity::Debug {
                                debug!(node = self.id, destination, "DATA hop budget exhausted");
                            }
                        }
                    },
                    None => {
                        if self.verbosity >= Verbosity::Debug {
                            debug!(node = self.id, destination, "no route for transit DATA; dropped");
                        }
                    }
                }
            }
            None => warn!(node = self.id, "DATA frame without a destination; dropped"),
        }
    }

    fn handle_error(&mut self, frame: &Frame) {
        // Recorded only; reserved as an extension point.
        self.errors_seen += 1;
        info!(
            node = self.id,
            sender = frame.sender(),
            total = self.errors_seen,
            "ERROR frame recorded"
        );
    }

    /// Application send path. With a route the frame goes straight out; a
    /// transmit failure or a missing route parks it and kicks off discovery.
    pub fn send_data(&mut self, destination: u32, payload: &[u8]) -> Result<(), CommandError> {
        if destination == self.id {
            return Err(CommandError::SelfSend);
        }
        let now = self.clock.now();
        let frame = Frame::data(self.id, destination, payload.to_vec(), now);

        if let Some(entry) = self.routing.route_to(destination, now).cloned() {
            if self.channel.transmit(frame.clone(), self.id, entry.next_hop) {
                if self.verbosity >= Verbosity::Debug {
                    debug!(node = self.id, destination, via = entry.next_hop, "DATA sent");
                }
                return Ok(());
            }
        }
        self.delayed.park(destination, frame);
        self.start_discovery(destination, now);
        Ok(())
    }

    fn start_discovery(&mut self, target: u32, now: DateTime<Utc>) {
        let request = RouteRequest {
            source_id: self.id,
            target_id: target,
            max_hops: self.config.max_route_hops,
        };
        let rreq = Frame::rreq(self.id, &request, 0, now);
        for neighbor in self.local_map.neighbors() {
            self.channel.transmit(rreq.clone(), self.id, neighbor);
        }
        if self.verbosity >= Verbosity::Debug {
            debug!(node = self.id, target, "route discovery started");
        }
    }

    /// Routing upsert plus the delayed-frame flush a fresh route triggers.
    fn install_route(&mut self, destination: u32, next_hop: u32, metric: u32, now: DateTime<Utc>) {
        if self
            .routing
            .upsert(destination, next_hop, metric, now, self.config.route_ttl)
        {
            self.flush_delayed(destination, now);
        }
    }

    fn flush_delayed(&mut self, destination: u32, now: DateTime<Utc>) {
        if self.delayed.pending(destination) == 0 {
            return;
        }
        let next_hop = match self.routing.route_to(destination, now) {
            Some(entry) => entry.next_hop,
            None => return,
        };
        let frames = self.delayed.take(destination);
        for frame in frames {
            if !self.channel.transmit(frame.clone(), self.id, next_hop) {
                // Still unlucky: keep it for the next usable route.
                self.delayed.park(destination, frame);
            }
        }
    }

    fn emit_beacon(&mut self, now: DateTime<Utc>) {
        let record = PositionRecord::new(self.state.position, now);
        let beacon = Frame::beacon(self.id, &record);
        for peer in self.channel.node_ids() {
            if peer != self.id {
                self.channel.transmit(beacon.clone(), self.id, peer);
            }
        }
    }

    fn execute_command(&mut self, line: &str) {
        match NodeCommand::parse(line) {
            Ok(command) => self.run_command(command),
            Err(error) => self.publish(NodeEvent::CommandFailed {
                node_id: self.id,
                error,
            }),
        }
    }

    fn run_command(&mut self, command: NodeCommand) {
        let now = self.clock.now();
        match command {
            NodeCommand::Info => {
                let summary = NodeSummary {
                    node_id: self.id,
                    position: self.state.position,
                    velocity: self.state.velocity,
                    direction: self.state.direction,
                    bitrate: self.config.bitrate,
                    local_map_len: self.local_map.len(),
                    routing_len: self.routing.len(),
                };
                self.publish(NodeEvent::Summary(summary));
            }
            NodeCommand::Scan => self.emit_beacon(now),
            NodeCommand::Send { target, message } => {
                if let Err(error) = self.send_data(target, message.as_bytes()) {
                    self.publish(NodeEvent::CommandFailed {
                        node_id: self.id,
                        error,
                    });
                }
            }
            NodeCommand::Routes => {
                let entries = self
                    .routing
                    .snapshot(now)
                    .into_iter()
                    .map(|entry| RouteView {
                        destination: entry.destination,
                        next_hop: entry.next_hop,
                        metric: entry.metric,
                        expires_in_secs: entry.time_to_live(now),
                    })
                    .collect();
                self.publish(NodeEvent::Routes {
                    node_id: self.id,
                    entries,
                });
            }
            NodeCommand::Nodes => {
                let entries = self
                    .local_map
                    .snapshot()
                    .into_iter()
                    .map(|(id, entry)| NeighborView {
                        node_id: id,
                        position: entry.position,
                        age_secs: (now - entry.last_seen).num_milliseconds() as f64 / 1_000.0,
                    })
                    .collect();
                self.publish(NodeEvent::Neighbors {
                    node_id: self.id,
                    entries,
                });
            }
            NodeCommand::FindRoute { target } => match self.routing.route_to(target, now) {
                Some(entry) => {
                    let event = NodeEvent::RouteFound {
                        node_id: self.id,
                        destination: entry.destination,
                        next_hop: entry.next_hop,
                        metric: entry.metric,
                    };
                    self.publish(event);
                }
                None => {
                    self.publish(NodeEvent::DiscoveryStarted {
                        node_id: self.id,
                        target,
                    });
                    self.start_discovery(target, now);
                }
            },
            NodeCommand::LogLevel(level) => {
                self.verbosity = level;
                self.publish(NodeEvent::CommandOutput {
                    node_id: self.id,
                    text: format!("log level set to {}", level.as_str()),
                });
            }
            NodeCommand::Help => self.publish(NodeEvent::CommandOutput {
                node_id: self.id,
                text: HELP_TEXT.to_string(),
            }),
        }
    }

    fn publish(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    /// Re-anchors the kinematic integrator, used when restoring a session
    /// whose nodes carry a persisted `last_update`.
    pub(crate) fn restore_last_update(&mut self, at: DateTime<Utc>) {
        self.state.last_update = at;
        self.channel.publish_state(self.id, self.state.clone());
    }

    /// The node task: runs until the stop flag is observed.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => self.housekeeping(),
                Some(frame) = self.inbox.recv() => self.handle_frame(frame),
                Some(ctl) = self.control.recv() => self.handle_control(ctl),
            }
        }
        debug!(node = self.id, "node task stopped");
    }

    /// Moves the node onto its own task and returns the operator handle.
    pub fn spawn(self) -> NodeHandle {
        let id = self.id;
        let commands = self.command_tx.clone();
        let stop = Arc::clone(&self.stop);
        let task = tokio::spawn(self.run());
        NodeHandle {
            id,
            commands,
            stop,
            task,
        }
    }
}

/// Operator-side handle to a spawned node.
pub struct NodeHandle {
    id: u32,
    commands: mpsc::UnboundedSender<String>,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queues a command line for the node; `false` once the task is gone.
    pub fn send_command(&self, line: &str) -> bool {
        self.commands.send(line.to_string()).is_ok()
    }

    /// Signals the task to stop and waits for it to exit (at most one tick).
    pub async fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.task.await;
    }
}
