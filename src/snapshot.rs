//! Session persistence.
//!
//! A saved session is one JSON document: counters and the save instant,
//! every node's kinematic state and bitrate, and the frames still sitting in
//! the delivery queue. Frame payloads are not preserved; only type,
//! endpoints and recorded size survive a reload, so nothing downstream may
//! depend on in-flight DATA bytes after a restore.
//!
//! Restoring anchors the clock at the persisted `current_time`, which keeps
//! every relative timestamp in the file (expiries, delivery times)
//! meaningful.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::channel::{Channel, TransmitCounters};
use crate::clock::SimClock;
use crate::config::{ChannelConfig, NodeConfig};
use crate::error::SnapshotError;
use crate::events::EventSender;
use crate::frame::{Frame, FrameKind};
use crate::node::Node;
use crate::spatial::Position;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub metadata: SnapshotMetadata,
    pub nodes: BTreeMap<u32, NodeRecord>,
    pub pending_frames: Vec<PendingFrameRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub save_time: DateTime<Utc>,
    pub stats: SnapshotStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStats {
    #[serde(flatten)]
    pub counters: TransmitCounters,
    pub current_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub position: Position,
    pub bitrate: u32,
    pub state: KinematicRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KinematicRecord {
    pub velocity: f64,
    pub direction: f64,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFrameRecord {
    pub delivery_time: DateTime<Utc>,
    pub receiver_id: u32,
    pub frame: FrameRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender_id: u32,
    pub destination_id: Option<u32>,
    pub size: usize,
}

/// Captures the current channel state as a serializable snapshot.
pub fn capture(channel: &Channel) -> SessionSnapshot {
    let now = channel.clock().now();
    let nodes = channel
        .export_links()
        .into_iter()
        .map(|(id, state, bitrate)| {
            (
                id,
                NodeRecord {
                    position: state.position,
                    bitrate,
                    state: KinematicRecord {
                        velocity: state.velocity,
                        direction: state.direction,
                        last_update: state.last_update,
                    },
                },
            )
        })
        .collect();

    let pending_frames = channel
        .export_pending()
        .into_iter()
        .map(|(delivery_time, receiver_id, frame)| PendingFrameRecord {
            delivery_time,
            receiver_id,
            frame: FrameRecord {
                kind: frame.kind().as_str().to_string(),
                sender_id: frame.sender(),
                destination_id: frame.destination(),
                size: frame.payload().len(),
            },
        })
        .collect();

    SessionSnapshot {
        metadata: SnapshotMetadata {
            save_time: Utc::now(),
            stats: SnapshotStats {
                counters: channel.counters(),
                current_time: now,
            },
        },
        nodes,
        pending_frames,
    }
}

/// Writes a session snapshot to `path` as pretty-printed JSON.
pub fn save(channel: &Channel, path: &Path) -> Result<(), SnapshotError> {
    let snapshot = capture(channel);
    let json = serde_json::to_string_pretty(&snapshot)?;
    fs::write(path, json)?;
    info!(path = %path.display(), nodes = snapshot.nodes.len(), "session saved");
    Ok(())
}

/// Reads a session snapshot from `path`. Any I/O or parse failure means the
/// caller gets no simulator state at all.
pub fn load(path: &Path) -> Result<SessionSnapshot, SnapshotError> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// A restored-but-not-yet-started network: the caller spawns the nodes.
pub struct RestoredNetwork {
    pub channel: Arc<Channel>,
    pub nodes: Vec<Node>,
}

/// Rebuilds a network from a snapshot: anchored clock, restored counters,
/// nodes with their saved kinematics, and re-scheduled pending frames
/// (payloads empty, per the persistence contract).
pub fn restore(
    snapshot: &SessionSnapshot,
    config: ChannelConfig,
    base: &NodeConfig,
    events: &EventSender,
) -> Result<RestoredNetwork, SnapshotError> {
    let clock = SimClock::anchored(snapshot.metadata.stats.current_time);
    let channel = Channel::new(clock, config);
    channel.restore_counters(snapshot.metadata.stats.counters);

    let mut nodes = Vec::with_capacity(snapshot.nodes.len());
    for (&id, record) in &snapshot.nodes {
        let node_config = NodeConfig {
            bitrate: record.bitrate,
            velocity: record.state.velocity,
            direction: record.state.direction,
            ..base.clone()
        };
        let mut node = Node::new(id, record.position, node_config, &channel, events.clone())?;
        node.restore_last_update(record.state.last_update);
        nodes.push(node);
    }

    let pending = snapshot
        .pending_frames
        .iter()
        .filter_map(|record| {
            let kind = FrameKind::from_wire(&record.frame.kind)?;
            let frame = Frame::new(
                kind,
                record.frame.sender_id,
                record.frame.destination_id,
                Vec::new(),
                crate::config::CONTROL_TTL,
                record.delivery_time,
            );
            Some((record.delivery_time, record.receiver_id, frame))
        })
        .collect();
    channel.restore_pending(pending);

    info!(
        nodes = nodes.len(),
        pending = snapshot.pending_frames.len(),
        "session restored"
    );
    Ok(RestoredNetwork { channel, nodes })
}
