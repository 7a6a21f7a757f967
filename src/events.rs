//! The observable output of the simulation: everything a node reports back
//! to the operator or hands up to the application layer flows through a
//! single event stream. Front-ends consume [`NodeEvent`]s; the core never
//! prints.

use tokio::sync::mpsc;

use crate::error::CommandError;
use crate::spatial::Position;

pub type EventSender = mpsc::UnboundedSender<NodeEvent>;
pub type EventStream = mpsc::UnboundedReceiver<NodeEvent>;

pub fn event_channel() -> (EventSender, EventStream) {
    mpsc::unbounded_channel()
}

/// One row of a published routing-table snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteView {
    pub destination: u32,
    pub next_hop: u32,
    pub metric: u32,
    pub expires_in_secs: f64,
}

/// One row of a published local-map snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborView {
    pub node_id: u32,
    pub position: Position,
    pub age_secs: f64,
}

/// Summary published by the `info` command.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary {
    pub node_id: u32,
    pub position: Position,
    pub velocity: f64,
    pub direction: f64,
    pub bitrate: u32,
    pub local_map_len: usize,
    pub routing_len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// `info` output.
    Summary(NodeSummary),
    /// `route` output.
    Routes { node_id: u32, entries: Vec<RouteView> },
    /// `nodes` output.
    Neighbors {
        node_id: u32,
        entries: Vec<NeighborView>,
    },
    /// A DATA frame reached its destination: the application-layer delivery.
    DataDelivered {
        node_id: u32,
        from: u32,
        payload: Vec<u8>,
    },
    /// `findroute` found an existing route.
    RouteFound {
        node_id: u32,
        destination: u32,
        next_hop: u32,
        metric: u32,
    },
    /// `findroute` (or a send without a route) kicked off discovery.
    DiscoveryStarted { node_id: u32, target: u32 },
    /// A command line was rejected.
    CommandFailed { node_id: u32, error: CommandError },
    /// Free-form acknowledgement text (`help`, `log` confirmation).
    CommandOutput { node_id: u32, text: String },
}

impl std::fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeEvent::Summary(s) => {
                writeln!(f, "=== Node {} ===", s.node_id)?;
                writeln!(f, "position: ({:.1}, {:.1})", s.position.x, s.position.y)?;
                writeln!(
                    f,
                    "velocity: {:.1} m/s, heading: {:.1} deg",
                    s.velocity,
                    s.direction.to_degrees()
                )?;
                writeln!(f, "bitrate: {} bit/s", s.bitrate)?;
                write!(
                    f,
                    "local map: {} nodes, routing table: {} entries",
                    s.local_map_len, s.routing_len
                )
            }
            NodeEvent::Routes { node_id, entries } => {
                writeln!(f, "=== Routing table of node {} ===", node_id)?;
                if entries.is_empty() {
                    return write!(f, "(empty)");
                }
                writeln!(f, "{:<10}{:<12}{:<8}{}", "dest", "next hop", "metric", "expires")?;
                for (i, e) in entries.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(
                        f,
                        "{:<10}{:<12}{:<8}{:.1} s",
                        e.destination, e.next_hop, e.metric, e.expires_in_secs
                    )?;
                }
                Ok(())
            }
            NodeEvent::Neighbors { node_id, entries } => {
                writeln!(f, "=== Local map of node {} ===", node_id)?;
                if entries.is_empty() {
                    return write!(f, "(empty)");
                }
                writeln!(f, "{:<10}{:<24}{}", "node", "position", "seen")?;
                for (i, e) in entries.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(
                        f,
                        "{:<10}({:.1}, {:.1}){:<6}{:.1} s ago",
                        e.node_id, e.position.x, e.position.y, "", e.age_secs
                    )?;
                }
                Ok(())
            }
            NodeEvent::DataDelivered {
                node_id,
                from,
                payload,
            } => write!(
                f,
                "[node {}] message from node {}: {}",
                node_id,
                from,
                String::from_utf8_lossy(payload)
            ),
            NodeEvent::RouteFound {
                node_id,
                destination,
                next_hop,
                metric,
            } => write!(
                f,
                "[node {}] route to {} via {} (metric {})",
                node_id, destination, next_hop, metric
            ),
            NodeEvent::DiscoveryStarted { node_id, target } => {
                write!(f, "[node {}] route discovery started for {}", node_id, target)
            }
            NodeEvent::CommandFailed { node_id, error } => {
                write!(f, "[node {}] command failed: {}", node_id, error)
            }
            NodeEvent::CommandOutput { node_id, text } => {
                write!(f, "[node {}] {}", node_id, text)
            }
        }
    }
}
