//! The visualization seam.
//!
//! The core exposes a read-only [`TopologySnapshot`]; anything that draws
//! maps, renders frames for a video, or plots coverage implements
//! [`VisualizationSink`] on the outside. The simulator never links against a
//! rendering stack.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::spatial::Position;

/// A node as seen by an observer of the whole simulation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSite {
    pub node_id: u32,
    pub position: Position,
}

/// Instantaneous, read-only view of the network topology.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    pub captured_at: DateTime<Utc>,
    /// Radio coverage radius shared by all nodes.
    pub coverage_radius: f64,
    /// Node whose coverage circle a renderer should highlight, if any.
    pub observer: Option<u32>,
    pub nodes: Vec<NodeSite>,
}

impl TopologySnapshot {
    /// Pairs of nodes within radio range of each other; the usual input for
    /// drawing link lines.
    pub fn in_range_pairs(&self) -> Vec<(u32, u32)> {
        let mut pairs = Vec::new();
        for (i, a) in self.nodes.iter().enumerate() {
            for b in &self.nodes[i + 1..] {
                if a.position.distance_to(&b.position) <= self.coverage_radius {
                    pairs.push((a.node_id, b.node_id));
                }
            }
        }
        pairs
    }
}

/// Renders a topology snapshot into some artifact (an image, a plot, a video
/// frame) and reports where it landed.
pub trait VisualizationSink {
    fn render(&mut self, snapshot: &TopologySnapshot) -> anyhow::Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn in_range_pairs_respects_the_radius() {
        let snapshot = TopologySnapshot {
            captured_at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            coverage_radius: 10_000.0,
            observer: Some(1),
            nodes: vec![
                NodeSite {
                    node_id: 1,
                    position: Position::new(0.0, 0.0),
                },
                NodeSite {
                    node_id: 2,
                    position: Position::new(8_000.0, 0.0),
                },
                NodeSite {
                    node_id: 3,
                    position: Position::new(30_000.0, 0.0),
                },
            ],
        };
        assert_eq!(snapshot.in_range_pairs(), vec![(1, 2)]);
    }
}
