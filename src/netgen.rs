//! Random network generation.
//!
//! Builds a population of nodes with uniformly random positions, bitrates
//! and (for most of them) a random velocity and heading. Used by the binary
//! when no saved session is loaded; tests pin the RNG seed for reproducible
//! layouts.

use std::sync::Arc;

use rand::Rng;

use crate::channel::Channel;
use crate::config::{NodeConfig, V_MAX};
use crate::error::ChannelError;
use crate::events::EventSender;
use crate::node::Node;
use crate::spatial::Position;

#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub num_nodes: usize,
    /// Nodes land in the square `[0, 2 * area_size]^2`.
    pub area_size: f64,
    pub bitrate_range: (u32, u32),
    /// Probability that a node is mobile.
    pub mobile_prob: f64,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            num_nodes: 8,
            area_size: 10_000.0,
            bitrate_range: (5_000, 20_000),
            mobile_prob: 0.9,
        }
    }
}

/// Creates `spec.num_nodes` nodes with ids `1..=n` and registers them with
/// the channel. Nodes are returned unspawned so the caller decides when
/// their tasks start.
pub fn generate<R: Rng>(
    spec: &NetworkSpec,
    channel: &Arc<Channel>,
    base: &NodeConfig,
    events: &EventSender,
    rng: &mut R,
) -> Result<Vec<Node>, ChannelError> {
    let mut nodes = Vec::with_capacity(spec.num_nodes);
    for id in 1..=spec.num_nodes as u32 {
        let position = Position::new(
            rng.gen_range(0.0..=spec.area_size * 2.0),
            rng.gen_range(0.0..=spec.area_size * 2.0),
        );
        let bitrate = rng.gen_range(spec.bitrate_range.0..=spec.bitrate_range.1);

        let (velocity, direction) = if rng.gen::<f64>() < spec.mobile_prob {
            (
                rng.gen_range(1.0..=V_MAX),
                rng.gen_range(0.0..std::f64::consts::TAU),
            )
        } else {
            (0.0, 0.0)
        };

        let config = NodeConfig {
            bitrate,
            velocity,
            direction,
            ..base.clone()
        };
        nodes.push(Node::new(id, position, config, channel, events.clone())?);
    }
    Ok(nodes)
}
