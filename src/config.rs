//! Simulation constants and tunable configuration.
//!
//! The defaults reproduce the reference radio model: a 10 km coverage
//! radius, bitrates between 32 bit/s and 37 kbit/s, 5-second discovery
//! cadence and 60-second route lifetimes. Tests narrow the timers through
//! [`NodeConfig`] instead of patching constants.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Radio coverage radius `R` in meters.
pub const COVERAGE_RADIUS: f64 = 10_000.0;

/// Maximum node speed in m/s (60 km/h).
pub const V_MAX: f64 = 16.67;

/// Admissible bitrates in bit/s.
pub const BITRATE_RANGE: (u32, u32) = (32, 37_000);

/// Signal propagation speed in m/s.
pub const PROPAGATION_SPEED: f64 = 3.0e8;

/// Attenuation coefficient of the loss model.
pub const PATH_LOSS_ALPHA: f64 = 0.3;

/// BEACON emission period.
pub const T_SCAN: Duration = Duration::from_secs(5);

/// Staleness limit for local-map entries.
pub const T_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifetime of a routing-table entry.
pub const ROUTE_TTL: Duration = Duration::from_secs(60);

/// Hop cap carried by route requests.
pub const MAX_ROUTE_HOPS: u32 = 10;

/// Cadence of the node control loop and the channel pump.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Default hop budget for control frames.
pub const CONTROL_TTL: u32 = 10;

/// Hop budget for DATA frames, which may cross several relays.
pub const DATA_TTL: u32 = 20;

/// Radio-channel parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Coverage radius in meters; frames beyond it are dropped outright.
    pub coverage_radius: f64,
    /// Attenuation coefficient `alpha` of the loss model.
    pub path_loss_alpha: f64,
    /// When `false`, the probabilistic loss draw is skipped and every
    /// in-range frame is scheduled. Scenario tests rely on this.
    pub loss_enabled: bool,
    /// Seed for the channel's random source. `None` seeds from entropy;
    /// pinning it makes loss and jitter draws reproducible.
    pub seed: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            coverage_radius: COVERAGE_RADIUS,
            path_loss_alpha: PATH_LOSS_ALPHA,
            loss_enabled: true,
            seed: None,
        }
    }
}

/// Per-node parameters. Kinematics are part of the configuration so a
/// restored session can recreate nodes exactly as they were saved.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Transmission bitrate in bit/s.
    pub bitrate: u32,
    /// Scalar speed in m/s.
    pub velocity: f64,
    /// Heading in radians, 0 pointing along +x.
    pub direction: f64,
    /// BEACON period.
    pub scan_interval: Duration,
    /// Local-map staleness limit.
    pub neighbor_timeout: Duration,
    /// Routing-entry lifetime.
    pub route_ttl: Duration,
    /// Control-loop cadence.
    pub tick_interval: Duration,
    /// Hop cap for route requests this node originates.
    pub max_route_hops: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bitrate: 5_000,
            velocity: 0.0,
            direction: 0.0,
            scan_interval: T_SCAN,
            neighbor_timeout: T_TIMEOUT,
            route_ttl: ROUTE_TTL,
            tick_interval: TICK_INTERVAL,
            max_route_hops: MAX_ROUTE_HOPS,
        }
    }
}

impl NodeConfig {
    /// Convenience for the common case of a stationary node with a given
    /// bitrate.
    pub fn with_bitrate(bitrate: u32) -> Self {
        Self {
            bitrate,
            ..Self::default()
        }
    }
}
