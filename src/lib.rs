//! Discrete-time emulator of a self-organizing mobile ad-hoc mesh.
//!
//! A population of mobile radio nodes autonomously discovers neighbors with
//! periodic BEACONs, builds routing tables through AODV-style RREQ/RREP
//! exchanges, and forwards multi-hop DATA frames over a lossy,
//! distance-attenuated radio channel.
//!
//! Architectural overview:
//! - The [`channel::Channel`] owns the registry of live nodes and a
//!   time-ordered delivery queue; `transmit` applies the range, loss and
//!   delay models and schedules delivery, `tick` hands due frames to their
//!   receivers' inboxes.
//! - Each [`node::Node`] runs its own task: it integrates motion, expires
//!   stale state, emits BEACONs, reacts to inbound frames and drains an
//!   operator command mailbox.
//! - [`clock::SimClock`] is the single time source (live, anchored to a
//!   restored session, or manually advanced in tests).
//! - Front-ends attach only at the seams: the [`events`] stream, the
//!   [`viz`] topology snapshot, and the per-node command mailbox.

pub mod channel;
pub mod clock;
pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod netgen;
pub mod node;
pub mod routing;
pub mod snapshot;
pub mod spatial;
pub mod viz;

pub use channel::{Channel, TransmitCounters};
pub use clock::SimClock;
pub use config::{ChannelConfig, NodeConfig};
pub use error::{ChannelError, CommandError, SnapshotError, WireError};
pub use events::{event_channel, EventSender, EventStream, NodeEvent};
pub use frame::{Frame, FrameKind, PositionRecord, RouteReply, RouteRequest};
pub use node::{Node, NodeHandle};
pub use spatial::{NodeState, Position};
