//! Operator console for the mesh simulator.
//!
//! This binary is a seam consumer: it builds (or restores) a network, keeps
//! the channel pump and the node tasks running, and bridges stdin lines to
//! the currently selected node's command mailbox. Everything a node reports
//! comes back over the event stream and is printed as it arrives.
//!
//! Console meta-commands, handled here rather than by a node:
//! `switch <id>`, `kill`, `save <path>`, `exit`/`q`.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use manet_sim::netgen::{self, NetworkSpec};
use manet_sim::snapshot;
use manet_sim::{event_channel, Channel, ChannelConfig, EventSender, Node, NodeConfig, SimClock};

#[derive(Parser, Debug)]
#[command(name = "manet-sim", about = "Self-organizing mobile ad-hoc mesh simulator")]
struct Args {
    /// Saved session to restore.
    #[arg(short, long)]
    load: Option<PathBuf>,

    /// Number of randomly generated nodes when starting fresh.
    #[arg(long, default_value_t = 8)]
    nodes: usize,

    /// Seed for the network layout and the channel's loss/jitter draws.
    #[arg(long)]
    seed: Option<u64>,

    /// Deployment area parameter: nodes land in [0, 2*area]^2 meters.
    #[arg(long, default_value_t = 10_000.0)]
    area: f64,

    /// Disable the probabilistic loss model (range checks still apply).
    #[arg(long)]
    no_loss: bool,
}

fn channel_config(args: &Args) -> ChannelConfig {
    ChannelConfig {
        loss_enabled: !args.no_loss,
        seed: args.seed,
        ..ChannelConfig::default()
    }
}

/// Builds the network: a restored session when `--load` parses, a fresh
/// random one otherwise.
fn build_network(args: &Args, events: &EventSender) -> Result<(Arc<Channel>, Vec<Node>)> {
    if let Some(path) = &args.load {
        match snapshot::load(path) {
            Ok(saved) => {
                let restored =
                    snapshot::restore(&saved, channel_config(args), &NodeConfig::default(), events)
                        .context("restoring the saved session")?;
                info!(path = %path.display(), "restored saved session");
                return Ok((restored.channel, restored.nodes));
            }
            Err(err) => {
                // No state was loaded; say so and start fresh instead.
                warn!(path = %path.display(), %err, "could not load session; generating a new network");
            }
        }
    }

    let clock = SimClock::live();
    let channel = Channel::new(clock, channel_config(args));
    let spec = NetworkSpec {
        num_nodes: args.nodes,
        area_size: args.area,
        ..NetworkSpec::default()
    };
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let nodes = netgen::generate(&spec, &channel, &NodeConfig::default(), events, &mut rng)
        .context("generating the network")?;
    Ok((channel, nodes))
}

fn prompt(current: Option<u32>) {
    match current {
        Some(id) => print!("node_{id}> "),
        None => print!("> "),
    }
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let (events_tx, mut events_rx) = event_channel();
    let (channel, nodes) = build_network(&args, &events_tx)?;

    let mut handles: BTreeMap<u32, manet_sim::NodeHandle> = nodes
        .into_iter()
        .map(|node| (node.id(), node.spawn()))
        .collect();
    let pump = channel.spawn_pump();

    // Everything the nodes report lands on stdout as it arrives.
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            println!("{event}");
        }
    });

    let mut current = handles.keys().next().copied();
    println!("=== self-organizing mesh: {} nodes ===", handles.len());
    println!("node commands: info, scan, send, route, nodes, findroute, log, help");
    println!("console commands: switch <id>, kill, save <path>, exit");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    prompt(current);
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            prompt(current);
            continue;
        }

        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or_default().to_ascii_lowercase();
        match verb.as_str() {
            "exit" | "q" => break,
            "switch" => match tokens.next().and_then(|t| t.parse::<u32>().ok()) {
                Some(id) if handles.contains_key(&id) => {
                    current = Some(id);
                    println!("switched to node {id}");
                }
                Some(id) => println!("no node with id {id}"),
                None => println!("usage: switch <id>"),
            },
            "kill" => match current {
                Some(id) if handles.len() > 1 => {
                    if let Some(handle) = handles.remove(&id) {
                        handle.stop().await;
                        channel.remove_node(id);
                        println!("node {id} stopped and removed");
                    }
                    current = handles.keys().next().copied();
                    if let Some(next) = current {
                        println!("switched to node {next}");
                    }
                }
                Some(_) => println!("refusing to remove the last node"),
                None => println!("no node selected"),
            },
            "save" => match tokens.next() {
                Some(path) => {
                    let path = PathBuf::from(path);
                    match snapshot::save(&channel, &path) {
                        Ok(()) => println!("session saved to {}", path.display()),
                        Err(err) => error!(%err, "saving the session failed"),
                    }
                }
                None => println!("usage: save <path>"),
            },
            _ => match current {
                Some(id) => {
                    let delivered = handles
                        .get(&id)
                        .map(|handle| handle.send_command(&line))
                        .unwrap_or(false);
                    if !delivered {
                        println!("node {id} is not accepting commands");
                    }
                    // Give the node a tick to answer before re-prompting.
                    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
                }
                None => println!("no active nodes"),
            },
        }
        prompt(current);
    }

    info!("shutting down");
    join_all(handles.into_values().map(|handle| handle.stop())).await;
    pump.stop().await;
    printer.abort();
    Ok(())
}
