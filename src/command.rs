//! Operator command grammar.
//!
//! Commands arrive as whitespace-separated text lines; the first token is a
//! case-insensitive verb. `send` joins the remaining tail into one message
//! payload.

use crate::error::CommandError;

/// Per-node diagnostic verbosity, adjusted with `log <level>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Error,
    Warn,
    Info,
    Debug,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Error => "error",
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
        }
    }
}

impl std::str::FromStr for Verbosity {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Verbosity::Error),
            "warn" | "warning" => Ok(Verbosity::Warn),
            "info" => Ok(Verbosity::Info),
            "debug" => Ok(Verbosity::Debug),
            other => Err(CommandError::BadLogLevel(other.to_string())),
        }
    }
}

/// A parsed operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    Info,
    Scan,
    Send { target: u32, message: String },
    Routes,
    Nodes,
    FindRoute { target: u32 },
    LogLevel(Verbosity),
    Help,
}

impl NodeCommand {
    /// Parses one command line. An empty line parses to nothing to execute
    /// and is reported as a usage error by the caller's match on `Err`.
    pub fn parse(line: &str) -> Result<NodeCommand, CommandError> {
        let mut tokens = line.split_whitespace();
        let verb = tokens
            .next()
            .ok_or(CommandError::Usage("<command> [args...]"))?;

        match verb.to_ascii_lowercase().as_str() {
            "info" => Ok(NodeCommand::Info),
            "scan" => Ok(NodeCommand::Scan),
            "route" | "routes" => Ok(NodeCommand::Routes),
            "nodes" => Ok(NodeCommand::Nodes),
            "help" => Ok(NodeCommand::Help),
            "send" => {
                let target = parse_node_id(tokens.next().ok_or(CommandError::Usage(
                    "send <id> <message...>",
                ))?)?;
                let message = tokens.collect::<Vec<_>>().join(" ");
                if message.is_empty() {
                    return Err(CommandError::Usage("send <id> <message...>"));
                }
                Ok(NodeCommand::Send { target, message })
            }
            "findroute" => {
                let target = parse_node_id(
                    tokens
                        .next()
                        .ok_or(CommandError::Usage("findroute <id>"))?,
                )?;
                Ok(NodeCommand::FindRoute { target })
            }
            "log" => {
                let level = tokens
                    .next()
                    .ok_or(CommandError::Usage("log <error|warn|info|debug>"))?;
                Ok(NodeCommand::LogLevel(level.parse()?))
            }
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }
}

fn parse_node_id(token: &str) -> Result<u32, CommandError> {
    token
        .parse::<u32>()
        .map_err(|_| CommandError::BadNodeId(token.to_string()))
}

/// Help text published in response to `help`.
pub const HELP_TEXT: &str = "\
commands:
  info                 node summary
  scan                 emit a BEACON immediately
  send <id> <message>  send a message to a node
  route                show the routing table
  nodes                show the local map
  findroute <id>       report or discover a route
  log <level>          set diagnostic verbosity (error|warn|info|debug)
  help                 this text";
