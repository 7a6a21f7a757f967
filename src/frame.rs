//! Protocol data units and their wire encoding.
//!
//! A [`Frame`] is an immutable value: once built, the only way to derive a
//! new one is the incremented-hop builder used when relaying. The integrity
//! tag is a CRC-32 over (type, sender, destination, payload), computed at
//! construction and re-verified on reception.
//!
//! Wire layout (big-endian, 40-byte header):
//!
//! ```text
//! 8s  frame type, ascii, zero-padded
//! i32 sender_id
//! i32 destination_id (-1 when absent)
//! i32 ttl
//! i32 hop_count
//! i32 timestamp, epoch seconds
//! i32 metadata length
//! 8x  reserved, zero
//! ```
//!
//! followed by `metadata length` bytes of JSON metadata (starting at offset
//! 40), then the opaque payload.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{CONTROL_TTL, DATA_TTL};
use crate::error::WireError;
use crate::spatial::Position;

/// Fixed size of the packed frame header.
pub const WIRE_HEADER_LEN: usize = 40;

const WIRE_TYPE_LEN: usize = 8;

/// The closed set of frame kinds. The dispatcher matches exhaustively, so a
/// new kind forces every handler site to be revisited at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Beacon,
    Ack,
    Syn,
    Rreq,
    Rrep,
    Data,
    Error,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Beacon => "BEACON",
            FrameKind::Ack => "ACK",
            FrameKind::Syn => "SYN",
            FrameKind::Rreq => "RREQ",
            FrameKind::Rrep => "RREP",
            FrameKind::Data => "DATA",
            FrameKind::Error => "ERROR",
        }
    }

    pub fn from_wire(s: &str) -> Option<FrameKind> {
        match s {
            "BEACON" => Some(FrameKind::Beacon),
            "ACK" => Some(FrameKind::Ack),
            "SYN" => Some(FrameKind::Syn),
            "RREQ" => Some(FrameKind::Rreq),
            "RREP" => Some(FrameKind::Rrep),
            "DATA" => Some(FrameKind::Data),
            "ERROR" => Some(FrameKind::Error),
            _ => None,
        }
    }

    /// Kinds whose payload is a position record.
    pub fn carries_position(&self) -> bool {
        matches!(self, FrameKind::Beacon | FrameKind::Ack | FrameKind::Syn)
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable protocol data unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    kind: FrameKind,
    sender: u32,
    destination: Option<u32>,
    payload: Vec<u8>,
    ttl: u32,
    hop_count: u32,
    timestamp: DateTime<Utc>,
    metadata: Map<String, Value>,
    crc: u32,
}

impl Frame {
    pub fn new(
        kind: FrameKind,
        sender: u32,
        destination: Option<u32>,
        payload: Vec<u8>,
        ttl: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let crc = compute_crc(kind, sender, destination, &payload);
        Self {
            kind,
            sender,
            destination,
            payload,
            ttl,
            hop_count: 0,
            timestamp: now,
            metadata: Map::new(),
            crc,
        }
    }

    /// Periodic self-announcement carrying the sender's position record.
    pub fn beacon(sender: u32, record: &PositionRecord) -> Self {
        Self::new(
            FrameKind::Beacon,
            sender,
            None,
            record.to_bytes(),
            CONTROL_TTL,
            record.timestamp,
        )
    }

    /// Acknowledgement reply, also carrying a position record.
    pub fn ack(sender: u32, destination: u32, record: &PositionRecord) -> Self {
        Self::new(
            FrameKind::Ack,
            sender,
            Some(destination),
            record.to_bytes(),
            CONTROL_TTL,
            record.timestamp,
        )
    }

    /// Connect request; answered with an ACK when the advertised position is
    /// inside coverage.
    pub fn syn(sender: u32, destination: u32, record: &PositionRecord) -> Self {
        Self::new(
            FrameKind::Syn,
            sender,
            Some(destination),
            record.to_bytes(),
            CONTROL_TTL,
            record.timestamp,
        )
    }

    pub fn data(sender: u32, destination: u32, payload: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self::new(FrameKind::Data, sender, Some(destination), payload, DATA_TTL, now)
    }

    pub fn rreq(sender: u32, request: &RouteRequest, hop_count: u32, now: DateTime<Utc>) -> Self {
        let mut frame = Self::new(
            FrameKind::Rreq,
            sender,
            None,
            request.to_payload(),
            request.max_hops,
            now,
        );
        frame.hop_count = hop_count;
        frame
    }

    pub fn rrep(sender: u32, reply: &RouteReply, now: DateTime<Utc>) -> Self {
        let mut frame = Self::new(
            FrameKind::Rrep,
            sender,
            Some(reply.target_id),
            reply.to_payload(),
            CONTROL_TTL,
            now,
        );
        frame.hop_count = reply.hop_count;
        frame
    }

    /// Error report with a JSON `{code, message}` payload.
    pub fn error_report(
        sender: u32,
        destination: u32,
        code: u32,
        message: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let payload = serde_json::json!({ "code": code, "message": message });
        Self::new(
            FrameKind::Error,
            sender,
            Some(destination),
            serde_json::to_vec(&payload).unwrap_or_default(),
            CONTROL_TTL,
            now,
        )
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn sender(&self) -> u32 {
        self.sender
    }

    pub fn destination(&self) -> Option<u32> {
        self.destination
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn hop_count(&self) -> u32 {
        self.hop_count
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Attaches a metadata entry. Metadata rides in the header area of the
    /// wire encoding and is not covered by the integrity tag.
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// The relay builder: a copy of this frame with one more hop on the
    /// counter, or `None` once the hop budget is exhausted.
    pub fn with_incremented_hop(&self) -> Option<Frame> {
        if self.hop_count + 1 >= self.ttl {
            return None;
        }
        let mut next = self.clone();
        next.hop_count += 1;
        Some(next)
    }

    /// Recomputes the integrity tag and compares it against the stored one.
    pub fn verify_crc(&self) -> bool {
        self.crc == compute_crc(self.kind, self.sender, self.destination, &self.payload)
    }

    /// Packs the frame for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let metadata = if self.metadata.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.metadata).unwrap_or_default()
        };

        let mut out = Vec::with_capacity(WIRE_HEADER_LEN + metadata.len() + self.payload.len());
        let mut kind_field = [0u8; WIRE_TYPE_LEN];
        let kind_bytes = self.kind.as_str().as_bytes();
        kind_field[..kind_bytes.len()].copy_from_slice(kind_bytes);
        out.extend_from_slice(&kind_field);
        out.extend_from_slice(&(self.sender as i32).to_be_bytes());
        out.extend_from_slice(&self.destination.map_or(-1i32, |d| d as i32).to_be_bytes());
        out.extend_from_slice(&(self.ttl as i32).to_be_bytes());
        out.extend_from_slice(&(self.hop_count as i32).to_be_bytes());
        out.extend_from_slice(&(self.timestamp.timestamp() as i32).to_be_bytes());
        out.extend_from_slice(&(metadata.len() as i32).to_be_bytes());
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&metadata);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Unpacks a frame, recomputing its integrity tag.
    pub fn decode(data: &[u8]) -> Result<Frame, WireError> {
        if data.len() < WIRE_HEADER_LEN {
            return Err(WireError::Truncated {
                expected: WIRE_HEADER_LEN,
                got: data.len(),
            });
        }

        let type_field = &data[..WIRE_TYPE_LEN];
        let type_str = std::str::from_utf8(type_field)
            .map_err(|_| WireError::BadType)?
            .trim_end_matches('\0');
        let kind = FrameKind::from_wire(type_str)
            .ok_or_else(|| WireError::UnknownKind(type_str.to_string()))?;

        // Six packed ints follow the type field; the last 8 header bytes are
        // reserved.
        let mut ints = [0i32; 6];
        for (i, chunk) in data[WIRE_TYPE_LEN..WIRE_TYPE_LEN + 24]
            .chunks_exact(4)
            .enumerate()
        {
            ints[i] = i32::from_be_bytes(chunk.try_into().expect("chunked to 4 bytes"));
        }
        let [sender, dest, ttl, hop_count, timestamp, meta_len] = ints;

        let destination = (dest != -1).then_some(dest as u32);
        let timestamp = Utc
            .timestamp_opt(timestamp as i64, 0)
            .single()
            .ok_or(WireError::BadTimestamp(timestamp as i64))?;

        let meta_len = meta_len as usize;
        if WIRE_HEADER_LEN + meta_len > data.len() {
            return Err(WireError::BadMetadataLength(meta_len));
        }
        let metadata = if meta_len > 0 {
            serde_json::from_slice(&data[WIRE_HEADER_LEN..WIRE_HEADER_LEN + meta_len])
                .map_err(WireError::BadMetadata)?
        } else {
            Map::new()
        };

        let payload = data[WIRE_HEADER_LEN + meta_len..].to_vec();
        let crc = compute_crc(kind, sender as u32, destination, &payload);

        Ok(Frame {
            kind,
            sender: sender as u32,
            destination,
            payload,
            ttl: ttl as u32,
            hop_count: hop_count as u32,
            timestamp,
            metadata,
            crc,
        })
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Frame(type={}, sender={}, dest={:?}, hops={}/{}, size={} bytes)",
            self.kind,
            self.sender,
            self.destination,
            self.hop_count,
            self.ttl,
            self.payload.len()
        )
    }
}

fn compute_crc(kind: FrameKind, sender: u32, destination: Option<u32>, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(sender.to_string().as_bytes());
    if let Some(dest) = destination {
        hasher.update(dest.to_string().as_bytes());
    }
    hasher.update(payload);
    hasher.finalize()
}

/// The `"x,y,epoch_seconds"` self-position record carried by BEACON, ACK and
/// SYN frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionRecord {
    pub position: Position,
    pub timestamp: DateTime<Utc>,
}

impl PositionRecord {
    pub fn new(position: Position, timestamp: DateTime<Utc>) -> Self {
        Self {
            position,
            timestamp,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let epoch = self.timestamp.timestamp_micros() as f64 / 1e6;
        format!("{},{},{}", self.position.x, self.position.y, epoch).into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| WireError::BadPositionRecord(String::from_utf8_lossy(data).into_owned()))?;
        let mut parts = text.split(',');
        let mut next_f64 = || -> Result<f64, WireError> {
            parts
                .next()
                .and_then(|p| p.trim().parse::<f64>().ok())
                .ok_or_else(|| WireError::BadPositionRecord(text.to_string()))
        };
        let x = next_f64()?;
        let y = next_f64()?;
        let epoch = next_f64()?;
        let timestamp = Utc
            .timestamp_micros((epoch * 1e6) as i64)
            .single()
            .ok_or(WireError::BadTimestamp(epoch as i64))?;
        Ok(Self {
            position: Position::new(x, y),
            timestamp,
        })
    }
}

/// RREQ control payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Node that initiated the discovery.
    pub source_id: u32,
    /// Node the route should lead to.
    pub target_id: u32,
    /// Hop cap for this request.
    pub max_hops: u32,
}

impl RouteRequest {
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("route request serializes")
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(data).map_err(WireError::BadControlPayload)
    }
}

/// RREP control payload. `source_id` names the discovered destination,
/// `target_id` the requester the reply travels back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteReply {
    pub source_id: u32,
    pub target_id: u32,
    pub hop_count: u32,
    pub metric: u32,
}

impl RouteReply {
    pub fn to_payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("route reply serializes")
    }

    pub fn parse(data: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(data).map_err(WireError::BadControlPayload)
    }
}
