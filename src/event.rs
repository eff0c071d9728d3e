//! Per-request event records and the sinks they are delivered to.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const MESSAGE_ID: &str = "ldap.message-id";
pub const REQUEST_TYPE: &str = "ldap.request-type";
pub const VERSION: &str = "ldap.version";
pub const USERNAME: &str = "ldap.username";
pub const PASSWORD: &str = "ldap.password";
pub const BIND_RESULT: &str = "ldap.bind-result";
pub const BIND_SASL_MECHANISM: &str = "ldap.bind-sasl-mechanism";
pub const MALFORMED_PAYLOAD: &str = "ldap.malformed-payload";
pub const SEARCH_BASE_DN: &str = "ldap.search-base-dn";
pub const SEARCH_SCOPE: &str = "ldap.search-scope";
pub const SEARCH_FILTER_ATTR: &str = "ldap.search-filter-attr";
pub const SEARCH_FILTER_VALUE: &str = "ldap.search-filter-value";
pub const SEARCH_ATTRIBUTES: &str = "ldap.search-attributes";
pub const EXTENDED_OID: &str = "ldap.extended-oid";
pub const EXTENDED_OID_VALUE: &str = "ldap.extended-oid-value";
pub const RAW_MESSAGE: &str = "ldap.message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventValue {
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Bool(bool),
}

impl From<i64> for EventValue {
    fn from(v: i64) -> Self {
        EventValue::Int(v)
    }
}

impl From<&str> for EventValue {
    fn from(v: &str) -> Self {
        EventValue::Text(v.to_string())
    }
}

impl From<String> for EventValue {
    fn from(v: String) -> Self {
        EventValue::Text(v)
    }
}

impl From<Vec<u8>> for EventValue {
    fn from(v: Vec<u8>) -> Self {
        EventValue::Bytes(v)
    }
}

impl From<bool> for EventValue {
    fn from(v: bool) -> Self {
        EventValue::Bool(v)
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValue::Int(v) => write!(f, "{}", v),
            EventValue::Text(v) => f.write_str(v),
            EventValue::Bytes(v) => f.write_str(&hex(v)),
            EventValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for EventValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EventValue::Int(v) => serializer.serialize_i64(*v),
            EventValue::Text(v) => serializer.serialize_str(v),
            EventValue::Bytes(v) => serializer.serialize_str(&hex(v)),
            EventValue::Bool(v) => serializer.serialize_bool(*v),
        }
    }
}

/// Insertion-ordered key/value record of one request.
///
/// Re-inserting a key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    entries: Vec<(String, EventValue)>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<EventValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&EventValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EventValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Request-type label, if a handler set one.
    pub fn request_type(&self) -> Option<String> {
        self.get(REQUEST_TYPE).map(|v| v.to_string())
    }
}

impl Serialize for EventLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// A completed request, ready for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp_ms: u64,
    pub source: SocketAddr,
    pub destination: Option<SocketAddr>,
    pub message_id: Option<i64>,
    pub request_type: String,
    pub fields: EventLog,
}

impl Event {
    pub fn new(source: SocketAddr, destination: Option<SocketAddr>, fields: EventLog) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let message_id = match fields.get(MESSAGE_ID) {
            Some(EventValue::Int(id)) => Some(*id),
            _ => None,
        };
        let request_type = fields.request_type().unwrap_or_else(|| "unknown".to_string());
        Self {
            timestamp_ms,
            source,
            destination,
            message_id,
            request_type,
            fields,
        }
    }
}

/// Destination for finished events. Delivery must not block the connection task for long.
pub trait EventSink: Send + Sync {
    fn send(&self, event: Event);
}

/// Emits each event as a structured `tracing` record.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn send(&self, event: Event) {
        let fields = serde_json::to_string(&event.fields).unwrap_or_default();
        info!(
            target: "ldap_honeypot::event",
            source = %event.source,
            message_id = ?event.message_id,
            request_type = %event.request_type,
            fields = %fields,
            "LDAP request"
        );
    }
}

/// Appends events as JSON lines to a file. Connection tasks only enqueue; a single
/// writer task does the file I/O.
pub struct JsonFileSink {
    queue: ChannelSink,
}

impl JsonFileSink {
    /// Open `path` for appending and spawn the writer. The returned task finishes,
    /// with everything flushed, once the sink is dropped.
    pub async fn open(path: &Path) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        let (queue, rx) = ChannelSink::new();
        let writer = tokio::spawn(write_json_lines(file, rx));
        Ok((Self { queue }, writer))
    }
}

impl EventSink for JsonFileSink {
    fn send(&self, event: Event) {
        self.queue.send(event);
    }
}

async fn write_json_lines<W>(out: W, mut rx: mpsc::UnboundedReceiver<Event>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(out);
    while let Some(event) = rx.recv().await {
        let mut next = Some(event);
        // Drain whatever is queued, then flush once
        while let Some(event) = next {
            match serde_json::to_vec(&event) {
                Ok(mut line) => {
                    line.push(b'\n');
                    if let Err(e) = writer.write_all(&line).await {
                        warn!("Failed to write event: {}", e);
                        return;
                    }
                }
                Err(e) => warn!("Failed to serialize event: {}", e),
            }
            next = rx.try_recv().ok();
        }
        if let Err(e) = writer.flush().await {
            warn!("Failed to flush events: {}", e);
            return;
        }
    }
}

/// Forwards events into an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: Event) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}
