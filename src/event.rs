//! Server events and sinks
//!
//!  Everything the server reports goes through an [`EventSink`]. Each event
//!  is published on its own channel and mirrored to the log channel.

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::ServerSettings;
use crate::decoder::Reading;
use crate::error::DecodeError;

const BROADCAST_CAPACITY: usize = 1024;

/// Identity of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionInfo {
    /// Address the server is listening on
    pub local: SocketAddr,
    /// Device side of the connection
    pub remote: SocketAddr,
}

impl ConnectionInfo {
    pub fn local_address(&self) -> std::net::IpAddr {
        self.local.ip()
    }

    pub fn local_port(&self) -> u16 {
        self.local.port()
    }

    pub fn remote_address(&self) -> std::net::IpAddr {
        self.remote.ip()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote, self.local)
    }
}

/// A frame that could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeFailure {
    pub reason: String,
    pub input: String,
    pub error: DecodeError,
    pub connection: ConnectionInfo,
}

/// Where an error happened
#[derive(Debug, Clone)]
pub enum ErrorContext {
    /// Listen socket, with the settings it was started with
    Server(ServerSettings),
    /// One connection
    Connection {
        connection: ConnectionInfo,
        settings: ServerSettings,
    },
    /// A task panicked
    Fault,
}

/// Payload of the `error` event
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub message: String,
    /// Underlying cause
    pub reason: String,
    pub context: ErrorContext,
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message, self.reason)
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Listening(SocketAddr),
    Connection(ConnectionInfo),
    /// Trimmed text of a non-empty frame
    Data {
        data: String,
        connection: ConnectionInfo,
    },
    Track {
        reading: Box<Reading>,
        connection: ConnectionInfo,
    },
    Fail(DecodeFailure),
    Timeout(ConnectionInfo),
    Disconnect {
        connection: ConnectionInfo,
        had_error: bool,
    },
    Error(ErrorEvent),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Listening(_) => "listening",
            Event::Connection(_) => "connection",
            Event::Data { .. } => "data",
            Event::Track { .. } => "track",
            Event::Fail(_) => "fail",
            Event::Timeout(_) => "timeout",
            Event::Disconnect { .. } => "disconnect",
            Event::Error(_) => "error",
        }
    }

    /// Connection the event belongs to, if any
    pub fn connection(&self) -> Option<&ConnectionInfo> {
        match self {
            Event::Connection(c) | Event::Timeout(c) => Some(c),
            Event::Data { connection, .. }
            | Event::Track { connection, .. }
            | Event::Disconnect { connection, .. } => Some(connection),
            Event::Fail(failure) => Some(&failure.connection),
            Event::Error(ErrorEvent {
                context: ErrorContext::Connection { connection, .. },
                ..
            }) => Some(connection),
            Event::Listening(_) | Event::Error(_) => None,
        }
    }
}

/// Copy of an event on the log channel
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub name: &'static str,
    pub event: Event,
}

/// Receives server events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);

    /// Log channel, the default drops the record.
    fn log(&self, _record: LogRecord) {}
}

/// Publish an event and mirror it to the log channel.
pub fn emit(sink: &dyn EventSink, event: Event) {
    let name = event.name();
    debug!(event = name, connection = ?event.connection(), "emit");
    sink.publish(event.clone());
    sink.log(LogRecord { name, event });
}

/// Broadcast sink with any number of subscribers.
#[derive(Clone)]
pub struct EventHub {
    events: broadcast::Sender<Event>,
    log: broadcast::Sender<LogRecord>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (log, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { events, log }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn subscribe_log(&self) -> broadcast::Receiver<LogRecord> {
        self.log.subscribe()
    }
}

impl EventSink for EventHub {
    fn publish(&self, event: Event) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn log(&self, record: LogRecord) {
        let _ = self.log.send(record);
    }
}

/// Plain channel sink for synchronous consumers.
impl EventSink for crossbeam_channel::Sender<Event> {
    fn publish(&self, event: Event) {
        let _ = self.send(event);
    }
}
