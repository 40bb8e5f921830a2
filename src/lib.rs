//! h02: TK102/H02 GPS tracker server
//!
//! Decodes location reports sent by H02-compatible trackers over TCP and
//! reports them, together with connection lifecycle events, to an
//! [`EventSink`].
//!
//! ```no_run
//! use h02::{Event, EventHub, SettingsOverrides, create_server};
//!
//! # async fn run() -> Result<(), h02::ServerError> {
//! let hub = EventHub::new();
//! let mut events = hub.subscribe();
//! let overrides = SettingsOverrides {
//!     bind_port: Some(5001),
//!     ..Default::default()
//! };
//! let server = create_server(&overrides, hub).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let Event::Track { reading, .. } = event {
//!         println!("{}", reading);
//!     }
//! }
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod bitmask;
pub mod checksum;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod event;
pub mod geo;
pub mod server;

pub use bitmask::{BitMaskTable, decode_bit_masks};
pub use checksum::verify_checksum;
pub use config::{ServerSettings, SettingsOverrides};
pub use decoder::{Decoder, Fix, MessageSpec, Reading, V1Report, parse};
pub use error::{DecodeError, ServerError};
pub use event::{
    ConnectionInfo, DecodeFailure, ErrorContext, ErrorEvent, Event, EventHub, EventSink, LogRecord,
};
pub use geo::fix_geo;
pub use server::{Server, create_server};
