//! # Intercom bridge
//!
//! Client side of the point-to-point intercom dialect: a TCP session
//! opened directly to one device, optionally passing through a
//! RING/ANSWER handshake before PCM audio flows both ways.
//!
//! No relay sits in the middle and no call table exists; the stream is
//! the session. Outbound audio goes through a small bounded queue that
//! drops the newest frame when full, trading completeness for latency.
//!
//! ```no_run
//! use intercom_bridge::{BridgeConfig, BridgeSession, StartState};
//!
//! # async fn example() -> intercom_bridge::Result<()> {
//! let addr = "192.168.1.40:6054".parse().unwrap();
//! let (mut session, mut events) = BridgeSession::connect(addr, BridgeConfig::default()).await?;
//! match session.start(false).await? {
//!     StartState::Streaming => { /* send_audio / read events */ }
//!     StartState::Ringing => { /* wait for BridgeEvent::Answered */ }
//! }
//! # let _ = events.recv();
//! session.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod session;

pub mod error;

pub use error::{BridgeError, Result};
pub use session::{BridgeConfig, BridgeEvent, BridgeSession, StartState};
