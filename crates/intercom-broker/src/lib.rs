//! # Intercom broker
//!
//! The relay service at the centre of the intercom: devices connect
//! outbound over TCP, register under stable identifiers, and the broker
//! routes call signalling and PCM audio between the two endpoints of each
//! active call.
//!
//! Responsibilities:
//! - framed transport: one reader task and one audio TX pump per connection
//! - device registry: single registration per id, roster fan-out
//! - call manager: INVITE -> RING -> ANSWER/DECLINE/TIMEOUT -> IN_CALL ->
//!   HANGUP/BYE, with a 30 s ring timeout
//! - relay fabric: bounded per-device audio queues with drop-oldest
//!   backpressure
//!
//! All shared state (device table, call table, per-device current call id)
//! lives behind a single mutex owned by the [`Broker`] value; there is no
//! process-global state. State changes are observable through a channel of
//! [`Event`] values.
//!
//! ```no_run
//! use intercom_broker::{Broker, BrokerConfig};
//!
//! # async fn example() -> intercom_broker::Result<()> {
//! let broker = Broker::new(BrokerConfig::default());
//! broker.start().await?;
//! // ... serve until shutdown ...
//! broker.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod broker;
mod call;
mod conn;
mod device;
mod queue;

pub mod error;
pub mod event;

pub use broker::{Broker, BrokerConfig};
pub use error::{BrokerError, Result};
pub use event::Event;
pub use queue::{AudioFrame, AudioQueue};
