//! Broker state-change events.
//!
//! Collaborators (discovery, UI, metrics) observe the broker through a
//! channel of events instead of callbacks. Events are emitted while the
//! broker still holds its state lock, so a consumer sees `CallUp` before
//! any audio of that call can be relayed and `DeviceDown` before the
//! replacing `DeviceUp` of a re-registration.

/// A state change in the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A device completed registration.
    DeviceUp {
        /// Registered identifier.
        id: String,
    },
    /// A registered device disconnected or was evicted.
    DeviceDown {
        /// Identifier the device was registered under.
        id: String,
    },
    /// A call entered RINGING.
    CallUp {
        /// Allocated call id.
        call_id: u32,
        /// Caller identifier.
        caller: String,
        /// Callee identifier.
        callee: String,
    },
    /// A call was destroyed (answered or not).
    CallDown {
        /// Id of the destroyed call.
        call_id: u32,
    },
}
