//! Call records and the call state machine.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::device::Device;

/// Lifecycle state of a call.
///
/// ```text
///                 INVITE ok
///    (none) ─────────────────────► RINGING
///                                   │
///               ┌───────────────────┼────────────────────────┐
///               │ ANSWER            │ DECLINE/TIMEOUT        │ HANGUP / peer loss
///               ▼                   ▼                        ▼
///            IN_CALL            (destroyed)              (destroyed)
///               │
///               │ HANGUP / BYE / peer loss
///               ▼
///           (destroyed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallState {
    /// INVITE accepted, callee is being rung.
    Ringing,
    /// Callee answered; audio is relayed.
    InCall,
}

/// An active or pending call between two distinct devices.
pub(crate) struct Call {
    pub(crate) call_id: u32,
    pub(crate) caller: Arc<Device>,
    pub(crate) callee: Arc<Device>,
    pub(crate) state: CallState,
    /// Ring timeout; present only while `state == Ringing`.
    pub(crate) timeout: Option<JoinHandle<()>>,
}

impl Call {
    pub(crate) fn new(call_id: u32, caller: Arc<Device>, callee: Arc<Device>) -> Self {
        Self {
            call_id,
            caller,
            callee,
            state: CallState::Ringing,
            timeout: None,
        }
    }

    /// The other endpoint, if `device` is one of the two.
    pub(crate) fn peer_of(&self, device: &Device) -> Option<&Arc<Device>> {
        if self.caller.conn_id == device.conn_id {
            Some(&self.callee)
        } else if self.callee.conn_id == device.conn_id {
            Some(&self.caller)
        } else {
            None
        }
    }

    /// Whether `device` is the callee of this call.
    pub(crate) fn is_callee(&self, device: &Device) -> bool {
        self.callee.conn_id == device.conn_id
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("call_id", &self.call_id)
            .field("caller", &self.caller.label())
            .field("callee", &self.callee.label())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
