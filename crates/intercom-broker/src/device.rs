//! Per-connection device handle.
//!
//! One `Device` exists per accepted TCP connection. The identifier is
//! assigned exactly once by REGISTER; until then the device is anonymous
//! and can do nothing but register or ping.
//!
//! All outbound traffic funnels into the connection's single writer task:
//! control frames through an unbounded FIFO channel (they must never be
//! dropped and never block a handler), audio through the bounded
//! drop-oldest queue plus a wake signal. The writer task is the only thing
//! that touches the socket's write half, so frames never interleave.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use intercom_proto::broker::BrokerHeader;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

use crate::queue::{AudioFrame, AudioQueue};

/// A control frame queued for the writer task.
#[derive(Debug)]
pub(crate) struct ControlFrame {
    pub(crate) header: BrokerHeader,
    pub(crate) payload: Bytes,
}

/// Live state of one device connection.
pub(crate) struct Device {
    /// Process-unique connection id; distinguishes an evicted connection
    /// from its replacement registered under the same identifier.
    pub(crate) conn_id: u64,
    /// Remote socket address, used for logs until an id is registered.
    pub(crate) peer_addr: SocketAddr,
    id: OnceLock<String>,
    /// Call this device participates in; 0 = idle. Mutated only while the
    /// broker state lock is held.
    current_call: AtomicU32,
    queue: StdMutex<AudioQueue>,
    wake: Notify,
    control_tx: UnboundedSender<ControlFrame>,
    closed: AtomicBool,
    close_signal: Notify,
    last_heartbeat: StdMutex<Instant>,
}

impl Device {
    /// Create the handle plus the control-frame receiver for the writer
    /// task.
    pub(crate) fn new(
        conn_id: u64,
        peer_addr: SocketAddr,
        queue_capacity: usize,
    ) -> (Self, UnboundedReceiver<ControlFrame>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let device = Self {
            conn_id,
            peer_addr,
            id: OnceLock::new(),
            current_call: AtomicU32::new(0),
            queue: StdMutex::new(AudioQueue::new(queue_capacity)),
            wake: Notify::new(),
            control_tx,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            last_heartbeat: StdMutex::new(Instant::now()),
        };
        (device, control_rx)
    }

    /// Registered identifier, if REGISTER has been processed.
    pub(crate) fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    /// Assign the identifier. Returns false if one was already assigned.
    pub(crate) fn set_id(&self, id: String) -> bool {
        self.id.set(id).is_ok()
    }

    /// Identifier if registered, otherwise the peer address. For logs.
    pub(crate) fn label(&self) -> String {
        self.id()
            .map_or_else(|| self.peer_addr.to_string(), str::to_owned)
    }

    pub(crate) fn current_call(&self) -> u32 {
        self.current_call.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_call(&self, call_id: u32) {
        self.current_call.store(call_id, Ordering::Release);
    }

    pub(crate) fn busy(&self) -> bool {
        self.current_call() != 0
    }

    /// Record inbound traffic as proof of liveness.
    pub(crate) fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    pub(crate) fn heartbeat_age(&self) -> Duration {
        self.last_heartbeat.lock().unwrap().elapsed()
    }

    /// Hand a control frame to the writer task. Returns false when the
    /// writer is gone, i.e. the connection is already dead.
    pub(crate) fn queue_control(&self, header: BrokerHeader, payload: Bytes) -> bool {
        self.control_tx
            .send(ControlFrame { header, payload })
            .is_ok()
    }

    /// Enqueue a frame for the writer task and wake it. Returns the frame
    /// discarded by the drop-oldest policy, if any.
    pub(crate) fn push_audio(&self, frame: AudioFrame) -> Option<AudioFrame> {
        let evicted = self.queue.lock().unwrap().push(frame);
        self.wake.notify_one();
        evicted
    }

    pub(crate) fn pop_audio(&self) -> Option<AudioFrame> {
        self.queue.lock().unwrap().pop()
    }

    /// Wait until a producer enqueues audio.
    pub(crate) async fn audio_wakeup(&self) {
        self.wake.notified().await;
    }

    /// Ask every task of this connection to wind down.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_signal.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once [`close`](Self::close) has been called.
    pub(crate) async fn wait_closed(&self) {
        let notified = self.close_signal.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent close() cannot
        // slip between the check and the wait.
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("conn_id", &self.conn_id)
            .field("peer_addr", &self.peer_addr)
            .field("id", &self.id())
            .field("current_call", &self.current_call())
            .finish_non_exhaustive()
    }
}
