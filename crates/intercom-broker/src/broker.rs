//! The broker service: accept loop, device registry, call manager and
//! relay dispatch.
//!
//! Every handler takes the single state lock, mutates the device/call
//! tables and queues its control writes before releasing it, which keeps
//! the state-machine invariants atomic with respect to every other
//! connection, exactly like the single-threaded event loop this design is
//! modelled on. Queueing a control frame never blocks: the per-connection
//! writer task absorbs slow sockets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use intercom_proto::broker::{
    decode_id, BrokerErrorCode, BrokerHeader, BrokerMessageType, DeclineReason,
    AUDIO_QUEUE_FRAMES, CALL_TIMEOUT_SECS, FLUSH_EVERY_FRAMES, PING_INTERVAL_SECS,
    PING_TIMEOUT_SECS,
};
use intercom_proto::roster::{encode_roster, Contact};
use intercom_proto::BROKER_PORT;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::call::{Call, CallState};
use crate::conn;
use crate::device::Device;
use crate::event::Event;
use crate::queue::AudioFrame;
use crate::{BrokerError, Result};

/// Tunable parameters of the broker service.
///
/// Defaults match the wire-protocol constants; tests compress the timings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to listen on. Use port 0 for an OS-assigned port.
    pub bind_addr: SocketAddr,
    /// How long a call may ring before it times out.
    pub call_timeout: Duration,
    /// Keepalive PING cadence per connection.
    pub ping_interval: Duration,
    /// A peer silent for longer than this is force-disconnected.
    pub idle_timeout: Duration,
    /// Capacity of each device's audio queue, in frames.
    pub audio_queue_frames: usize,
    /// The writer task flushes audio at least every this many frames.
    pub flush_every_frames: u32,
    /// Soft deadline for audio flushes; overruns are tolerated.
    pub flush_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], BROKER_PORT)),
            call_timeout: Duration::from_secs(CALL_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(PING_TIMEOUT_SECS),
            audio_queue_frames: AUDIO_QUEUE_FRAMES,
            flush_every_frames: FLUSH_EVERY_FRAMES,
            flush_timeout: Duration::from_millis(50),
        }
    }
}

/// Who gets a BYE when a call is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EndNotify {
    /// Nobody; the caller was already told by other means (DECLINE).
    None,
    /// The party that did not initiate the teardown.
    PeerOf(u64),
    /// Both endpoints (timeout, disconnect, shutdown).
    Both,
}

/// Mutable broker state. Everything in here, plus each device's
/// `current_call_id`, is guarded by the one lock in [`Inner`].
#[derive(Default)]
pub(crate) struct State {
    pub(crate) devices: HashMap<String, Arc<Device>>,
    pub(crate) calls: HashMap<u32, Call>,
    next_call_id: u32,
}

impl State {
    fn alloc_call_id(&mut self) -> u32 {
        self.next_call_id += 1;
        self.next_call_id
    }
}

pub(crate) struct Inner {
    pub(crate) config: BrokerConfig,
    state: Mutex<State>,
    events: Option<UnboundedSender<Event>>,
    next_conn_id: AtomicU64,
    local_addr: StdMutex<Option<SocketAddr>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    conn_tasks: StdMutex<HashMap<u64, JoinHandle<()>>>,
    /// Self-handle for spawning the ring-timeout tasks.
    weak: Weak<Inner>,
}

/// The intercom relay service.
///
/// Owns the device table, the call table and all per-connection tasks.
/// Cloning is cheap; clones share the same service.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    /// Create a broker with no event consumer.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a broker that reports state changes on `events`.
    #[must_use]
    pub fn with_events(config: BrokerConfig, events: UnboundedSender<Event>) -> Self {
        Self::build(config, Some(events))
    }

    fn build(config: BrokerConfig, events: Option<UnboundedSender<Event>>) -> Self {
        Self {
            inner: Arc::new_cyclic(|weak| Inner {
                config,
                state: Mutex::new(State::default()),
                events,
                next_conn_id: AtomicU64::new(0),
                local_addr: StdMutex::new(None),
                accept_task: StdMutex::new(None),
                conn_tasks: StdMutex::new(HashMap::new()),
                weak: weak.clone(),
            }),
        }
    }

    /// Bind the listener and start accepting device connections.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Bind` if the listener cannot be created and
    /// `BrokerError::AlreadyStarted` on a second call.
    pub async fn start(&self) -> Result<()> {
        if self.inner.accept_task.lock().unwrap().is_some() {
            return Err(BrokerError::AlreadyStarted);
        }
        let listener = TcpListener::bind(self.inner.config.bind_addr)
            .await
            .map_err(BrokerError::Bind)?;
        let addr = listener.local_addr().map_err(BrokerError::Bind)?;
        *self.inner.local_addr.lock().unwrap() = Some(addr);
        info!(%addr, "intercom broker listening");

        let inner = self.inner.clone();
        let handle = tokio::spawn(accept_loop(inner, listener));
        *self.inner.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Address the broker is listening on, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    /// Stop the service: destroy active calls with peer-notify, disconnect
    /// every device, then stop accepting.
    pub async fn stop(&self) {
        info!("stopping intercom broker");

        {
            let mut state = self.inner.state.lock().await;
            let call_ids: Vec<u32> = state.calls.keys().copied().collect();
            for call_id in call_ids {
                self.inner
                    .end_call_locked(&mut state, call_id, EndNotify::Both, false);
            }
        }

        let devices: Vec<Arc<Device>> = {
            let state = self.inner.state.lock().await;
            state.devices.values().cloned().collect()
        };
        for device in devices {
            self.inner.disconnect_device(&device).await;
        }

        let accept = self.inner.accept_task.lock().unwrap().take();
        if let Some(handle) = accept {
            handle.abort();
            let _ = handle.await;
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut conn_tasks = self.inner.conn_tasks.lock().unwrap();
            conn_tasks.drain().map(|(_, t)| t).collect()
        };
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        info!("intercom broker stopped");
    }

    /// Identifiers of currently registered devices, sorted.
    pub async fn connected_devices(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<String> = state.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether `id` is registered and currently in a call.
    pub async fn is_device_in_call(&self, id: &str) -> bool {
        let state = self.inner.state.lock().await;
        state.devices.get(id).is_some_and(|d| d.busy())
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(%addr, conn_id, "accepted connection");
                let task = tokio::spawn(conn::run(inner.clone(), stream, addr, conn_id));
                inner.conn_tasks.lock().unwrap().insert(conn_id, task);
            }
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

impl Inner {
    fn emit(&self, event: Event) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn forget_conn(&self, conn_id: u64) {
        self.conn_tasks.lock().unwrap().remove(&conn_id);
    }

    /// Queue a control frame; a dead writer means the connection is gone.
    pub(crate) fn send_or_close(&self, device: &Arc<Device>, header: BrokerHeader, payload: Bytes) {
        if !device.queue_control(header, payload) {
            debug!(peer = %device.label(), "writer gone, closing connection");
            device.close();
        }
    }

    fn send_error(&self, device: &Arc<Device>, call_id: u32, code: BrokerErrorCode) {
        let mut header = BrokerHeader::control(BrokerMessageType::Error, call_id);
        header.length = 1;
        self.send_or_close(device, header, Bytes::copy_from_slice(&[code as u8]));
    }

    // =====================================================================
    // Registry (C2)
    // =====================================================================

    pub(crate) async fn handle_register(&self, device: &Arc<Device>, payload: &[u8]) {
        let Some(id) = decode_id(payload) else {
            warn!(peer = %device.label(), "REGISTER id is not UTF-8, closing");
            device.close();
            return;
        };
        if id.is_empty() {
            warn!(peer = %device.label(), "empty device id in REGISTER");
            return;
        }
        let id = id.to_owned();

        let mut state = self.state.lock().await;

        if let Some(existing) = device.id() {
            // The identifier is assigned exactly once per connection.
            warn!(
                peer = %device.peer_addr,
                attempted = %id,
                existing,
                "repeat REGISTER ignored"
            );
            return;
        }

        if let Some(old) = state.devices.get(&id).cloned() {
            warn!(%id, "device re-registering, evicting previous connection");
            let old_call = old.current_call();
            if old_call != 0 {
                self.end_call_locked(&mut state, old_call, EndNotify::Both, false);
            }
            self.unregister_locked(&mut state, &old);
            old.close();
        }

        device.set_id(id.clone());
        state.devices.insert(id.clone(), device.clone());
        info!(%id, "device registered");

        self.send_contacts_locked(&state, device);
        self.broadcast_roster_locked(&state);
        self.emit(Event::DeviceUp { id });
    }

    /// Remove `device` from the registry if it is still the incumbent for
    /// its id. Idempotent.
    fn unregister_locked(&self, state: &mut State, device: &Arc<Device>) {
        let Some(id) = device.id() else { return };
        let incumbent = state
            .devices
            .get(id)
            .is_some_and(|d| d.conn_id == device.conn_id);
        if !incumbent {
            return;
        }
        let id = id.to_owned();
        state.devices.remove(&id);
        info!(%id, "device unregistered");
        self.broadcast_roster_locked(state);
        self.emit(Event::DeviceDown { id });
    }

    /// Full disconnect path: end any active call with peer-notify, drop
    /// the registry entry, close the connection. Safe to call twice.
    pub(crate) async fn disconnect_device(&self, device: &Arc<Device>) {
        {
            let mut state = self.state.lock().await;
            let call_id = device.current_call();
            if call_id != 0 {
                self.end_call_locked(&mut state, call_id, EndNotify::Both, false);
            }
            self.unregister_locked(&mut state, device);
        }
        device.close();
    }

    /// Roster as seen by `recipient`: every registered device except the
    /// recipient itself, sorted by id so identical registries encode to
    /// identical payloads.
    fn roster_for(state: &State, recipient: &Device) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = state
            .devices
            .iter()
            .filter(|(_, d)| d.conn_id != recipient.conn_id)
            .map(|(id, d)| Contact::new(id, d.busy()))
            .collect();
        contacts.sort_by(|a, b| a.id.cmp(&b.id));
        contacts
    }

    fn send_contacts_locked(&self, state: &State, device: &Arc<Device>) {
        let payload = encode_roster(&Self::roster_for(state, device));
        let mut header = BrokerHeader::control(BrokerMessageType::Contacts, 0);
        header.length = payload.len() as u16;
        self.send_or_close(device, header, Bytes::from(payload));
    }

    fn broadcast_roster_locked(&self, state: &State) {
        for device in state.devices.values() {
            self.send_contacts_locked(state, device);
        }
    }

    // =====================================================================
    // Call manager (C3)
    // =====================================================================

    pub(crate) async fn handle_invite(&self, device: &Arc<Device>, payload: &[u8]) {
        let Some(target_id) = decode_id(payload) else {
            warn!(peer = %device.label(), "INVITE target is not UTF-8, closing");
            device.close();
            return;
        };

        let mut state = self.state.lock().await;

        let Some(caller_id) = device.id().map(str::to_owned) else {
            self.send_error(device, 0, BrokerErrorCode::Protocol);
            return;
        };
        if device.busy() {
            self.send_error(device, 0, BrokerErrorCode::Busy);
            return;
        }
        let Some(target) = state.devices.get(target_id).cloned() else {
            info!(caller = %caller_id, target = target_id, "INVITE target not found");
            self.send_error(device, 0, BrokerErrorCode::NotFound);
            return;
        };
        if target.conn_id == device.conn_id {
            // A call's endpoints must be distinct.
            warn!(caller = %caller_id, "INVITE addressed to self");
            self.send_error(device, 0, BrokerErrorCode::Protocol);
            return;
        }
        if target.busy() {
            info!(caller = %caller_id, target = target_id, "INVITE target busy");
            self.send_error(device, 0, BrokerErrorCode::Busy);
            return;
        }

        let call_id = state.alloc_call_id();
        let mut call = Call::new(call_id, device.clone(), target.clone());
        device.set_current_call(call_id);
        target.set_current_call(call_id);
        info!(call_id, caller = %caller_id, callee = target_id, "call ringing");

        let mut ring = BrokerHeader::control(BrokerMessageType::Ring, call_id);
        let mut ring_payload = caller_id.clone().into_bytes();
        ring_payload.push(0);
        ring.length = ring_payload.len() as u16;
        self.send_or_close(&target, ring, Bytes::from(ring_payload));

        // The weak self-handle always upgrades here: we are called through
        // a live Arc.
        if let Some(owner) = self.weak.upgrade() {
            call.timeout = Some(tokio::spawn(ring_timeout(
                owner,
                call_id,
                self.config.call_timeout,
            )));
        }
        let callee_id = target_id.to_owned();
        state.calls.insert(call_id, call);

        self.emit(Event::CallUp {
            call_id,
            caller: caller_id,
            callee: callee_id,
        });
    }

    pub(crate) async fn handle_answer(&self, device: &Arc<Device>, call_id: u32) {
        let mut state = self.state.lock().await;
        let Some(call) = state.calls.get_mut(&call_id) else {
            warn!(peer = %device.label(), call_id, "ANSWER for unknown call");
            return;
        };
        if !call.is_callee(device) {
            warn!(peer = %device.label(), call_id, "ANSWER from non-callee");
            return;
        }

        if let Some(timeout) = call.timeout.take() {
            timeout.abort();
        }
        call.state = CallState::InCall;
        let caller = call.caller.clone();
        info!(
            call_id,
            caller = %caller.label(),
            callee = %device.label(),
            "call answered"
        );

        self.send_or_close(
            &caller,
            BrokerHeader::control(BrokerMessageType::Answer, call_id),
            Bytes::new(),
        );
    }

    pub(crate) async fn handle_decline(&self, device: &Arc<Device>, call_id: u32, payload: &[u8]) {
        let mut state = self.state.lock().await;
        let Some(call) = state.calls.get(&call_id) else {
            return;
        };
        if !call.is_callee(device) {
            return;
        }

        let reason = DeclineReason::from_payload(payload);
        info!(call_id, callee = %device.label(), ?reason, "call declined");

        let caller = call.caller.clone();
        let mut header = BrokerHeader::control(BrokerMessageType::Decline, call_id);
        header.length = 1;
        self.send_or_close(&caller, header, Bytes::copy_from_slice(&[reason as u8]));

        self.end_call_locked(&mut state, call_id, EndNotify::None, false);
    }

    pub(crate) async fn handle_hangup(&self, device: &Arc<Device>, call_id: u32) {
        let mut state = self.state.lock().await;
        let Some(call) = state.calls.get(&call_id) else {
            return;
        };
        if call.peer_of(device).is_none() {
            warn!(peer = %device.label(), call_id, "HANGUP from non-participant");
            return;
        }

        info!(call_id, peer = %device.label(), "hangup");
        self.end_call_locked(&mut state, call_id, EndNotify::PeerOf(device.conn_id), false);
    }

    /// Destroy a call: cancel its timeout, clear both endpoints' call ids
    /// (only if still pointing at this call), send BYEs per `notify`.
    pub(crate) fn end_call_locked(
        &self,
        state: &mut State,
        call_id: u32,
        notify: EndNotify,
        from_timeout: bool,
    ) {
        let Some(mut call) = state.calls.remove(&call_id) else {
            return;
        };

        if let Some(timeout) = call.timeout.take() {
            // The timeout task reaches here through its own invocation;
            // aborting it from inside itself would cut the teardown short.
            if !from_timeout {
                timeout.abort();
            }
        }

        if call.caller.current_call() == call_id {
            call.caller.set_current_call(0);
        }
        if call.callee.current_call() == call_id {
            call.callee.set_current_call(0);
        }

        let bye = BrokerHeader::control(BrokerMessageType::Bye, call_id);
        match notify {
            EndNotify::None => {}
            EndNotify::PeerOf(conn_id) => {
                let peer = if call.caller.conn_id == conn_id {
                    &call.callee
                } else {
                    &call.caller
                };
                self.send_or_close(peer, bye, Bytes::new());
            }
            EndNotify::Both => {
                self.send_or_close(&call.caller, bye, Bytes::new());
                self.send_or_close(&call.callee, bye, Bytes::new());
            }
        }

        info!(call_id, "call ended");
        self.emit(Event::CallDown { call_id });
    }

    // =====================================================================
    // Relay fabric (C4)
    // =====================================================================

    pub(crate) async fn handle_audio(
        &self,
        device: &Arc<Device>,
        call_id: u32,
        seq: u32,
        payload: Bytes,
    ) {
        let state = self.state.lock().await;
        let Some(call) = state.calls.get(&call_id) else {
            return;
        };
        if call.state != CallState::InCall {
            return;
        }
        let Some(peer) = call.peer_of(device) else {
            return;
        };

        if let Some(dropped) = peer.push_audio(AudioFrame { seq, payload }) {
            trace!(
                peer = %peer.label(),
                call_id,
                dropped_seq = dropped.seq,
                "receiver lagging, dropped oldest frame"
            );
        }
    }
}

/// Fires when a RINGING call was not answered in time: ERROR(TIMEOUT) to
/// the caller, BYE to both, call destroyed.
async fn ring_timeout(inner: Arc<Inner>, call_id: u32, after: Duration) {
    tokio::time::sleep(after).await;

    let mut state = inner.state.lock().await;
    let still_ringing = state
        .calls
        .get(&call_id)
        .is_some_and(|c| c.state == CallState::Ringing);
    if !still_ringing {
        return;
    }

    info!(call_id, "ring timeout, no answer");
    let caller = state.calls[&call_id].caller.clone();
    inner.send_error(&caller, call_id, BrokerErrorCode::Timeout);
    inner.end_call_locked(&mut state, call_id, EndNotify::Both, true);
}
