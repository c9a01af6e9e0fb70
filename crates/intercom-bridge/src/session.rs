//! Point-to-point session lifecycle.
//!
//! A session is three tasks around one TCP stream: the caller's own
//! context (connect, the START handshake, stop), a reader task that turns
//! inbound frames into [`BridgeEvent`]s, and a writer task that owns the
//! write half (control frames from an unbounded FIFO, audio from a
//! bounded drop-newest queue). A keepalive task pings the device and
//! tears the session down when it goes silent.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use intercom_proto::bridge::{
    BridgeErrorCode, BridgeHeader, BridgeMessageType, BRIDGE_HEADER_LEN, CONNECT_TIMEOUT_SECS,
    FLAG_NO_RING, PING_INTERVAL_SECS, PING_TIMEOUT_SECS, TX_QUEUE_FRAMES,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{BridgeError, Result};

/// Tunable parameters of a bridge session.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// TCP connect deadline.
    pub connect_timeout: Duration,
    /// Deadline for the device's reply to START.
    pub start_timeout: Duration,
    /// Keepalive PING cadence.
    pub ping_interval: Duration,
    /// A device silent for longer than this ends the session.
    pub ping_timeout: Duration,
    /// Outbound audio queue depth, frames.
    pub tx_queue_frames: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            start_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            ping_timeout: Duration::from_secs(PING_TIMEOUT_SECS),
            tx_queue_frames: TX_QUEUE_FRAMES,
        }
    }
}

/// Outcome of the START handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    /// The device accepted; audio may flow immediately.
    Streaming,
    /// The device is ringing locally; wait for [`BridgeEvent::Answered`].
    Ringing,
}

/// Something the device told us, delivered in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The device is ringing, awaiting a local answer.
    Ringing,
    /// The local user answered; streaming is live.
    Answered,
    /// One PCM audio frame from the device.
    Audio(Bytes),
    /// The device reported an error.
    Error(BridgeErrorCode),
    /// The session is over (remote stop, silence, or socket loss).
    Disconnected,
}

struct Shared {
    config: BridgeConfig,
    events: UnboundedSender<BridgeEvent>,
    control_tx: UnboundedSender<(BridgeHeader, Bytes)>,
    streaming: AtomicBool,
    closed: AtomicBool,
    close_signal: Notify,
    last_rx: StdMutex<Instant>,
}

impl Shared {
    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn queue_control(&self, header: BridgeHeader, payload: Bytes) {
        let _ = self.control_tx.send((header, payload));
    }

    fn touch_rx(&self) {
        *self.last_rx.lock().unwrap() = Instant::now();
    }

    fn rx_age(&self) -> Duration {
        self.last_rx.lock().unwrap().elapsed()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_signal.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn wait_closed(&self) {
        let notified = self.close_signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// A live point-to-point session with one device.
pub struct BridgeSession {
    shared: Arc<Shared>,
    peer: SocketAddr,
    audio_tx: Sender<Bytes>,
    /// Read half, parked here between connect and start.
    reader: Option<OwnedReadHalf>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeSession {
    /// Open a TCP session to a device.
    ///
    /// Returns the session plus the event stream.
    ///
    /// # Errors
    ///
    /// `BridgeError::ConnectTimeout` if the device does not accept within
    /// the configured deadline, `BridgeError::Io` on socket failure.
    pub async fn connect(
        addr: SocketAddr,
        config: BridgeConfig,
    ) -> Result<(Self, UnboundedReceiver<BridgeEvent>)> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| BridgeError::ConnectTimeout)??;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%addr, %err, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::channel(config.tx_queue_frames.max(1));

        let shared = Arc::new(Shared {
            config,
            events: events_tx,
            control_tx,
            streaming: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            last_rx: StdMutex::new(Instant::now()),
        });

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(write_loop(
            shared.clone(),
            control_rx,
            audio_rx,
            write_half,
        )));
        tasks.push(tokio::spawn(keepalive(shared.clone())));

        info!(%addr, "bridge session connected");
        Ok((
            Self {
                shared,
                peer: addr,
                audio_tx,
                reader: Some(read_half),
                tasks,
            },
            events_rx,
        ))
    }

    /// Send START and wait for the device's verdict.
    ///
    /// With `no_ring`, asks the device to bypass its local ring UI and
    /// stream unconditionally; the device keeps the last word and may
    /// still reply RING.
    ///
    /// # Errors
    ///
    /// `BridgeError::Rejected` if the device answers with an error frame,
    /// `BridgeError::HandshakeTimeout` if it stays silent,
    /// `BridgeError::AlreadyStarted` on a second call.
    pub async fn start(&mut self, no_ring: bool) -> Result<StartState> {
        let Some(mut reader) = self.reader.take() else {
            return Err(BridgeError::AlreadyStarted);
        };

        let mut header = BridgeHeader::control(BridgeMessageType::Start);
        if no_ring {
            header.flags |= FLAG_NO_RING;
        }
        self.shared.queue_control(header, Bytes::new());

        let deadline = Instant::now() + self.shared.config.start_timeout;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = tokio::time::timeout(remaining, read_frame(&mut reader))
                .await
                .map_err(|_| BridgeError::HandshakeTimeout)??;
            let Some((header, payload)) = frame else {
                self.shared.close();
                self.shared.emit(BridgeEvent::Disconnected);
                return Err(BridgeError::Closed);
            };
            self.shared.touch_rx();

            match header.msg_type {
                BridgeMessageType::Answer => break StartState::Streaming,
                BridgeMessageType::Ring => {
                    self.shared.emit(BridgeEvent::Ringing);
                    break StartState::Ringing;
                }
                // A device configured to auto-answer may skip ANSWER and
                // stream straight away.
                BridgeMessageType::Audio => {
                    self.shared.emit(BridgeEvent::Audio(payload));
                    break StartState::Streaming;
                }
                BridgeMessageType::Error => {
                    let code = BridgeErrorCode::from(payload.first().copied().unwrap_or(0xFF));
                    self.shared.close();
                    return Err(BridgeError::Rejected(code));
                }
                BridgeMessageType::Ping => {
                    self.shared
                        .queue_control(BridgeHeader::control(BridgeMessageType::Pong), Bytes::new());
                }
                BridgeMessageType::Pong => {}
                other => {
                    debug!(msg_type = ?other, "unexpected frame during handshake");
                }
            }
        };

        if outcome == StartState::Streaming {
            self.shared.streaming.store(true, Ordering::Release);
        }
        self.tasks
            .push(tokio::spawn(read_loop(self.shared.clone(), reader)));
        info!(peer = %self.peer, ?outcome, "bridge session started");
        Ok(outcome)
    }

    /// Queue one PCM frame for the device.
    ///
    /// Returns false when the frame was dropped: the session is not
    /// streaming yet, or the TX queue is full (latency beats completeness).
    pub fn send_audio(&self, pcm: Bytes) -> bool {
        if !self.is_streaming() || self.shared.is_closed() {
            return false;
        }
        self.audio_tx.try_send(pcm).is_ok()
    }

    /// Whether audio is currently accepted for sending.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.shared.streaming.load(Ordering::Acquire)
    }

    /// Whether the session has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// End the session: STOP to the device, then close. Idempotent.
    pub async fn stop(&mut self) {
        if !self.shared.is_closed() {
            self.shared
                .queue_control(BridgeHeader::control(BridgeMessageType::Stop), Bytes::new());
            self.shared.streaming.store(false, Ordering::Release);
            self.shared.close();
            info!(peer = %self.peer, "bridge session stopped");
        }

        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                task.abort();
                let _ = task.await;
            }
        }
    }
}

/// Read one frame; `None` on clean EOF.
async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Option<(BridgeHeader, Bytes)>> {
    let mut header_buf = [0u8; BRIDGE_HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let header = BridgeHeader::decode(&header_buf)?;

    if header.length == 0 {
        return Ok(Some((header, Bytes::new())));
    }
    let mut payload = vec![0u8; header.length as usize];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some((header, Bytes::from(payload)))),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Turn inbound frames into events until the socket or session ends.
async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf) {
    loop {
        let frame = tokio::select! {
            res = read_frame(&mut reader) => res,
            () = shared.wait_closed() => return,
        };

        let (header, payload) = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("device closed the session");
                shared.close();
                shared.emit(BridgeEvent::Disconnected);
                return;
            }
            Err(err) => {
                warn!(%err, "bridge read failed");
                shared.close();
                shared.emit(BridgeEvent::Disconnected);
                return;
            }
        };
        shared.touch_rx();

        match header.msg_type {
            BridgeMessageType::Audio => shared.emit(BridgeEvent::Audio(payload)),
            BridgeMessageType::Ring => shared.emit(BridgeEvent::Ringing),
            BridgeMessageType::Answer => {
                shared.streaming.store(true, Ordering::Release);
                shared.emit(BridgeEvent::Answered);
            }
            BridgeMessageType::Ping => {
                shared.queue_control(BridgeHeader::control(BridgeMessageType::Pong), Bytes::new());
            }
            BridgeMessageType::Pong => {}
            BridgeMessageType::Error => {
                let code = BridgeErrorCode::from(payload.first().copied().unwrap_or(0xFF));
                warn!(?code, "device reported error");
                shared.emit(BridgeEvent::Error(code));
            }
            // The device hanging up on us.
            BridgeMessageType::Stop => {
                info!("device stopped the session");
                shared.streaming.store(false, Ordering::Release);
                shared.close();
                shared.emit(BridgeEvent::Disconnected);
                return;
            }
            BridgeMessageType::Start => {
                debug!("ignoring START from device");
            }
        }

        if shared.is_closed() {
            return;
        }
    }
}

/// Sole owner of the write half: control first, then audio.
async fn write_loop(
    shared: Arc<Shared>,
    mut control_rx: UnboundedReceiver<(BridgeHeader, Bytes)>,
    mut audio_rx: Receiver<Bytes>,
    write_half: OwnedWriteHalf,
) {
    let mut writer = BufWriter::new(write_half);

    loop {
        tokio::select! {
            biased;

            msg = control_rx.recv() => {
                let Some((header, payload)) = msg else { return };
                if let Err(err) = write_frame(&mut writer, header, &payload).await {
                    warn!(%err, "bridge control write failed");
                    shared.close();
                    shared.emit(BridgeEvent::Disconnected);
                    return;
                }
            }

            () = shared.wait_closed() => {
                let _ = writer.shutdown().await;
                return;
            }

            pcm = audio_rx.recv() => {
                let Some(pcm) = pcm else { return };
                let header = BridgeHeader {
                    msg_type: BridgeMessageType::Audio,
                    flags: 0,
                    length: pcm.len() as u16,
                };
                if let Err(err) = write_frame(&mut writer, header, &pcm).await {
                    warn!(%err, "bridge audio write failed");
                    shared.close();
                    shared.emit(BridgeEvent::Disconnected);
                    return;
                }
            }
        }
    }
}

async fn write_frame(
    writer: &mut BufWriter<OwnedWriteHalf>,
    header: BridgeHeader,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await
}

/// PING the device on a cadence; end the session when it goes silent.
async fn keepalive(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = shared.wait_closed() => return,
        }

        if shared.rx_age() > shared.config.ping_timeout {
            warn!("device silent past ping timeout, ending session");
            shared.close();
            shared.emit(BridgeEvent::Disconnected);
            return;
        }

        shared.queue_control(BridgeHeader::control(BridgeMessageType::Ping), Bytes::new());
    }
}
