//! Per-connection tasks.
//!
//! Each accepted socket gets three cooperative tasks: the **reader**
//! (header, payload, dispatch), the **writer** (sole owner of the write
//! half: control frames flushed immediately, audio drained from the
//! bounded queue with paced best-effort flushes) and the **keepalive**
//! (PING cadence plus idle eviction). The reader owns the connection
//! lifetime: when it returns, the other two are aborted and awaited, then
//! the full disconnect path runs.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use intercom_proto::broker::{BrokerHeader, BrokerMessageType, BROKER_HEADER_LEN};
use intercom_proto::{FrameError, MAX_PAYLOAD_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::broker::Inner;
use crate::device::{ControlFrame, Device};
use crate::Result;

/// How long connection teardown waits for the writer to drain.
const WRITER_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

pub(crate) async fn run(inner: Arc<Inner>, stream: TcpStream, addr: SocketAddr, conn_id: u64) {
    // Audio frames are small and latency-sensitive; never batch them.
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%addr, %err, "set_nodelay failed");
    }

    let (mut read_half, write_half) = stream.into_split();
    let (device, control_rx) = Device::new(conn_id, addr, inner.config.audio_queue_frames);
    let device = Arc::new(device);

    let mut writer = tokio::spawn(write_loop(
        inner.clone(),
        device.clone(),
        control_rx,
        write_half,
    ));
    let keepalive = tokio::spawn(keepalive(inner.clone(), device.clone()));

    match read_loop(&inner, &device, &mut read_half).await {
        Ok(()) => info!(peer = %device.label(), "device disconnected"),
        Err(err) => warn!(peer = %device.label(), %err, "connection failed"),
    }
    device.close();

    keepalive.abort();
    let _ = keepalive.await;
    // Give the writer a moment to drain queued control frames; a peer
    // that has stopped reading must not stall cleanup.
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
        let _ = writer.await;
    }

    inner.disconnect_device(&device).await;
    inner.forget_conn(conn_id);
}

/// Read frames until EOF, a protocol violation, or a close request.
///
/// An incomplete read at EOF is a clean disconnect; malformed framing and
/// oversized payloads terminate the connection with an error.
async fn read_loop(
    inner: &Arc<Inner>,
    device: &Arc<Device>,
    reader: &mut OwnedReadHalf,
) -> Result<()> {
    let mut header_buf = [0u8; BROKER_HEADER_LEN];
    loop {
        tokio::select! {
            res = reader.read_exact(&mut header_buf) => match res {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            },
            () = device.wait_closed() => return Ok(()),
        }

        let header = match BrokerHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(FrameError::UnknownMessageType(t)) => {
                // The length field is still trustworthy; skip the payload
                // and keep the connection.
                let length = u16::from_le_bytes([header_buf[2], header_buf[3]]) as usize;
                if length > MAX_PAYLOAD_LEN {
                    return Err(FrameError::PayloadTooLarge {
                        len: length,
                        max: MAX_PAYLOAD_LEN,
                    }
                    .into());
                }
                warn!(peer = %device.label(), msg_type = t, "unknown message type");
                if read_payload(reader, length).await?.is_none() {
                    return Ok(());
                }
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        let Some(payload) = read_payload(reader, header.length as usize).await? else {
            return Ok(());
        };

        device.touch_heartbeat();
        dispatch(inner, device, header, payload).await;

        if device.is_closed() {
            return Ok(());
        }
    }
}

/// Read exactly `length` payload bytes; `None` means EOF (clean disconnect).
async fn read_payload(reader: &mut OwnedReadHalf, length: usize) -> Result<Option<Bytes>> {
    if length == 0 {
        return Ok(Some(Bytes::new()));
    }
    let mut buf = vec![0u8; length];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(Some(Bytes::from(buf))),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn dispatch(inner: &Arc<Inner>, device: &Arc<Device>, header: BrokerHeader, payload: Bytes) {
    match header.msg_type {
        BrokerMessageType::Register => inner.handle_register(device, &payload).await,
        BrokerMessageType::Invite => inner.handle_invite(device, &payload).await,
        BrokerMessageType::Answer => inner.handle_answer(device, header.call_id).await,
        BrokerMessageType::Decline => {
            inner.handle_decline(device, header.call_id, &payload).await;
        }
        BrokerMessageType::Hangup => inner.handle_hangup(device, header.call_id).await,
        BrokerMessageType::Audio => {
            inner
                .handle_audio(device, header.call_id, header.seq, payload)
                .await;
        }
        BrokerMessageType::Ping => {
            inner.send_or_close(
                device,
                BrokerHeader::control(BrokerMessageType::Pong, 0),
                Bytes::new(),
            );
        }
        BrokerMessageType::Pong => {}
        // Relay-to-device messages arriving inbound are protocol noise.
        BrokerMessageType::Ring
        | BrokerMessageType::Bye
        | BrokerMessageType::Contacts
        | BrokerMessageType::Error => {
            debug!(
                peer = %device.label(),
                msg_type = ?header.msg_type,
                "ignoring relay-direction message from peer"
            );
        }
    }
}

/// Sole owner of the socket's write half.
///
/// Control frames are written and flushed as they arrive. Audio is drained
/// from the bounded queue without per-frame flushes; a best-effort flush
/// runs every `flush_every_frames` frames and once more when the queue
/// empties, each bounded by the soft flush timeout. Write failures close
/// the connection.
async fn write_loop(
    inner: Arc<Inner>,
    device: Arc<Device>,
    mut control_rx: UnboundedReceiver<ControlFrame>,
    write_half: OwnedWriteHalf,
) {
    let mut writer = BufWriter::new(write_half);
    let flush_every = inner.config.flush_every_frames.max(1);
    let flush_timeout = inner.config.flush_timeout;
    let mut unflushed: u32 = 0;

    loop {
        tokio::select! {
            biased;

            msg = control_rx.recv() => {
                let Some(frame) = msg else { return };
                let res = async {
                    write_frame(&mut writer, &frame.header, &frame.payload).await?;
                    writer.flush().await
                }
                .await;
                if let Err(err) = res {
                    warn!(peer = %device.label(), %err, "control write failed, closing connection");
                    device.close();
                    return;
                }
                unflushed = 0;
            }

            () = device.wait_closed() => {
                let _ = writer.shutdown().await;
                return;
            }

            () = device.audio_wakeup() => {
                while let Some(frame) = device.pop_audio() {
                    let header = BrokerHeader {
                        msg_type: BrokerMessageType::Audio,
                        flags: 0,
                        length: frame.payload.len() as u16,
                        call_id: device.current_call(),
                        seq: frame.seq,
                    };
                    if let Err(err) = write_frame(&mut writer, &header, &frame.payload).await {
                        warn!(peer = %device.label(), %err, "audio write failed, closing connection");
                        device.close();
                        return;
                    }
                    unflushed += 1;
                    if unflushed >= flush_every {
                        unflushed = 0;
                        if let Err(err) = flush_soft(&mut writer, flush_timeout).await {
                            warn!(peer = %device.label(), %err, "audio flush failed, closing connection");
                            device.close();
                            return;
                        }
                    }
                }
                if unflushed > 0 {
                    unflushed = 0;
                    if let Err(err) = flush_soft(&mut writer, flush_timeout).await {
                        warn!(peer = %device.label(), %err, "audio flush failed, closing connection");
                        device.close();
                        return;
                    }
                }
            }
        }
    }
}

async fn write_frame(
    writer: &mut BufWriter<OwnedWriteHalf>,
    header: &BrokerHeader,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    Ok(())
}

/// Flush bounded by `limit`; a missed deadline is tolerated (TCP handles
/// congestion), a failed write is not.
async fn flush_soft(
    writer: &mut BufWriter<OwnedWriteHalf>,
    limit: std::time::Duration,
) -> std::io::Result<()> {
    match tokio::time::timeout(limit, writer.flush()).await {
        Ok(res) => res,
        Err(_elapsed) => Ok(()),
    }
}

/// Emit PING on the configured cadence and evict peers that have been
/// silent past the idle timeout.
async fn keepalive(inner: Arc<Inner>, device: Arc<Device>) {
    let mut ticker = tokio::time::interval(inner.config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is immediate

    loop {
        ticker.tick().await;

        if device.heartbeat_age() > inner.config.idle_timeout {
            warn!(
                peer = %device.label(),
                "peer silent past idle timeout, disconnecting"
            );
            device.close();
            return;
        }

        inner.send_or_close(
            &device,
            BrokerHeader::control(BrokerMessageType::Ping, 0),
            Bytes::new(),
        );
        if device.is_closed() {
            return;
        }
    }
}
