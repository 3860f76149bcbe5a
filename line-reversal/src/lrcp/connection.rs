use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    net::UdpSocket,
    sync::{mpsc, Mutex},
};
use tracing::debug;

use super::{message::Message, MAX_MESSAGE_SIZE, RETRANSMIT_INTERVAL, SESSION_EXPIRY};

// When this buffer is full, incoming packets are dropped unacked and
// the peer retransmits later.
const INCOMING_BUFFER_SIZE: usize = 128;

const INTERNAL_STREAM_SIZE: usize = 8192;
const INTERNAL_BUFFER_SIZE: usize = 128;
const APP_READ_CHUNK: usize = 1024;

#[derive(Debug)]
enum InternalMessage {
    Connect { addr: SocketAddr },
    Data { addr: SocketAddr, position: u32, data: String },
    Ack { addr: SocketAddr, length: u32 },
    Close { addr: SocketAddr },
}

// State shared between the inbound and outbound halves of a session.
// The peer address floats: each packet may come from somewhere new and
// replies follow the latest source.
#[derive(Debug)]
struct Shared {
    socket: Arc<UdpSocket>,
    session: u32,
    peer: Mutex<SocketAddr>,
    sent_len: Mutex<u32>,
}

impl Shared {
    async fn send(&self, message: &Message) -> tokio::io::Result<()> {
        let addr = *self.peer.lock().await;
        self.socket
            .send_to(message.to_string().as_bytes(), addr)
            .await?;

        Ok(())
    }

    async fn follow_peer(&self, addr: SocketAddr) {
        *self.peer.lock().await = addr;
    }
}

pub(super) fn spawn(
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    session: u32,
) -> (Handler, DuplexStream) {
    let (tx, from_listener) = mpsc::channel(INCOMING_BUFFER_SIZE);
    let handler = Handler { sender: tx };

    let (app_side, conn_side) = tokio::io::duplex(INTERNAL_STREAM_SIZE);

    let (to_peer_tx, to_peer_rx) = mpsc::channel(1);
    let (to_app_tx, to_app_rx) = mpsc::channel(INTERNAL_BUFFER_SIZE);
    let (ack_tx, ack_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(Shared {
        socket,
        session,
        peer: Mutex::new(addr),
        sent_len: Mutex::new(0),
    });

    tokio::spawn(async move {
        tokio::select! {
            _ = inbound(shared.clone(), from_listener, to_app_tx, ack_tx) => {},
            _ = bridge_app(conn_side, to_peer_tx, to_app_rx) => {},
            _ = outbound(shared.clone(), to_peer_rx, ack_rx) => {},
        };

        debug!(session, "session ended");
        let _ = shared.send(&Message::close(session)).await;
    });

    (handler, app_side)
}

// Reassembles the peer's stream and answers every packet with the
// current received count. Returning tears the whole session down.
async fn inbound(
    conn: Arc<Shared>,
    mut from_listener: mpsc::Receiver<InternalMessage>,
    to_app: mpsc::Sender<String>,
    acks: mpsc::UnboundedSender<u32>,
) -> anyhow::Result<()> {
    let mut received: u32 = 0;

    loop {
        let message = match tokio::time::timeout(SESSION_EXPIRY, from_listener.recv()).await {
            Ok(Some(message)) => message,
            // The listener dropped this session.
            Ok(None) => return Ok(()),
            Err(_) => {
                debug!(session = conn.session, "session expired");
                return Ok(());
            }
        };

        match message {
            InternalMessage::Connect { addr } => {
                conn.follow_peer(addr).await;
                conn.send(&Message::ack(conn.session, received)).await?;
            }
            InternalMessage::Close { addr } => {
                conn.follow_peer(addr).await;
                return Ok(());
            }
            InternalMessage::Ack { addr, length } => {
                conn.follow_peer(addr).await;

                if length > *conn.sent_len.lock().await {
                    // Acknowledging bytes we never sent: misbehaving peer.
                    return Ok(());
                }

                acks.send(length)
                    .context("the ack channel outlives the session")?;
            }
            InternalMessage::Data { addr, position, data } => {
                conn.follow_peer(addr).await;

                if position <= received {
                    let seen = (received - position) as usize;

                    if seen < data.len() {
                        let fresh = &data[seen..];

                        match to_app.try_send(fresh.to_string()) {
                            Ok(()) => received += fresh.len() as u32,
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                // No room; skip the ack so the peer
                                // retransmits once we have drained.
                                continue;
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
                        }
                    }
                }

                // position > received leaves the stream untouched; the
                // ack of the current frontier tells the peer where to
                // resume.
                conn.send(&Message::ack(conn.session, received)).await?;
            }
        }
    }
}

// Moves bytes between the session's DuplexStream and the transmission
// machinery in both directions.
async fn bridge_app(
    stream: DuplexStream,
    to_peer: mpsc::Sender<String>,
    mut to_app: mpsc::Receiver<String>,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let outgoing = async move {
        let mut block = [0u8; APP_READ_CHUNK];
        loop {
            let rcount = reader.read(&mut block).await?;
            if rcount == 0 {
                break; // the application is done with this session
            }

            to_peer
                .send(
                    String::from_utf8(block[..rcount].into())
                        .context("application data should be valid text")?,
                )
                .await?;
        }

        Ok::<(), anyhow::Error>(())
    };

    let incoming = async move {
        while let Some(data) = to_app.recv().await {
            writer.write_all(data.as_bytes()).await?;
        }

        Ok::<(), anyhow::Error>(())
    };

    tokio::select! {
        result = outgoing => result,
        result = incoming => result,
    }
}

// Delivers application data to the peer reliably: escape-aware chunks
// under the datagram bound, retransmitted until acknowledged.
async fn outbound(
    conn: Arc<Shared>,
    mut app_data: mpsc::Receiver<String>,
    mut acks: mpsc::UnboundedReceiver<u32>,
) -> anyhow::Result<()> {
    // Offset of the start of the current payload in the outbound stream.
    let mut stream_pos: u32 = 0;
    let mut acked: u32 = 0;

    while let Some(data) = app_data.recv().await {
        let mut sent_so_far: u32 = 0;

        while (sent_so_far as usize) < data.len() {
            let position = stream_pos + sent_so_far;
            let remaining = &data[sent_so_far as usize..];
            let take = chunk_len(remaining, payload_budget(conn.session, position));
            let message = Message::data(conn.session, position, remaining[..take].to_string());
            let chunk_end = position + take as u32;

            let mut retransmit = tokio::time::interval(RETRANSMIT_INTERVAL);

            loop {
                tokio::select! {
                    // The first tick fires immediately: that is the
                    // initial transmission.
                    _ = retransmit.tick() => {
                        {
                            let mut sent_len = conn.sent_len.lock().await;
                            *sent_len = (*sent_len).max(chunk_end);
                        }
                        conn.send(&message).await?;
                    }
                    ack = acks.recv() => {
                        let Some(ack_len) = ack else { return Ok(()) };

                        if ack_len <= acked {
                            continue; // stale duplicate
                        }
                        if (ack_len as usize) > stream_pos as usize + data.len() {
                            // Beyond anything we produced: misbehaving peer.
                            return Ok(());
                        }

                        // Progress. A partial ack re-opens the tail of
                        // the chunk; the rebuilt message resends from
                        // the new offset right away.
                        acked = ack_len;
                        sent_so_far = ack_len - stream_pos;
                        break;
                    }
                };
            }
        }

        stream_pos += data.len() as u32;
    }

    // The application hung up; nothing more to deliver.
    Ok(())
}

// Escaped-payload bytes that fit a `/data/SESSION/POS/PAYLOAD/`
// datagram under the wire bound, for the given header values.
fn payload_budget(session: u32, position: u32) -> usize {
    let envelope = "/data/".len()
        + decimal_width(session)
        + "/".len()
        + decimal_width(position)
        + "//".len();
    MAX_MESSAGE_SIZE - 1 - envelope
}

fn decimal_width(value: u32) -> usize {
    value.to_string().len()
}

// Longest prefix of `payload` whose escaped form fits the budget.
fn chunk_len(payload: &str, budget: usize) -> usize {
    let mut used = 0;
    let mut len = 0;

    for ch in payload.chars() {
        let width = match ch {
            '\\' | '/' => 2,
            _ => ch.len_utf8(),
        };
        if used + width > budget {
            break;
        }
        used += width;
        len += ch.len_utf8();
    }

    len
}

pub(super) struct BufferIsFull;

// Handle the listener uses to feed packets into the session.
pub(super) struct Handler {
    sender: mpsc::Sender<InternalMessage>,
}

impl Handler {
    pub(super) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub(super) fn connect(&self, addr: SocketAddr) -> Result<(), BufferIsFull> {
        self.sender
            .try_send(InternalMessage::Connect { addr })
            .map_err(|_| BufferIsFull)
    }

    pub(super) fn data(
        &self,
        addr: SocketAddr,
        position: u32,
        data: String,
    ) -> Result<(), BufferIsFull> {
        self.sender
            .try_send(InternalMessage::Data { addr, position, data })
            .map_err(|_| BufferIsFull)
    }

    pub(super) fn ack(&self, addr: SocketAddr, length: u32) -> Result<(), BufferIsFull> {
        self.sender
            .try_send(InternalMessage::Ack { addr, length })
            .map_err(|_| BufferIsFull)
    }

    pub(super) fn close(&self, addr: SocketAddr) -> Result<(), BufferIsFull> {
        self.sender
            .try_send(InternalMessage::Close { addr })
            .map_err(|_| BufferIsFull)
    }
}
