use std::{
    collections::{hash_map, HashMap},
    net::SocketAddr,
    sync::Arc,
};

use tokio::{
    io::DuplexStream,
    net::{ToSocketAddrs, UdpSocket},
    sync::mpsc,
};
use tracing::debug;

use super::{
    connection::{self, Handler},
    message::{Kind, Message},
    MAX_MESSAGE_SIZE,
};

pub struct Listener {
    sessions: mpsc::UnboundedReceiver<DuplexStream>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds the UDP socket and starts the datagram read loop.
    pub async fn bind<A>(addr: A) -> tokio::io::Result<Self>
    where
        A: ToSocketAddrs,
    {
        // Unbounded so the read loop never blocks on a slow acceptor.
        let (accepted, rx) = mpsc::unbounded_channel();
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;

        tokio::spawn(read_loop(socket, accepted));

        Ok(Self {
            sessions: rx,
            local_addr,
        })
    }

    /// Waits for the next freshly-opened session.
    pub async fn accept(&mut self) -> tokio::io::Result<DuplexStream> {
        self.sessions.recv().await.ok_or_else(|| {
            tokio::io::Error::new(
                tokio::io::ErrorKind::ConnectionAborted,
                "the session channel has been closed",
            )
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    accepted: mpsc::UnboundedSender<DuplexStream>,
) -> anyhow::Result<()> {
    let mut sessions: HashMap<u32, Handler> = HashMap::default();

    // Oversized datagrams must be rejected, not truncated into a valid
    // prefix, so the buffer is larger than the wire bound.
    let mut packet = [0u8; 2 * MAX_MESSAGE_SIZE];

    loop {
        let (len, addr) = socket.recv_from(&mut packet).await?;

        let message = match std::str::from_utf8(&packet[..len])
            .map_err(anyhow::Error::from)
            .and_then(|text| text.parse::<Message>().map_err(anyhow::Error::from))
        {
            Ok(message) => message,
            Err(error) => {
                debug!(%addr, %error, "rejecting datagram");
                continue;
            }
        };

        // A session whose task has ended reads as unknown from here on.
        if let Some(conn) = sessions.get(&message.session) {
            if conn.is_closed() {
                sessions.remove(&message.session);
            }
        }

        match message.kind {
            Kind::Connect => match sessions.entry(message.session) {
                hash_map::Entry::Vacant(entry) => {
                    debug!(session = message.session, %addr, "session opened");

                    let (handler, stream) =
                        connection::spawn(socket.clone(), addr, message.session);
                    // The new session acks zero bytes received.
                    let _ = handler.connect(addr);

                    if accepted.send(stream).is_err() {
                        // The listener itself was dropped; the session
                        // task will expire on its own.
                        continue;
                    }
                    entry.insert(handler);
                }
                hash_map::Entry::Occupied(entry) => {
                    // Duplicate connect: re-ack with the current
                    // received count.
                    let _ = entry.get().connect(addr);
                }
            },
            Kind::Close => {
                // A live session task replies `/close/` itself as it
                // ends; unknown sessions get a direct reply.
                let handled = sessions
                    .remove(&message.session)
                    .is_some_and(|conn| conn.close(addr).is_ok());

                if !handled {
                    socket
                        .send_to(Message::close(message.session).to_string().as_bytes(), addr)
                        .await?;
                }
            }
            Kind::Ack { length } => match sessions.get(&message.session) {
                Some(conn) => {
                    // On a full buffer the peer simply retransmits.
                    let _ = conn.ack(addr, length);
                }
                None => {
                    socket
                        .send_to(Message::close(message.session).to_string().as_bytes(), addr)
                        .await?;
                }
            },
            Kind::Data { position, data } => match sessions.get(&message.session) {
                Some(conn) => {
                    let _ = conn.data(addr, position, data);
                }
                None => {
                    socket
                        .send_to(Message::close(message.session).to_string().as_bytes(), addr)
                        .await?;
                }
            },
        }
    }
}
