use std::time::Duration;

use tokio::{
    io::{AsyncWriteExt, BufReader, BufWriter},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot},
};
use tracing::debug;

use crate::{
    protocol::{
        deserializer::{Deserialize, DeserializeError},
        message::{FromClient, ToClient},
        serializer::Serialize,
    },
    systems::{record::CameraHandle, ticket::DispatcherId, Mile},
    SharedSystems,
};

const TO_CLIENT_BUFFER_SIZE: usize = 32;

type ConnReader = BufReader<OwnedReadHalf>;
type ConnWriter = BufWriter<OwnedWriteHalf>;

enum Mode {
    Unidentified,
    Camera { mile: Mile, handle: CameraHandle },
    Dispatcher { id: DispatcherId },
}

pub async fn handle(connection: TcpStream, systems: SharedSystems) -> anyhow::Result<()> {
    let (reader, writer) = connection.into_split();
    let reader = BufReader::new(reader);
    let writer = BufWriter::new(writer);

    let (to_client, rx) = mpsc::channel(TO_CLIENT_BUFFER_SIZE);

    // The writer gets its own task so that queued frames (a final Error
    // in particular) still drain after the read side has returned.
    let writer_task = tokio::spawn(managed_writer(writer, rx));

    let (set_heartbeat, heartbeat_interval) = oneshot::channel();
    let mut mode = Mode::Unidentified;

    let result = tokio::select! {
        result = from_client(reader, to_client.clone(), &systems, &mut mode, set_heartbeat) => result,
        result = heartbeat(to_client.clone(), heartbeat_interval) => result,
    };

    // Withdraw the dispatcher registration before the write queue is
    // torn down; queued tickets for its roads stay queued.
    if let Mode::Dispatcher { id } = mode {
        systems.ticket.deregister_dispatcher(id).await;
    }

    drop(to_client);
    writer_task.await??;

    result
}

async fn managed_writer(
    mut writer: ConnWriter,
    mut from_server: mpsc::Receiver<ToClient>,
) -> anyhow::Result<()> {
    while let Some(message) = from_server.recv().await {
        message.serialize(&mut writer).await?;
        writer.flush().await?;
    }

    Ok(())
}

async fn heartbeat(
    to_client: mpsc::Sender<ToClient>,
    interval: oneshot::Receiver<Duration>,
) -> anyhow::Result<()> {
    let Ok(period) = interval.await else {
        // The client never asked for heartbeats (or asked for none).
        return std::future::pending().await;
    };

    let mut timer = tokio::time::interval(period);
    timer.tick().await; // the period starts now, not with an immediate beat

    loop {
        timer.tick().await;
        to_client.send(ToClient::Heartbeat).await?;
    }
}

async fn from_client(
    mut reader: ConnReader,
    to_client: mpsc::Sender<ToClient>,
    systems: &SharedSystems,
    mode: &mut Mode,
    set_heartbeat: oneshot::Sender<Duration>,
) -> anyhow::Result<()> {
    let mut set_heartbeat = Some(set_heartbeat);

    loop {
        let message = match FromClient::deserialize(&mut reader).await {
            Ok(message) => message,
            Err(reason) => {
                let reason = match reason {
                    // Disconnect or short read: terminate silently.
                    DeserializeError::Io(_) => return Ok(()),
                    DeserializeError::Utf(_) => "invalid string",
                    DeserializeError::UnknownType(_) => "unknown message",
                };
                to_client.send(ToClient::error(reason)).await?;

                return Ok(());
            }
        };

        match message {
            FromClient::WantHeartbeat { interval } => match set_heartbeat.take() {
                Some(tx) => {
                    debug!(interval, "heartbeat requested");
                    if interval > 0 {
                        // Interval is in deciseconds.
                        let _ = tx.send(Duration::from_millis(u64::from(interval) * 100));
                    }
                }
                None => {
                    to_client
                        .send(ToClient::error("heartbeat already configured"))
                        .await?;

                    return Ok(());
                }
            },
            FromClient::IAmCamera { road, mile, limit } => match mode {
                Mode::Unidentified => {
                    debug!(road, mile, limit, "client identified as camera");
                    let handle = systems.record.clone().register_camera(road, limit).await;
                    *mode = Mode::Camera { mile, handle };
                }
                _ => {
                    to_client
                        .send(ToClient::error("already identified"))
                        .await?;

                    return Ok(());
                }
            },
            FromClient::IAmDispatcher { roads } => match mode {
                Mode::Unidentified => {
                    debug!(?roads, "client identified as dispatcher");
                    let id = systems
                        .ticket
                        .register_dispatcher(roads, to_client.clone())
                        .await;
                    *mode = Mode::Dispatcher { id };
                }
                _ => {
                    to_client
                        .send(ToClient::error("already identified"))
                        .await?;

                    return Ok(());
                }
            },
            FromClient::Plate { plate, timestamp } => match mode {
                Mode::Camera { mile, handle } => {
                    handle.submit_observation(*mile, plate, timestamp).await;
                }
                _ => {
                    to_client.send(ToClient::error("not a camera")).await?;

                    return Ok(());
                }
            },
        }
    }
}
