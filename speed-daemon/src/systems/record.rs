use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use super::{ticket::Ticket, Limit, Mile, Plate, Road, Timestamp};

// The system only routes to per-road workers, so a small buffer is enough.
const SYSTEM_BUFFER_SIZE: usize = 64;

// One worker per road; reports for one road arrive from a handful of
// cameras at most.
const WORKER_BUFFER_SIZE: usize = 64;

#[derive(Debug)]
enum InternalMessage {
    RegisterCamera(Road, Limit),
    SubmitObservation(Road, Mile, Plate, Timestamp),
}

pub struct System {
    workers: HashMap<Road, RoadWorkerHandle>,
    ticket_system: super::ticket::Handler,
}

impl System {
    /// Starts the record system and returns a handle to it.
    ///
    /// note: must be called from inside a tokio runtime context
    pub fn start(ticket_system: super::ticket::Handler) -> Handler {
        let (tx, mut rx) = mpsc::channel(SYSTEM_BUFFER_SIZE);

        let mut this = Self {
            workers: HashMap::default(),
            ticket_system,
        };
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    InternalMessage::RegisterCamera(road, limit) => {
                        this.register_camera(road, limit);
                    }
                    InternalMessage::SubmitObservation(road, mile, plate, timestamp) => {
                        this.submit_observation(road, mile, plate, timestamp).await;
                    }
                }
            }
        });

        Handler { sender: tx }
    }

    fn register_camera(&mut self, road: Road, limit: Limit) {
        self.workers
            .entry(road)
            .or_insert_with(|| RoadWorker::start(road, limit, self.ticket_system.clone()));
    }

    async fn submit_observation(
        &mut self,
        road: Road,
        mile: Mile,
        plate: Plate,
        timestamp: Timestamp,
    ) {
        let worker = self
            .workers
            .get(&road)
            .expect("a camera must be registered before it can report");

        worker.submit_observation(mile, plate, timestamp).await;
    }
}

#[derive(Debug, Clone)]
pub struct Handler {
    sender: mpsc::Sender<InternalMessage>,
}

impl Handler {
    /// Registers a camera on a road, converting this handle into one
    /// that can submit that camera's plate observations.
    pub async fn register_camera(self, road: Road, limit: Limit) -> CameraHandle {
        self.sender
            .send(InternalMessage::RegisterCamera(road, limit))
            .await
            .expect("the system should live as long as the handler does");

        CameraHandle {
            sender: self.sender,
            road,
        }
    }
}

pub struct CameraHandle {
    sender: mpsc::Sender<InternalMessage>,
    road: Road,
}

impl CameraHandle {
    pub async fn submit_observation(&self, mile: Mile, plate: Plate, timestamp: Timestamp) {
        self.sender
            .send(InternalMessage::SubmitObservation(
                self.road, mile, plate, timestamp,
            ))
            .await
            .expect("the system should live as long as the handle does");
    }
}

// Road worker

enum WorkerMessage {
    Observation(Mile, Plate, Timestamp),
}

struct RoadWorker {
    road: Road,
    limit: Limit,
    // Append-only per-plate history; observations are never deduplicated.
    observations: HashMap<Plate, Vec<(Mile, Timestamp)>>,
    ticket_system: super::ticket::Handler,
}

impl RoadWorker {
    fn start(road: Road, limit: Limit, ticket_system: super::ticket::Handler) -> RoadWorkerHandle {
        let (tx, mut rx) = mpsc::channel(WORKER_BUFFER_SIZE);

        let mut this = Self {
            road,
            limit,
            observations: HashMap::new(),
            ticket_system,
        };
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    WorkerMessage::Observation(mile, plate, timestamp) => {
                        this.observe(mile, plate, timestamp).await;
                    }
                }
            }
        });

        RoadWorkerHandle { sender: tx }
    }

    async fn observe(&mut self, mile: Mile, plate: Plate, timestamp: Timestamp) {
        debug!(road = self.road, mile, %plate, timestamp, "observation");

        let bucket = self.observations.entry(plate.clone()).or_default();

        // Pair the new observation against every prior one for this
        // plate on this road.
        let mut candidates = Vec::new();
        for &(prior_mile, prior_timestamp) in bucket.iter() {
            let Some(speed) =
                speeding_mph((prior_mile, prior_timestamp), (mile, timestamp), self.limit)
            else {
                continue;
            };

            let (first, second) = if prior_timestamp <= timestamp {
                ((prior_mile, prior_timestamp), (mile, timestamp))
            } else {
                ((mile, timestamp), (prior_mile, prior_timestamp))
            };

            candidates.push(Ticket {
                plate: plate.clone(),
                road: self.road,
                mile1: first.0,
                timestamp1: first.1,
                mile2: second.0,
                timestamp2: second.1,
                speed,
            });
        }
        bucket.push((mile, timestamp));

        for ticket in candidates {
            self.ticket_system.submit_ticket(ticket).await;
        }
    }
}

/// Average speed of a pair of observations, as the wire-format value in
/// hundredths of a mile per hour, when it exceeds the road limit.
///
/// A pair observed at the same instant has no average speed and never
/// produces a candidate.
fn speeding_mph(a: (Mile, Timestamp), b: (Mile, Timestamp), limit: Limit) -> Option<u16> {
    let distance = a.0.abs_diff(b.0);
    let seconds = a.1.abs_diff(b.1);
    if seconds == 0 {
        return None;
    }

    let mph = (f64::from(distance) * 3600.0 / f64::from(seconds)).round() as u64;
    if mph <= u64::from(limit) {
        return None;
    }

    // A value too large for the wire field cannot come from a real
    // vehicle; drop the pair rather than truncate.
    u16::try_from(mph.saturating_mul(100)).ok()
}

#[derive(Debug, Clone)]
struct RoadWorkerHandle {
    sender: mpsc::Sender<WorkerMessage>,
}

impl RoadWorkerHandle {
    async fn submit_observation(&self, mile: Mile, plate: Plate, timestamp: Timestamp) {
        self.sender
            .send(WorkerMessage::Observation(mile, plate, timestamp))
            .await
            .expect("the road worker should live as long as its handle does");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::protocol::message::ToClient;
    use crate::systems::ticket;

    use super::speeding_mph;

    #[test]
    fn speed_is_rounded_half_up_before_comparison() {
        // 1 mile in 45 seconds: 80 mph.
        assert_eq!(speeding_mph((8, 0), (9, 45), 60), Some(8000));
        // Exactly at the limit is not a violation.
        assert_eq!(speeding_mph((0, 0), (1, 60), 60), None);
        // 1 mile in 59 seconds: 61.02 mph, rounds to 61.
        assert_eq!(speeding_mph((0, 0), (1, 59), 60), Some(6100));
        // Rounding down to the limit is not a violation: 60.4 mph.
        assert_eq!(speeding_mph((0, 0), (151, 9000), 60), None);
        // Identical timestamps never produce a candidate.
        assert_eq!(speeding_mph((5, 100), (9, 100), 0), None);
        // Zero distance never exceeds any limit.
        assert_eq!(speeding_mph((5, 0), (5, 100), 0), None);
    }

    #[test]
    fn direction_of_travel_is_free() {
        assert_eq!(speeding_mph((9, 45), (8, 0), 60), Some(8000));
    }

    async fn expect_ticket(rx: &mut mpsc::Receiver<ToClient>) -> ToClient {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("expected a ticket before the timeout")
            .expect("dispatcher channel closed")
    }

    #[tokio::test]
    async fn camera_pair_triggers_ticket() {
        let ticket_system = ticket::System::start();
        let record_system = super::System::start(ticket_system.clone());

        let (tx, mut rx) = mpsc::channel(8);
        ticket_system.register_dispatcher(vec![123], tx).await;

        let first_camera = record_system.clone().register_camera(123, 60).await;
        let second_camera = record_system.register_camera(123, 60).await;

        first_camera.submit_observation(8, "UN1X".into(), 0).await;
        second_camera.submit_observation(9, "UN1X".into(), 45).await;

        let delivered = expect_ticket(&mut rx).await;
        assert_eq!(
            delivered,
            ToClient::Ticket {
                plate: "UN1X".into(),
                road: 123,
                mile1: 8,
                timestamp1: 0,
                mile2: 9,
                timestamp2: 45,
                speed: 8000,
            }
        );
    }

    #[tokio::test]
    async fn out_of_order_reports_order_the_ticket_by_timestamp() {
        let ticket_system = ticket::System::start();
        let record_system = super::System::start(ticket_system.clone());

        let (tx, mut rx) = mpsc::channel(8);
        ticket_system.register_dispatcher(vec![5], tx).await;

        let camera = record_system.register_camera(5, 60).await;
        // Later observation reported first.
        camera.submit_observation(9, "UN1X".into(), 45).await;
        camera.submit_observation(8, "UN1X".into(), 0).await;

        let delivered = expect_ticket(&mut rx).await;
        let ToClient::Ticket {
            mile1,
            timestamp1,
            mile2,
            timestamp2,
            ..
        } = delivered
        else {
            panic!("expected a ticket, received: {delivered:?}");
        };
        assert_eq!((mile1, timestamp1, mile2, timestamp2), (8, 0, 9, 45));
    }

    #[tokio::test]
    async fn limit_zero_camera_with_identical_reports_stays_quiet() {
        let ticket_system = ticket::System::start();
        let record_system = super::System::start(ticket_system.clone());

        let (tx, mut rx) = mpsc::channel(8);
        ticket_system.register_dispatcher(vec![7], tx).await;

        let camera = record_system.register_camera(7, 0).await;
        camera.submit_observation(3, "STILL".into(), 1000).await;
        camera.submit_observation(3, "STILL".into(), 1000).await;

        assert!(
            timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
            "expected no ticket"
        );
    }
}
