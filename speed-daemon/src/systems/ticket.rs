use std::{
    collections::{HashMap, HashSet, VecDeque},
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::message::ToClient;

use super::{Plate, Road};

// Mostly fed by the road workers; large enough that a slow dispatcher
// doesn't stall the record pipeline.
const SYSTEM_BUFFER_SIZE: usize = 1024;

const SECS_PER_DAY: u32 = 86400;

pub type DispatcherId = u64;
pub type DispatcherSender = mpsc::Sender<ToClient>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub plate: Plate,
    pub road: Road,
    pub mile1: u16,
    pub timestamp1: u32,
    pub mile2: u16,
    pub timestamp2: u32,
    /// Hundredths of a mile per hour, as on the wire.
    pub speed: u16,
}

impl Ticket {
    /// Day numbers this ticket spans, inclusive on both ends.
    fn spanned_days(&self) -> RangeInclusive<u32> {
        (self.timestamp1 / SECS_PER_DAY)..=(self.timestamp2 / SECS_PER_DAY)
    }
}

impl From<Ticket> for ToClient {
    fn from(ticket: Ticket) -> Self {
        Self::Ticket {
            plate: ticket.plate,
            road: ticket.road,
            mile1: ticket.mile1,
            timestamp1: ticket.timestamp1,
            mile2: ticket.mile2,
            timestamp2: ticket.timestamp2,
            speed: ticket.speed,
        }
    }
}

enum InternalMessage {
    SubmitTicket(Ticket),
    RegisterDispatcher(DispatcherId, Vec<Road>, DispatcherSender),
    DeregisterDispatcher(DispatcherId),
}

struct Registration {
    id: DispatcherId,
    sender: DispatcherSender,
}

pub struct System {
    dispatchers: HashMap<Road, Vec<Registration>>,
    issued_days: HashMap<Plate, HashSet<u32>>,
    sent: Vec<Ticket>,
    unsent: HashMap<Road, VecDeque<Ticket>>,
}

impl System {
    /// Starts the ticket system and returns a handle to it.
    ///
    /// note: must be called from inside a tokio runtime context
    pub fn start() -> Handler {
        let (tx, mut rx) = mpsc::channel(SYSTEM_BUFFER_SIZE);

        let mut this = Self {
            dispatchers: HashMap::default(),
            issued_days: HashMap::default(),
            sent: Vec::new(),
            unsent: HashMap::default(),
        };
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    InternalMessage::SubmitTicket(ticket) => this.attempt_issue(ticket),
                    InternalMessage::RegisterDispatcher(id, roads, sender) => {
                        this.register_dispatcher(id, roads, sender);
                    }
                    InternalMessage::DeregisterDispatcher(id) => this.deregister_dispatcher(id),
                }
            }
        });

        Handler {
            sender: tx,
            next_dispatcher_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn register_dispatcher(&mut self, id: DispatcherId, roads: Vec<Road>, sender: DispatcherSender) {
        for &road in &roads {
            let registrations = self.dispatchers.entry(road).or_default();
            if registrations.iter().any(|r| r.id == id) {
                continue;
            }

            registrations.push(Registration {
                id,
                sender: sender.clone(),
            });

            // A road gained a dispatcher; everything queued for it gets
            // another try (each ticket re-runs the per-day check).
            if let Some(queued) = self.unsent.remove(&road) {
                for ticket in queued {
                    self.attempt_issue(ticket);
                }
            }
        }
    }

    fn deregister_dispatcher(&mut self, id: DispatcherId) {
        for registrations in self.dispatchers.values_mut() {
            registrations.retain(|r| r.id != id);
        }
        self.dispatchers.retain(|_, registrations| !registrations.is_empty());
    }

    fn attempt_issue(&mut self, ticket: Ticket) {
        let days = ticket.spanned_days();

        // At most one delivered ticket per plate per day; a delivered
        // ticket consumes every day it spans.
        if let Some(issued) = self.issued_days.get(&ticket.plate) {
            if days.clone().any(|day| issued.contains(&day)) {
                debug!(plate = %ticket.plate, road = ticket.road, "dropping ticket, day already covered");
                return;
            }
        }

        // First registered dispatcher for the road, skipping handles
        // whose connection is gone or whose mailbox is full.
        let senders: Vec<DispatcherSender> = self
            .dispatchers
            .get(&ticket.road)
            .map(|registrations| registrations.iter().map(|r| r.sender.clone()).collect())
            .unwrap_or_default();

        for sender in senders {
            if sender.try_send(ticket.clone().into()).is_ok() {
                info!(
                    plate = %ticket.plate,
                    road = ticket.road,
                    speed = ticket.speed,
                    total_sent = self.sent.len() + 1,
                    "ticket issued"
                );
                self.issued_days
                    .entry(ticket.plate.clone())
                    .or_default()
                    .extend(days);
                self.sent.push(ticket);
                return;
            }
        }

        // No dispatcher reachable. Queue without consuming any days:
        // the check re-runs when the queue drains.
        debug!(plate = %ticket.plate, road = ticket.road, "no dispatcher, ticket queued");
        self.unsent
            .entry(ticket.road)
            .or_default()
            .push_back(ticket);
    }
}

#[derive(Debug, Clone)]
pub struct Handler {
    sender: mpsc::Sender<InternalMessage>,
    next_dispatcher_id: Arc<AtomicU64>,
}

impl Handler {
    pub async fn submit_ticket(&self, ticket: Ticket) {
        self.sender
            .send(InternalMessage::SubmitTicket(ticket))
            .await
            .expect("the system should live as long as the handler does");
    }

    /// Registers a dispatcher for its roads and returns the id used to
    /// deregister it on disconnect.
    pub async fn register_dispatcher(
        &self,
        roads: Vec<Road>,
        sender: DispatcherSender,
    ) -> DispatcherId {
        let id = self.next_dispatcher_id.fetch_add(1, Ordering::Relaxed);
        self.sender
            .send(InternalMessage::RegisterDispatcher(id, roads, sender))
            .await
            .expect("the system should live as long as the handler does");

        id
    }

    pub async fn deregister_dispatcher(&self, id: DispatcherId) {
        self.sender
            .send(InternalMessage::DeregisterDispatcher(id))
            .await
            .expect("the system should live as long as the handler does");
    }
}
