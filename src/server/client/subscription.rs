use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::frame::Frame;
use crate::server::client::Counters;
use crate::subscription::AckMode;

/// A queue frame handed to one subscription of a connection.
#[derive(Debug)]
pub struct QueueDelivery {
    pub subscription: Subscription,
    pub frame: Frame,
}

/// A client subscription as the router sees it: a destination plus the
/// channels leading back to the owning connection.
#[derive(Clone, Debug)]
pub struct Subscription {
    id: String,
    destination: String,
    ack_mode: AckMode,
    conn_id: u64,
    serial: u64,
    topic: mpsc::Sender<Frame>,
    queue: mpsc::UnboundedSender<QueueDelivery>,
    counters: Arc<Counters>,
}

impl Subscription {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: &str,
        destination: &str,
        ack_mode: AckMode,
        conn_id: u64,
        serial: u64,
        topic: mpsc::Sender<Frame>,
        queue: mpsc::UnboundedSender<QueueDelivery>,
        counters: Arc<Counters>,
    ) -> Subscription {
        Subscription {
            id: id.to_owned(),
            destination: destination.to_owned(),
            ack_mode,
            conn_id,
            serial,
            topic,
            queue,
            counters,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Distinguishes a subscription from an earlier one that reused its id.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Same connection and same subscription id.
    pub fn same(&self, other: &Subscription) -> bool {
        self.conn_id == other.conn_id && self.id == other.id
    }

    /// Offers a topic frame without waiting. A saturated connection loses
    /// the frame and counts a skipped write.
    pub fn send_topic_frame(&self, mut frame: Frame) -> bool {
        frame.headers.set("subscription", &self.id);
        match self.topic.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.skipped_writes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "[{}] write channel full, dropped frame for {}",
                    self.conn_id, self.destination
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Hands a queue frame to the connection. The frame comes back if the
    /// connection is gone.
    pub fn send_queue_frame(&self, mut frame: Frame) -> Result<(), Frame> {
        frame.headers.set("subscription", &self.id);
        let delivery = QueueDelivery {
            subscription: self.clone(),
            frame,
        };
        self.queue
            .send(delivery)
            .map_err(|mpsc::error::SendError(delivery)| delivery.frame)
    }
}

/// A frame written to the client and not yet acknowledged.
#[derive(Debug)]
pub struct Pending {
    pub subscription: Subscription,
    pub message_id: u64,
    pub frame: Frame,
}

impl Pending {
    fn is_acked_by(&self, message_id: u64) -> bool {
        match self.subscription.ack_mode() {
            AckMode::Auto => true,
            AckMode::Client => self.message_id <= message_id,
            AckMode::ClientIndividual => self.message_id == message_id,
        }
    }
}

/// Subscriptions holding an unacknowledged frame, oldest first.
#[derive(Debug, Default)]
pub struct SubscriptionList {
    pending: VecDeque<Pending>,
}

impl SubscriptionList {
    pub fn new() -> SubscriptionList {
        SubscriptionList::default()
    }

    pub fn add(&mut self, pending: Pending) {
        self.pending.push_back(pending);
    }

    /// Takes the oldest entry.
    pub fn get(&mut self) -> Option<Pending> {
        self.pending.pop_front()
    }

    /// Takes every entry held by subscription `id`.
    pub fn remove(&mut self, id: &str) -> Vec<Pending> {
        self.take_where(|pending| pending.subscription.id() == id)
    }

    /// Takes the entries acknowledged by `message_id`: the exact message for
    /// `client-individual`, that message and every earlier one for `client`.
    pub fn ack(&mut self, message_id: u64) -> Vec<Pending> {
        self.take_where(|pending| pending.is_acked_by(message_id))
    }

    /// Takes the entry for exactly `message_id`.
    pub fn nack(&mut self, message_id: u64) -> Option<Pending> {
        let position = self
            .pending
            .iter()
            .position(|pending| pending.message_id == message_id)?;
        self.pending.remove(position)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take_where<F>(&mut self, test: F) -> Vec<Pending>
    where
        F: Fn(&Pending) -> bool,
    {
        let (taken, kept): (Vec<Pending>, Vec<Pending>) =
            self.pending.drain(..).partition(|pending| test(pending));
        self.pending = kept.into();
        taken
    }
}
