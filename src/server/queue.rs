use std::collections::{HashMap, VecDeque};

use crate::error::Result;
use crate::frame::Frame;
use crate::server::client::subscription::Subscription;
use crate::server::status::QueueStatus;

/// Where queued frames live between delivery attempts.
pub trait QueueStorage: Send {
    /// Appends `frame` to the back of `queue`.
    fn enqueue(&mut self, queue: &str, frame: Frame) -> Result<()>;

    /// Puts `frame` at the front of `queue`, ahead of everything waiting.
    fn requeue(&mut self, queue: &str, frame: Frame) -> Result<()>;

    /// Takes the frame at the front of `queue`, if any.
    fn dequeue(&mut self, queue: &str) -> Result<Option<Frame>>;

    /// Number of frames waiting in `queue`.
    fn message_count(&self, queue: &str) -> usize;

    /// Called once before the first frame is stored.
    fn start(&mut self) {}

    /// Called once when the router stops.
    fn stop(&mut self) {}
}

/// Keeps every queue in memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryQueueStorage {
    queues: HashMap<String, VecDeque<Frame>>,
}

impl MemoryQueueStorage {
    pub fn new() -> MemoryQueueStorage {
        MemoryQueueStorage::default()
    }
}

impl QueueStorage for MemoryQueueStorage {
    fn enqueue(&mut self, queue: &str, frame: Frame) -> Result<()> {
        self.queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(frame);
        Ok(())
    }

    fn requeue(&mut self, queue: &str, frame: Frame) -> Result<()> {
        self.queues
            .entry(queue.to_owned())
            .or_default()
            .push_front(frame);
        Ok(())
    }

    fn dequeue(&mut self, queue: &str) -> Result<Option<Frame>> {
        Ok(self.queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    fn message_count(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, VecDeque::len)
    }
}

/// One queue destination. Each frame goes to a single subscriber; a
/// subscriber is offered a new frame only after it reports itself ready.
#[derive(Debug)]
struct Queue {
    destination: String,
    members: Vec<Subscription>,
    ready: VecDeque<Subscription>,
    total_count: u64,
}

impl Queue {
    fn new(destination: &str) -> Queue {
        Queue {
            destination: destination.to_owned(),
            members: Vec::new(),
            ready: VecDeque::new(),
            total_count: 0,
        }
    }

    fn subscribe(&mut self, sub: Subscription, storage: &mut dyn QueueStorage) {
        match self.members.iter_mut().find(|member| member.same(&sub)) {
            Some(member) => *member = sub.clone(),
            None => self.members.push(sub.clone()),
        }
        self.ready.retain(|ready| !ready.same(&sub));
        self.ready.push_back(sub);
        self.dispatch(storage);
    }

    fn unsubscribe(&mut self, sub: &Subscription) {
        self.members.retain(|member| !member.same(sub));
        self.ready.retain(|ready| !ready.same(sub));
    }

    fn enqueue(&mut self, frame: Frame, storage: &mut dyn QueueStorage) {
        self.total_count += 1;
        if let Err(error) = storage.enqueue(&self.destination, frame) {
            error!("Could not store frame for {}: {}", self.destination, error);
            return;
        }
        self.dispatch(storage);
    }

    fn requeue(&mut self, frame: Frame, storage: &mut dyn QueueStorage) {
        if let Err(error) = storage.requeue(&self.destination, frame) {
            error!("Could not requeue frame for {}: {}", self.destination, error);
            return;
        }
        self.dispatch(storage);
    }

    /// Pairs ready subscribers with waiting frames until one side runs out.
    fn dispatch(&mut self, storage: &mut dyn QueueStorage) {
        while let Some(sub) = self.ready.pop_front() {
            let frame = match storage.dequeue(&self.destination) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.ready.push_front(sub);
                    return;
                }
                Err(error) => {
                    error!("Could not read from {}: {}", self.destination, error);
                    self.ready.push_front(sub);
                    return;
                }
            };
            if let Err(frame) = sub.send_queue_frame(frame) {
                debug!(
                    "Connection {} gone, dropping subscription {} from {}",
                    sub.conn_id(),
                    sub.id(),
                    self.destination
                );
                self.members.retain(|member| !member.same(&sub));
                if let Err(error) = storage.requeue(&self.destination, frame) {
                    error!("Could not requeue frame for {}: {}", self.destination, error);
                }
            }
        }
    }

    fn status(&self, storage: &dyn QueueStorage) -> QueueStatus {
        QueueStatus {
            destination: self.destination.clone(),
            message_count: storage.message_count(&self.destination),
            total_count: self.total_count,
            subscription_count: self.members.len(),
        }
    }
}

/// Finds queues by destination, creating them on first use.
pub struct Manager {
    storage: Box<dyn QueueStorage>,
    queues: HashMap<String, Queue>,
}

impl Manager {
    pub fn new(mut storage: Box<dyn QueueStorage>) -> Manager {
        storage.start();
        Manager {
            storage,
            queues: HashMap::new(),
        }
    }

    fn find(&mut self, destination: &str) -> &mut Queue {
        self.queues
            .entry(destination.to_owned())
            .or_insert_with(|| Queue::new(destination))
    }

    pub fn subscribe(&mut self, sub: Subscription) {
        let destination = sub.destination().to_owned();
        let queue = self
            .queues
            .entry(destination.clone())
            .or_insert_with(|| Queue::new(&destination));
        queue.subscribe(sub, self.storage.as_mut());
    }

    pub fn unsubscribe(&mut self, sub: &Subscription) {
        self.find(sub.destination()).unsubscribe(sub);
    }

    pub fn enqueue(&mut self, destination: &str, frame: Frame) {
        let queue = self
            .queues
            .entry(destination.to_owned())
            .or_insert_with(|| Queue::new(destination));
        queue.enqueue(frame, self.storage.as_mut());
    }

    pub fn requeue(&mut self, destination: &str, frame: Frame) {
        let queue = self
            .queues
            .entry(destination.to_owned())
            .or_insert_with(|| Queue::new(destination));
        queue.requeue(frame, self.storage.as_mut());
    }

    pub fn status(&self) -> Vec<QueueStatus> {
        let mut statuses: Vec<QueueStatus> = self
            .queues
            .values()
            .map(|queue| queue.status(self.storage.as_ref()))
            .collect();
        statuses.sort_by(|a, b| a.destination.cmp(&b.destination));
        statuses
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.storage.stop();
    }
}
