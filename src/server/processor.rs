use std::collections::HashMap;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use crate::frame::Frame;
use crate::server::client::request::{ClientHandle, Request};
use crate::server::client::subscription::Subscription;
use crate::server::queue::{self, QueueStorage};
use crate::server::status::{ClientStatus, ServerStatus, SubscriptionStatus};
use crate::server::{topic, QUEUE_PREFIX};

pub(crate) fn is_queue_destination(destination: &str) -> bool {
    destination.starts_with(QUEUE_PREFIX)
}

struct Client {
    handle: ClientHandle,
    subscriptions: Vec<SubscriptionStatus>,
}

/// The router. Destination membership, queue contents and the registry
/// of connected clients belong to this task alone.
pub(crate) struct RequestProcessor {
    requests: mpsc::Receiver<Request>,
    topics: topic::Manager,
    queues: queue::Manager,
    clients: HashMap<u64, Client>,
    enqueue_count: u64,
    requeue_count: u64,
    connect_count: u64,
    disconnect_count: u64,
}

impl RequestProcessor {
    pub(crate) fn new(
        requests: mpsc::Receiver<Request>,
        storage: Box<dyn QueueStorage>,
    ) -> RequestProcessor {
        RequestProcessor {
            requests,
            topics: topic::Manager::new(),
            queues: queue::Manager::new(storage),
            clients: HashMap::new(),
            enqueue_count: 0,
            requeue_count: 0,
            connect_count: 0,
            disconnect_count: 0,
        }
    }

    /// Handles requests until every sender is gone.
    pub(crate) async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            self.handle(request);
        }
        debug!("Router stopped");
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Subscribe(sub) => self.subscribe(sub),
            Request::Unsubscribe(sub) => self.unsubscribe(sub),
            Request::Enqueue(frame) => {
                let destination = match destination_of(&frame) {
                    Some(destination) => destination,
                    None => return,
                };
                self.enqueue_count += 1;
                if is_queue_destination(&destination) {
                    self.queues.enqueue(&destination, frame);
                } else {
                    self.topics.enqueue(&destination, frame);
                }
            }
            Request::Requeue(frame) => {
                let destination = match destination_of(&frame) {
                    Some(destination) => destination,
                    None => return,
                };
                if is_queue_destination(&destination) {
                    self.requeue_count += 1;
                    self.queues.requeue(&destination, frame);
                } else {
                    debug!("Not requeueing topic frame for {}", destination);
                }
            }
            Request::Connected(handle) => {
                self.connect_count += 1;
                info!("[{}] {} connected", handle.id, handle.peer);
                self.clients.insert(
                    handle.id,
                    Client {
                        handle,
                        subscriptions: Vec::new(),
                    },
                );
            }
            Request::Disconnected { id, done } => {
                if let Some(client) = self.clients.remove(&id) {
                    self.disconnect_count += 1;
                    info!("[{}] {} disconnected", id, client.handle.peer);
                }
                let _ = done.send(());
            }
            Request::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn subscribe(&mut self, sub: Subscription) {
        if let Some(client) = self.clients.get_mut(&sub.conn_id()) {
            if !client.subscriptions.iter().any(|s| s.id == sub.id()) {
                client.subscriptions.push(SubscriptionStatus {
                    id: sub.id().to_owned(),
                    destination: sub.destination().to_owned(),
                });
            }
        }
        if is_queue_destination(sub.destination()) {
            self.queues.subscribe(sub);
        } else {
            self.topics.subscribe(sub);
        }
    }

    fn unsubscribe(&mut self, sub: Subscription) {
        if let Some(client) = self.clients.get_mut(&sub.conn_id()) {
            client.subscriptions.retain(|s| s.id != sub.id());
        }
        if is_queue_destination(sub.destination()) {
            self.queues.unsubscribe(&sub);
        } else {
            self.topics.unsubscribe(&sub);
        }
    }

    fn status(&self) -> ServerStatus {
        let mut clients: Vec<ClientStatus> = self
            .clients
            .values()
            .map(|client| {
                let counters = &client.handle.counters;
                ClientStatus {
                    id: client.handle.id,
                    peer: client.handle.peer.clone(),
                    login: client.handle.login.clone(),
                    sent_frames: counters.sent_frames.load(Ordering::Relaxed),
                    received_frames: counters.received_frames.load(Ordering::Relaxed),
                    skipped_writes: counters.skipped_writes.load(Ordering::Relaxed),
                    subscriptions: client.subscriptions.clone(),
                }
            })
            .collect();
        clients.sort_by_key(|client| client.id);

        let queues = self.queues.status();
        let topics = self.topics.status();
        ServerStatus {
            total_queue_count: queues.iter().map(|q| q.message_count).sum(),
            total_skipped_writes: clients.iter().map(|c| c.skipped_writes).sum(),
            clients,
            queues,
            topics,
            enqueue_count: self.enqueue_count,
            requeue_count: self.requeue_count,
            connect_count: self.connect_count,
            disconnect_count: self.disconnect_count,
        }
    }
}

fn destination_of(frame: &Frame) -> Option<String> {
    let destination = frame.headers.get("destination").map(str::to_owned);
    if destination.is_none() {
        error!("Dropping {} frame without a destination", frame.command);
    }
    destination
}
