use std::sync::Arc;

use tokio::sync::oneshot;

use crate::frame::Frame;
use crate::server::client::subscription::Subscription;
use crate::server::client::Counters;
use crate::server::status::ServerStatus;

/// What the router keeps about a connected client.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    pub id: u64,
    pub peer: String,
    pub login: Option<String>,
    pub counters: Arc<Counters>,
}

/// Messages from connections (and the server handle) to the router.
#[derive(Debug)]
pub enum Request {
    /// Adds the subscription to its destination, or marks it ready for
    /// the next queue frame.
    Subscribe(Subscription),
    Unsubscribe(Subscription),
    /// A MESSAGE frame to route by its destination header.
    Enqueue(Frame),
    /// A delivered but unacknowledged frame going back to its queue.
    Requeue(Frame),
    Connected(ClientHandle),
    /// Answered once every earlier request from the connection is handled.
    Disconnected { id: u64, done: oneshot::Sender<()> },
    Status(oneshot::Sender<ServerStatus>),
}
