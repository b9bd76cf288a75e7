/// A subscription held by a connected client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub id: String,
    pub destination: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientStatus {
    pub id: u64,
    pub peer: String,
    pub login: Option<String>,
    pub sent_frames: u64,
    pub received_frames: u64,
    pub skipped_writes: u64,
    pub subscriptions: Vec<SubscriptionStatus>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    pub destination: String,
    /// Frames waiting in storage.
    pub message_count: usize,
    /// Frames enqueued since the queue was created.
    pub total_count: u64,
    pub subscription_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicStatus {
    pub destination: String,
    pub total_count: u64,
    pub subscription_count: usize,
}

/// A point-in-time view of the router.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerStatus {
    pub clients: Vec<ClientStatus>,
    pub queues: Vec<QueueStatus>,
    pub topics: Vec<TopicStatus>,
    pub enqueue_count: u64,
    pub requeue_count: u64,
    pub connect_count: u64,
    pub disconnect_count: u64,
    pub total_queue_count: usize,
    pub total_skipped_writes: u64,
}

impl ServerStatus {
    pub fn queue(&self, destination: &str) -> Option<&QueueStatus> {
        self.queues.iter().find(|q| q.destination == destination)
    }

    pub fn topic(&self, destination: &str) -> Option<&TopicStatus> {
        self.topics.iter().find(|t| t.destination == destination)
    }
}
