use std::collections::HashMap;

use crate::frame::Frame;
use crate::server::client::subscription::Subscription;
use crate::server::status::TopicStatus;

/// A fan-out destination: every current subscriber gets every frame.
#[derive(Debug)]
struct Topic {
    destination: String,
    subscriptions: Vec<Subscription>,
    total_count: u64,
}

impl Topic {
    fn new(destination: &str) -> Topic {
        Topic {
            destination: destination.to_owned(),
            subscriptions: Vec::new(),
            total_count: 0,
        }
    }

    fn subscribe(&mut self, sub: Subscription) {
        match self.subscriptions.iter_mut().find(|s| s.same(&sub)) {
            Some(existing) => *existing = sub,
            None => self.subscriptions.push(sub),
        }
    }

    fn unsubscribe(&mut self, sub: &Subscription) {
        self.subscriptions.retain(|s| !s.same(sub));
    }

    fn enqueue(&mut self, frame: Frame) {
        self.total_count += 1;
        for sub in &self.subscriptions {
            sub.send_topic_frame(frame.clone());
        }
    }

    fn status(&self) -> TopicStatus {
        TopicStatus {
            destination: self.destination.clone(),
            total_count: self.total_count,
            subscription_count: self.subscriptions.len(),
        }
    }
}

/// Finds topics by destination, creating them on first use.
#[derive(Debug, Default)]
pub struct Manager {
    topics: HashMap<String, Topic>,
}

impl Manager {
    pub fn new() -> Manager {
        Manager::default()
    }

    fn find(&mut self, destination: &str) -> &mut Topic {
        self.topics
            .entry(destination.to_owned())
            .or_insert_with(|| Topic::new(destination))
    }

    pub fn subscribe(&mut self, sub: Subscription) {
        let destination = sub.destination().to_owned();
        self.find(&destination).subscribe(sub);
    }

    pub fn unsubscribe(&mut self, sub: &Subscription) {
        self.find(sub.destination()).unsubscribe(sub);
    }

    pub fn enqueue(&mut self, destination: &str, frame: Frame) {
        self.find(destination).enqueue(frame);
    }

    pub fn status(&self) -> Vec<TopicStatus> {
        let mut statuses: Vec<TopicStatus> = self.topics.values().map(Topic::status).collect();
        statuses.sort_by(|a, b| a.destination.cmp(&b.destination));
        statuses
    }
}
