use crate::connection::Connection;
use crate::error::Result;
use crate::frame::{Command, Frame};
use crate::header::{Header, HeaderList};
use crate::option_setter::OptionSetter;
use crate::subscription::{AckMode, Subscription};

pub struct SubscriptionBuilder<'a> {
    pub connection: &'a Connection,
    pub destination: String,
    pub ack_mode: AckMode,
    pub headers: HeaderList,
}

impl<'a> SubscriptionBuilder<'a> {
    pub fn new(connection: &'a Connection, destination: &str) -> SubscriptionBuilder<'a> {
        SubscriptionBuilder {
            connection,
            destination: destination.to_owned(),
            ack_mode: AckMode::Auto,
            headers: HeaderList::new(),
        }
    }

    /// Builds the SUBSCRIBE frame. An `id` header supplied as an option is
    /// kept; otherwise a fresh id is allocated.
    pub fn frame(&mut self) -> Frame {
        let mut subscribe_frame = Frame::with_headers(
            Command::Subscribe,
            header_list![
                "destination" => &self.destination,
                "ack" => self.ack_mode.as_text()
            ],
        );
        subscribe_frame.headers.concat(&mut self.headers);
        if !subscribe_frame.headers.contains("id") {
            let id = self.connection.next_subscription_id();
            subscribe_frame.headers.push(Header::new("id", &id));
        }
        subscribe_frame
    }

    pub async fn start(mut self) -> Result<Subscription> {
        let subscribe_frame = self.frame();
        debug!(
            "Subscribing to '{}' with id '{}'",
            self.destination,
            subscribe_frame.headers.get("id").unwrap_or_default()
        );
        self.connection
            .subscribe_frame(subscribe_frame, self.destination, self.ack_mode)
            .await
    }

    pub fn with<T>(self, option_setter: T) -> SubscriptionBuilder<'a>
    where
        T: OptionSetter<SubscriptionBuilder<'a>>,
    {
        option_setter.set_option(self)
    }
}
