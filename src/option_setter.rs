use crate::connection::{Credentials, OwnedCredentials};
use crate::header::{ContentType, Header, HeartBeat, Host, SuppressedHeader};
use crate::message_builder::{MessageBuilder, WithReceipt};
use crate::session_builder::{BackoffUnit, ConnectTimeout, HeartBeatError, RetryLimit, SessionBuilder};
use crate::subscription::AckMode;
use crate::subscription_builder::SubscriptionBuilder;

pub trait OptionSetter<T> {
    fn set_option(self, _: T) -> T;
}

impl<'a> OptionSetter<MessageBuilder<'a>> for Header {
    fn set_option(self, mut builder: MessageBuilder<'a>) -> MessageBuilder<'a> {
        builder.frame.headers.push(self);
        builder
    }
}

impl<'a, 'b> OptionSetter<MessageBuilder<'a>> for SuppressedHeader<'b> {
    fn set_option(self, mut builder: MessageBuilder<'a>) -> MessageBuilder<'a> {
        let SuppressedHeader(key) = self;
        builder.frame.headers.retain(|header| (*header).get_key() != key);
        builder
    }
}

impl<'a, 'b> OptionSetter<MessageBuilder<'a>> for ContentType<'b> {
    fn set_option(self, mut builder: MessageBuilder<'a>) -> MessageBuilder<'a> {
        let ContentType(content_type) = self;
        builder.frame.headers.set("content-type", content_type);
        builder
    }
}

impl<'a> OptionSetter<MessageBuilder<'a>> for WithReceipt {
    fn set_option(self, mut builder: MessageBuilder<'a>) -> MessageBuilder<'a> {
        let receipt_id = builder.connection.next_receipt_id();
        builder.frame.headers.set("receipt", &receipt_id);
        builder
    }
}

impl OptionSetter<SessionBuilder> for Header {
    fn set_option(self, mut builder: SessionBuilder) -> SessionBuilder {
        builder.config.headers.push(self);
        builder
    }
}

impl OptionSetter<SessionBuilder> for HeartBeat {
    fn set_option(self, mut builder: SessionBuilder) -> SessionBuilder {
        builder.config.heartbeat = self;
        builder
    }
}

impl<'b> OptionSetter<SessionBuilder> for Credentials<'b> {
    fn set_option(self, mut builder: SessionBuilder) -> SessionBuilder {
        builder.config.credentials = Some(OwnedCredentials::from(self));
        builder
    }
}

impl<'b> OptionSetter<SessionBuilder> for Host<'b> {
    fn set_option(self, mut builder: SessionBuilder) -> SessionBuilder {
        let Host(host) = self;
        builder.config.host = Some(host.to_owned());
        builder
    }
}

impl<'b> OptionSetter<SessionBuilder> for SuppressedHeader<'b> {
    fn set_option(self, mut builder: SessionBuilder) -> SessionBuilder {
        let SuppressedHeader(key) = self;
        builder.config.headers.retain(|header| (*header).get_key() != key);
        builder.config.suppressed_headers.push(key.to_owned());
        builder
    }
}

impl OptionSetter<SessionBuilder> for HeartBeatError {
    fn set_option(self, mut builder: SessionBuilder) -> SessionBuilder {
        builder.config.heart_beat_error = self.0;
        builder
    }
}

impl OptionSetter<SessionBuilder> for RetryLimit {
    fn set_option(self, mut builder: SessionBuilder) -> SessionBuilder {
        builder.config.retry_limit = self.0;
        builder
    }
}

impl OptionSetter<SessionBuilder> for BackoffUnit {
    fn set_option(self, mut builder: SessionBuilder) -> SessionBuilder {
        builder.config.backoff_unit = self.0;
        builder
    }
}

impl OptionSetter<SessionBuilder> for ConnectTimeout {
    fn set_option(self, mut builder: SessionBuilder) -> SessionBuilder {
        builder.config.connect_timeout = self.0;
        builder
    }
}

impl<'a> OptionSetter<SubscriptionBuilder<'a>> for Header {
    fn set_option(self, mut builder: SubscriptionBuilder<'a>) -> SubscriptionBuilder<'a> {
        builder.headers.push(self);
        builder
    }
}

impl<'a, 'b> OptionSetter<SubscriptionBuilder<'a>> for SuppressedHeader<'b> {
    fn set_option(self, mut builder: SubscriptionBuilder<'a>) -> SubscriptionBuilder<'a> {
        let SuppressedHeader(key) = self;
        builder.headers.retain(|header| (*header).get_key() != key);
        builder
    }
}

impl<'a> OptionSetter<SubscriptionBuilder<'a>> for AckMode {
    fn set_option(self, mut builder: SubscriptionBuilder<'a>) -> SubscriptionBuilder<'a> {
        builder.ack_mode = self;
        builder
    }
}

impl<'a> OptionSetter<SubscriptionBuilder<'a>> for WithReceipt {
    fn set_option(self, mut builder: SubscriptionBuilder<'a>) -> SubscriptionBuilder<'a> {
        let receipt_id = builder.connection.next_receipt_id();
        builder.headers.set("receipt", &receipt_id);
        builder
    }
}
