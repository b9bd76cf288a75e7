use crate::connection::Connection;
use crate::error::Result;
use crate::frame::Frame;
use crate::option_setter::OptionSetter;

/// Asks the broker to confirm the frame with a RECEIPT; `send()` then
/// waits for it.
pub struct WithReceipt;

pub struct MessageBuilder<'a> {
    pub connection: &'a Connection,
    pub frame: Frame,
}

impl<'a> MessageBuilder<'a> {
    pub fn new(connection: &'a Connection, frame: Frame) -> MessageBuilder<'a> {
        MessageBuilder { connection, frame }
    }

    pub async fn send(self) -> Result<()> {
        self.connection.send_frame(self.frame).await
    }

    pub fn with<T>(self, option_setter: T) -> MessageBuilder<'a>
    where
        T: OptionSetter<MessageBuilder<'a>>,
    {
        option_setter.set_option(self)
    }
}
