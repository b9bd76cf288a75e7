use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::frame::{Frame, ToFrameBody};
use crate::header::Header;
use crate::message_builder::MessageBuilder;
use crate::subscription::{AckOrNack, Message};

/// A client transaction. Frames sent through it carry its id until it is
/// committed or aborted; after that it refuses further use.
pub struct Transaction {
    pub id: String,
    connection: Connection,
    completed: bool,
}

impl Transaction {
    pub(crate) async fn begin(connection: Connection) -> Result<Transaction> {
        let id = connection.next_transaction_id();
        connection.send_frame(Frame::begin(&id)).await?;
        debug!("Began transaction {}", id);
        Ok(Transaction {
            id,
            connection,
            completed: false,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.completed {
            return Err(Error::TransactionUnknown(self.id.clone()));
        }
        Ok(())
    }

    /// A SEND builder whose frame is already part of this transaction.
    pub fn message<T: ToFrameBody>(&self, destination: &str, body: T) -> Result<MessageBuilder<'_>> {
        self.check_open()?;
        let mut send_frame = Frame::send(destination, body.to_frame_body());
        send_frame
            .headers
            .push(Header::new("transaction", self.id.as_ref()));
        Ok(MessageBuilder::new(&self.connection, send_frame))
    }

    pub async fn send(&self, mut frame: Frame) -> Result<()> {
        self.check_open()?;
        frame.headers.set("transaction", &self.id);
        self.connection.send_frame(frame).await
    }

    pub async fn ack(&self, message: &Message) -> Result<()> {
        self.check_open()?;
        self.connection
            .acknowledge(message, AckOrNack::Ack, Some(&self.id))
            .await
    }

    pub async fn nack(&self, message: &Message) -> Result<()> {
        self.check_open()?;
        self.connection
            .acknowledge(message, AckOrNack::Nack, Some(&self.id))
            .await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.completed = true;
        self.connection.send_frame(Frame::commit(&self.id)).await
    }

    pub async fn abort(&mut self) -> Result<()> {
        self.check_open()?;
        self.completed = true;
        self.connection.send_frame(Frame::abort(&self.id)).await
    }
}
