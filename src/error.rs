use std::io;

use thiserror::Error;

use crate::frame::{Command, Frame};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the client engine, the broker and the frame codec.
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    #[error("connection already closed")]
    AlreadyClosed,

    #[error("read timeout")]
    ReadTimeout,

    /// The peer answered with an ERROR frame, or a local failure was
    /// reported to a caller in the shape of one.
    #[error("{message}")]
    ErrorFrame { message: String, frame: Box<Frame> },

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid heart-beat: {0:?}")]
    InvalidHeartBeat(String),

    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("unexpected command: {0}")]
    UnexpectedCommand(Command),

    #[error("expected CONNECT or STOMP frame")]
    NotConnected,

    #[error("receipt not permitted on CONNECT frame")]
    ReceiptInConnect,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("NACK not supported in STOMP 1.0")]
    NackNotSupported,

    #[error("cannot send NACK for a subscription with ack:auto")]
    CannotNackAutoSubscription,

    #[error("cannot ack/nack a message not received by this connection")]
    NotReceivedMessage,

    #[error("subscription has been unsubscribed")]
    CompletedSubscription,

    #[error("subscription already exists: {0}")]
    SubscriptionExists(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("transaction already in progress: {0}")]
    TransactionInProgress(String),

    #[error("unknown transaction: {0}")]
    TransactionUnknown(String),
}

impl Error {
    /// Builds the error a caller sees when `frame` is an ERROR frame.
    pub fn from_error_frame(frame: Frame) -> Error {
        let message = frame
            .headers
            .get("message")
            .unwrap_or("ERROR frame received")
            .to_owned();
        Error::ErrorFrame {
            message,
            frame: Box::new(frame),
        }
    }

    /// Errors that mean the transport itself is gone.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::AlreadyClosed | Error::ReadTimeout
        )
    }
}
