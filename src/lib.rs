#![crate_name = "stompbox"]
#![crate_type = "lib"]

#[macro_use]
extern crate log;

#[macro_use]
pub mod header;
pub mod backoff;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod message_builder;
pub mod option_setter;
pub mod server;
mod session_manager;
pub mod session_builder;
pub mod subscription;
pub mod subscription_builder;
pub mod transaction;

pub use crate::connection::{Connection, Credentials, Transport};
pub use crate::error::{Error, Result};
pub use crate::frame::{Command, Frame};
pub use crate::header::{ContentType, Header, HeaderList, HeartBeat, StompVersion, SuppressedHeader};
pub use crate::message_builder::WithReceipt;
pub use crate::session_builder::{BackoffUnit, ConnectTimeout, HeartBeatError, RetryLimit, SessionBuilder, SessionConfig};
pub use crate::subscription::{AckMode, AckOrNack, Message, Subscription};
pub use crate::transaction::Transaction;
