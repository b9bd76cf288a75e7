use std::time::Duration;

use crate::backoff::DEFAULT_RETRY_LIMIT;
use crate::connection::{Connection, OwnedCredentials, Transport, DEFAULT_HEART_BEAT_ERROR};
use crate::error::Result;
use crate::frame::{Command, Frame};
use crate::header::{Header, HeaderList, HeartBeat, StompVersion};
use crate::option_setter::OptionSetter;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything needed to open, and reopen, a client session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Overrides the `host` header otherwise taken from the dialed peer.
    pub host: Option<String>,
    pub credentials: Option<OwnedCredentials>,
    pub heartbeat: HeartBeat,
    /// Slack added to the read timeout and taken off the write timeout.
    pub heart_beat_error: Duration,
    pub headers: HeaderList,
    pub suppressed_headers: Vec<String>,
    pub retry_limit: u32,
    pub backoff_unit: Duration,
    /// How long to wait for the answer to CONNECT.
    pub connect_timeout: Duration,
    pub request_capacity: usize,
    pub read_capacity: usize,
    pub subscription_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            host: None,
            credentials: None,
            heartbeat: HeartBeat(0, 0),
            heart_beat_error: DEFAULT_HEART_BEAT_ERROR,
            headers: HeaderList::new(),
            suppressed_headers: Vec::new(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            backoff_unit: Duration::from_secs(1),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_capacity: 8,
            read_capacity: 8,
            subscription_capacity: 16,
        }
    }
}

impl SessionConfig {
    /// The CONNECT frame for this configuration. `dialed_host` is the peer
    /// address the transport was opened to, if known.
    pub fn connect_frame(&self, dialed_host: Option<&str>) -> Frame {
        let host = self
            .host
            .as_deref()
            .or(dialed_host)
            .unwrap_or("default");
        let mut frame = Frame::with_headers(
            Command::Connect,
            header_list![
                "accept-version" => &StompVersion::accept_version_header(),
                "host" => host
            ],
        );
        if let Some(ref credentials) = self.credentials {
            frame.headers.push(Header::new("login", &credentials.login));
            frame.headers.push(Header::new("passcode", &credentials.passcode));
        }
        frame
            .headers
            .push(Header::new("heart-beat", &self.heartbeat.to_string()));
        for header in self.headers.iter() {
            frame.headers.set(header.get_key(), header.get_value());
        }
        for key in &self.suppressed_headers {
            frame.headers.remove(key);
        }
        frame
    }
}

pub struct HeartBeatError(pub Duration);
pub struct RetryLimit(pub u32);
pub struct BackoffUnit(pub Duration);
pub struct ConnectTimeout(pub Duration);

#[derive(Default)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> SessionBuilder {
        SessionBuilder::default()
    }

    pub fn with<T>(self, option_setter: T) -> SessionBuilder
    where
        T: OptionSetter<SessionBuilder>,
    {
        option_setter.set_option(self)
    }

    /// Opens a TCP connection to `address`, retrying with backoff, and
    /// performs the STOMP handshake.
    pub async fn dial(self, address: &str) -> Result<Connection> {
        Connection::dial(address, self.config).await
    }

    /// Performs the STOMP handshake over an already open transport.
    pub async fn connect<T: Transport>(self, transport: T) -> Result<Connection> {
        Connection::connect(transport, self.config).await
    }
}
