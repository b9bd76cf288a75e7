//! A small STOMP broker. Destinations starting with [`QUEUE_PREFIX`] are
//! queues: each message goes to the next ready subscriber. Every other
//! destination is a topic: each message goes to all current subscribers.

pub mod client;
pub mod config;
mod processor;
pub mod queue;
pub mod status;
mod topic;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;

use crate::error::{Error, Result};

pub use self::config::{Config, ServerConfig};
pub use self::queue::{MemoryQueueStorage, QueueStorage};
pub use self::status::ServerStatus;

use self::client::request::Request;
use self::config::Settings;
use self::processor::RequestProcessor;

pub const QUEUE_PREFIX: &str = "/queue";

pub const DEFAULT_ADDR: &str = "0.0.0.0:61613";

/// Heart-beat floor used when none is configured.
pub const DEFAULT_HEART_BEAT: Duration = Duration::from_secs(60);

/// Value of the `server` header in CONNECTED frames.
pub const SERVER_NAME: &str = concat!("stompbox/", env!("CARGO_PKG_VERSION"));

const MAX_ACCEPT_DELAY: Duration = Duration::from_secs(5);

pub trait Authenticator: Send + Sync {
    /// True if the client may connect. Either value may be empty when the
    /// CONNECT frame did not carry it.
    fn authenticate(&self, login: &str, passcode: &str) -> bool;
}

/// Accepts the logins it was given, each with exactly one passcode.
#[derive(Clone, Debug, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new() -> StaticAuthenticator {
        StaticAuthenticator::default()
    }

    pub fn with_user(mut self, login: &str, passcode: &str) -> StaticAuthenticator {
        self.users.insert(login.to_owned(), passcode.to_owned());
        self
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, login: &str, passcode: &str) -> bool {
        self.users
            .get(login)
            .map_or(false, |expected| expected == passcode)
    }
}

pub struct Server {
    config: ServerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    queue_storage: Option<Box<dyn QueueStorage>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        Server {
            config,
            authenticator: None,
            queue_storage: None,
        }
    }

    /// Without an authenticator every client is let in.
    pub fn with_authenticator<A: Authenticator + 'static>(mut self, authenticator: A) -> Server {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Replaces the in-memory queue storage.
    pub fn with_queue_storage<S: QueueStorage + 'static>(mut self, storage: S) -> Server {
        self.queue_storage = Some(Box::new(storage));
        self
    }

    /// Binds the configured address and serves.
    pub async fn listen_and_serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.address).await?;
        info!("Listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.start(listener)?.wait().await
    }

    /// Starts the router and the accept loop in the background.
    pub fn start(self, listener: TcpListener) -> Result<ServerHandle> {
        let local_addr = listener.local_addr()?;
        let settings: Arc<dyn Config> = Arc::new(Settings::new(self.config, self.authenticator));
        let storage = self
            .queue_storage
            .unwrap_or_else(|| Box::new(MemoryQueueStorage::new()));

        let (requests, requests_rx) = mpsc::channel(settings.max_pending_writes() * 16);
        let router = tokio::spawn(RequestProcessor::new(requests_rx, storage).run());
        let accept = tokio::spawn(accept_loop(listener, settings, requests.clone()));
        Ok(ServerHandle {
            local_addr,
            requests,
            accept,
            router,
        })
    }
}

/// Hands every accepted socket to its own connection task. Failed accepts
/// are retried after a pause that doubles from 5 ms up to 5 s.
async fn accept_loop(
    listener: TcpListener,
    config: Arc<dyn Config>,
    router: mpsc::Sender<Request>,
) -> Result<()> {
    let mut next_id: u64 = 0;
    let mut delay = Duration::ZERO;
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                delay = if delay.is_zero() {
                    Duration::from_millis(5)
                } else {
                    (delay * 2).min(MAX_ACCEPT_DELAY)
                };
                error!("Accept error: {}; retrying in {:?}", error, delay);
                sleep(delay).await;
                continue;
            }
        };
        delay = Duration::ZERO;

        let id = next_id;
        next_id += 1;
        debug!("[{}] accepted {}", id, peer);
        if let Err(error) = stream.set_nodelay(true) {
            warn!("[{}] could not set TCP_NODELAY: {}", id, error);
        }
        tokio::spawn(client::serve_connection(
            Box::new(stream),
            id,
            peer.to_string(),
            config.clone(),
            router.clone(),
        ));
    }
}

/// A running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    requests: mpsc::Sender<Request>,
    accept: JoinHandle<Result<()>>,
    router: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Asks the router for a snapshot of clients, queues and topics.
    pub async fn status(&self) -> Result<ServerStatus> {
        let (reply, status) = oneshot::channel();
        self.requests
            .send(Request::Status(reply))
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        status.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Stops accepting, then waits until every open connection has closed
    /// and the router has stopped.
    pub async fn shutdown(self) -> Result<()> {
        self.accept.abort();
        self.wait().await
    }

    /// Waits for the accept loop to end, then for the router, which stops
    /// once the last connection is gone.
    pub async fn wait(self) -> Result<()> {
        let ServerHandle {
            requests,
            accept,
            router,
            ..
        } = self;
        drop(requests);
        let accepted = match accept.await {
            Ok(result) => result,
            Err(error) if error.is_cancelled() => Ok(()),
            Err(error) => Err(join_error(error)),
        };
        router.await.map_err(join_error)?;
        debug!("Server stopped");
        accepted
    }
}

fn join_error(error: JoinError) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::Other, error))
}
