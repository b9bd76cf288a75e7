use std::sync::Arc;
use std::time::Duration;

use crate::server::{Authenticator, DEFAULT_ADDR, DEFAULT_HEART_BEAT};

const DEFAULT_MAX_PENDING: usize = 16;

/// What a server connection needs to know about the server it belongs to.
pub trait Config: Send + Sync {
    /// True if `login`/`passcode` may connect.
    fn authenticate(&self, login: &str, passcode: &str) -> bool;

    /// Smallest non-zero heart-beat interval a client may ask for.
    fn heart_beat(&self) -> Duration;

    /// Enables per-frame debug logging.
    fn is_debug(&self) -> bool;

    /// Frames read ahead of the connection's decision loop.
    fn max_pending_reads(&self) -> usize;

    /// Topic frames queued for a client before further ones are dropped.
    fn max_pending_writes(&self) -> usize;
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub address: String,
    pub heart_beat: Duration,
    pub debug: bool,
    pub max_pending_reads: usize,
    pub max_pending_writes: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            address: DEFAULT_ADDR.to_owned(),
            heart_beat: DEFAULT_HEART_BEAT,
            debug: false,
            max_pending_reads: DEFAULT_MAX_PENDING,
            max_pending_writes: DEFAULT_MAX_PENDING,
        }
    }
}

/// A `ServerConfig` together with the server's authenticator.
pub(crate) struct Settings {
    config: ServerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl Settings {
    pub(crate) fn new(
        config: ServerConfig,
        authenticator: Option<Arc<dyn Authenticator>>,
    ) -> Settings {
        Settings {
            config,
            authenticator,
        }
    }
}

impl Config for Settings {
    fn authenticate(&self, login: &str, passcode: &str) -> bool {
        match self.authenticator {
            Some(ref authenticator) => authenticator.authenticate(login, passcode),
            None => true,
        }
    }

    fn heart_beat(&self) -> Duration {
        if self.config.heart_beat.is_zero() {
            DEFAULT_HEART_BEAT
        } else {
            self.config.heart_beat
        }
    }

    fn is_debug(&self) -> bool {
        self.config.debug
    }

    fn max_pending_reads(&self) -> usize {
        match self.config.max_pending_reads {
            0 => DEFAULT_MAX_PENDING,
            n => n,
        }
    }

    fn max_pending_writes(&self) -> usize {
        match self.config.max_pending_writes {
            0 => DEFAULT_MAX_PENDING,
            n => n,
        }
    }
}
