use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::frame::{Command, Frame, ToFrameBody};
use crate::header::{Header, StompVersion};
use crate::message_builder::MessageBuilder;
use crate::session_builder::SessionConfig;
use crate::session_manager::{self, Reply, Request, Route, SessionManager, WriteRequest};
use crate::subscription::{self, AckMode, AckOrNack, Message, Subscription};
use crate::subscription_builder::SubscriptionBuilder;
use crate::transaction::Transaction;

/// Time added to the read heart-beat timeout, and taken off the write
/// timeout, to absorb network latency.
pub const DEFAULT_HEART_BEAT_ERROR: Duration = Duration::from_secs(5);

/// Any byte stream a STOMP session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) type BoxedTransport = Box<dyn Transport>;

pub struct Credentials<'a>(pub &'a str, pub &'a str);

#[derive(Clone, Debug)]
pub struct OwnedCredentials {
    pub login: String,
    pub passcode: String,
}

impl<'a> From<Credentials<'a>> for OwnedCredentials {
    fn from(credentials: Credentials<'a>) -> OwnedCredentials {
        let Credentials(login, passcode) = credentials;
        OwnedCredentials {
            login: login.to_owned(),
            passcode: passcode.to_owned(),
        }
    }
}

/// Agrees on heart-beat intervals, in milliseconds. Zero on either side
/// disables that direction; otherwise the slower of the two wins.
pub fn select_heartbeat(
    client_tx_ms: u64,
    client_rx_ms: u64,
    server_tx_ms: u64,
    server_rx_ms: u64,
) -> (u64, u64) {
    let heartbeat_tx_ms = if client_tx_ms == 0 || server_rx_ms == 0 {
        0
    } else {
        cmp::max(client_tx_ms, server_rx_ms)
    };

    let heartbeat_rx_ms = if client_rx_ms == 0 || server_tx_ms == 0 {
        0
    } else {
        cmp::max(client_rx_ms, server_tx_ms)
    };
    (heartbeat_tx_ms, heartbeat_rx_ms)
}

/// Read and write timeouts for agreed intervals, widened or narrowed by
/// `error`. The write timeout is only narrowed when it exceeds `error`.
pub fn heart_beat_timeouts(
    tx_ms: u64,
    rx_ms: u64,
    error: Duration,
) -> (Option<Duration>, Option<Duration>) {
    let read_timeout = match rx_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms) + error),
    };
    let write_timeout = match tx_ms {
        0 => None,
        ms => {
            let timeout = Duration::from_millis(ms);
            Some(if timeout > error { timeout - error } else { timeout })
        }
    };
    (read_timeout, write_timeout)
}

/// Facts learned from the latest CONNECTED frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub version: StompVersion,
    pub session: Option<String>,
    pub server: Option<String>,
}

/// Handle to a client session. Clones share the same session; all I/O is
/// performed by the session's own task.
#[derive(Clone)]
pub struct Connection {
    requests: mpsc::Sender<Request>,
    info: watch::Receiver<SessionInfo>,
    ids: Arc<AtomicU64>,
    subscription_capacity: usize,
}

impl Connection {
    /// Dials `address` over TCP, retrying with backoff, then connects. The
    /// address is remembered so a lost transport can be re-established.
    pub async fn dial(address: &str, config: SessionConfig) -> Result<Connection> {
        let stream = dial_with_retry(address, &config).await?;
        let host = stream.peer_addr().ok().map(|peer| peer.ip().to_string());
        Connection::start(
            Box::new(stream),
            config,
            Some(address.to_owned()),
            host.as_deref(),
        )
        .await
    }

    /// Connects over a transport opened by the caller. Losing it ends the
    /// session, since there is no address to dial again.
    pub async fn connect<T: Transport>(transport: T, config: SessionConfig) -> Result<Connection> {
        Connection::start(Box::new(transport), config, None, None).await
    }

    async fn start(
        transport: BoxedTransport,
        config: SessionConfig,
        address: Option<String>,
        dialed_host: Option<&str>,
    ) -> Result<Connection> {
        let config = Arc::new(config);
        let (link, info) = session_manager::establish(transport, &config, dialed_host).await?;
        info!(
            "Connected: version {}, server {:?}, session {:?}",
            info.version, info.server, info.session
        );

        let (request_tx, request_rx) = mpsc::channel(config.request_capacity.max(1));
        let (info_tx, info_rx) = watch::channel(info);
        let subscription_capacity = config.subscription_capacity.max(1);
        let manager = SessionManager::new(config, address, request_rx, info_tx);
        tokio::spawn(manager.run(link));

        Ok(Connection {
            requests: request_tx,
            info: info_rx,
            ids: Arc::new(AtomicU64::new(0)),
            subscription_capacity,
        })
    }

    pub fn version(&self) -> StompVersion {
        self.info.borrow().version
    }

    pub fn session(&self) -> Option<String> {
        self.info.borrow().session.clone()
    }

    pub fn server(&self) -> Option<String> {
        self.info.borrow().server.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_receipt_id(&self) -> String {
        format!("message/{}", self.next_id())
    }

    pub fn next_subscription_id(&self) -> String {
        format!("stompbox/{}", self.next_id())
    }

    pub fn next_transaction_id(&self) -> String {
        format!("tx/{}", self.next_id())
    }

    pub fn message<T: ToFrameBody>(&self, destination: &str, body: T) -> MessageBuilder<'_> {
        let send_frame = Frame::send(destination, body.to_frame_body());
        MessageBuilder::new(self, send_frame)
    }

    pub fn subscription(&self, destination: &str) -> SubscriptionBuilder<'_> {
        SubscriptionBuilder::new(self, destination)
    }

    /// Queues `frame` for writing. If it carries a `receipt` header, waits
    /// for the matching RECEIPT; an ERROR in its place is returned as such.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        if frame.headers.contains("receipt") {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.request(frame, Reply::Receipt(reply_tx)).await?;
            wait_for_receipt(reply_rx).await
        } else {
            self.request(frame, Reply::None).await
        }
    }

    async fn request(&self, frame: Frame, reply: Reply) -> Result<()> {
        self.requests
            .send(Request::Frame(WriteRequest { frame, reply }))
            .await
            .map_err(|_| Error::AlreadyClosed)
    }

    pub(crate) async fn subscribe_frame(
        &self,
        subscribe_frame: Frame,
        destination: String,
        ack_mode: AckMode,
    ) -> Result<Subscription> {
        let id = subscribe_frame
            .headers
            .get("id")
            .ok_or(Error::MissingHeader("id"))?
            .to_owned();
        let (frames_tx, frames_rx) = mpsc::channel(self.subscription_capacity);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (receipt_tx, receipt_rx) = if subscribe_frame.headers.contains("receipt") {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let route = Route {
            frames: frames_tx,
            control: control_tx.clone(),
        };
        self.request(
            subscribe_frame,
            Reply::Subscription {
                route,
                receipt: receipt_tx,
            },
        )
        .await?;

        let subscription = Subscription::start(
            id,
            destination,
            ack_mode,
            self.clone(),
            frames_rx,
            (control_tx, control_rx),
        );
        if let Some(receipt_rx) = receipt_rx {
            wait_for_receipt(receipt_rx).await?;
        }
        Ok(subscription)
    }

    /// Acknowledges `message`. A no-op for auto-mode subscriptions.
    pub async fn ack(&self, message: &Message) -> Result<()> {
        self.acknowledge(message, AckOrNack::Ack, None).await
    }

    pub async fn nack(&self, message: &Message) -> Result<()> {
        self.acknowledge(message, AckOrNack::Nack, None).await
    }

    pub(crate) async fn acknowledge(
        &self,
        message: &Message,
        kind: AckOrNack,
        transaction: Option<&str>,
    ) -> Result<()> {
        match subscription::ack_frame(self.version(), message, kind)? {
            None => Ok(()),
            Some(mut frame) => {
                if let Some(transaction) = transaction {
                    frame.headers.push(Header::new("transaction", transaction));
                }
                self.send_frame(frame).await
            }
        }
    }

    pub async fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self.clone()).await
    }

    /// Sends DISCONNECT with a receipt and waits for the RECEIPT before
    /// the session closes. Does nothing on a closed connection.
    pub async fn disconnect(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let disconnect_frame = Frame::disconnect(&self.next_receipt_id());
        if self
            .request(disconnect_frame, Reply::Receipt(reply_tx))
            .await
            .is_err()
        {
            return Ok(());
        }
        wait_for_receipt(reply_rx).await?;
        self.requests.closed().await;
        Ok(())
    }

    /// Closes the session without the DISCONNECT handshake.
    pub async fn must_disconnect(&self) -> Result<()> {
        if self.requests.send(Request::Shutdown).await.is_ok() {
            self.requests.closed().await;
        }
        Ok(())
    }
}

async fn wait_for_receipt(reply: oneshot::Receiver<Frame>) -> Result<()> {
    match reply.await {
        Ok(frame) if frame.command == Command::Receipt => Ok(()),
        Ok(frame) => Err(Error::from_error_frame(frame)),
        Err(_) => Err(Error::ConnectionClosed),
    }
}

/// Opens a TCP stream to `address`, sleeping between failed attempts until
/// the retry limit is spent.
pub(crate) async fn dial_with_retry(address: &str, config: &SessionConfig) -> Result<TcpStream> {
    let mut backoff = Backoff::new(config.backoff_unit, config.retry_limit);
    loop {
        match TcpStream::connect(address).await {
            Ok(stream) => {
                info!("Created a connection to {}", address);
                return Ok(stream);
            }
            Err(error) => match backoff.next_delay() {
                Some(delay) => {
                    debug!(
                        "Dialing {} failed ({}), retrying in {:?}",
                        address, error, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, FrameReader, FrameWriter};
    use crate::frame::Transmission;
    use crate::session_builder::{HeartBeatError, SessionBuilder};
    use crate::header::HeartBeat;
    use futures::{SinkExt, StreamExt};
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    type Server = (FrameReader<DuplexStream>, FrameWriter<DuplexStream>);

    async fn next_frame(reader: &mut FrameReader<DuplexStream>) -> Frame {
        loop {
            match reader.next().await {
                Some(Ok(Transmission::CompleteFrame(frame))) => return frame,
                Some(Ok(Transmission::HeartBeat)) => continue,
                other => panic!("expected a frame, got {:?}", other.map(|r| r.is_ok())),
            }
        }
    }

    async fn connect_with(config: SessionConfig, connected: Frame) -> Result<(Connection, Server)> {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let server = async move {
            let (mut reader, mut writer) = codec::split(server_end);
            let connect = next_frame(&mut reader).await;
            assert_eq!(Command::Connect, connect.command);
            writer.send(connected).await.unwrap();
            (reader, writer)
        };
        let (connection, server) = tokio::join!(Connection::connect(client_end, config), server);
        connection.map(|connection| (connection, server))
    }

    fn connected(version: &str, heart_beat: &str) -> Frame {
        Frame::with_headers(
            Command::Connected,
            header_list![
                "version" => version,
                "server" => "fake/1.0",
                "session" => "s-1",
                "heart-beat" => heart_beat
            ],
        )
    }

    #[test]
    fn heartbeat_selection() {
        assert_eq!((0, 0), select_heartbeat(0, 0, 100, 100));
        assert_eq!((200, 0), select_heartbeat(200, 50, 0, 100));
        assert_eq!((300, 400), select_heartbeat(100, 400, 300, 300));
    }

    #[test]
    fn timeouts_absorb_the_error_margin() {
        let margin = Duration::from_secs(5);
        assert_eq!((None, None), heart_beat_timeouts(0, 0, margin));
        assert_eq!(
            (Some(Duration::from_secs(6)), Some(Duration::from_secs(5))),
            heart_beat_timeouts(10_000, 1_000, margin)
        );
        assert_eq!(
            (None, Some(Duration::from_secs(3))),
            heart_beat_timeouts(3_000, 0, margin)
        );
    }

    #[tokio::test]
    async fn handshake_reports_session_facts() {
        let (connection, _server) = connect_with(SessionConfig::default(), connected("1.1", "0,0"))
            .await
            .unwrap();
        assert_eq!(StompVersion::Stomp_v1_1, connection.version());
        assert_eq!(Some("fake/1.0".to_owned()), connection.server());
        assert_eq!(Some("s-1".to_owned()), connection.session());
    }

    #[tokio::test]
    async fn missing_version_means_1_0() {
        let response = Frame::new(Command::Connected);
        let (connection, _server) = connect_with(SessionConfig::default(), response)
            .await
            .unwrap();
        assert_eq!(StompVersion::Stomp_v1_0, connection.version());
    }

    #[tokio::test]
    async fn handshake_failures() {
        let rejected = connect_with(SessionConfig::default(), Frame::error("go away")).await;
        assert!(matches!(rejected, Err(Error::ErrorFrame { ref message, .. }) if message == "go away"));

        let unsupported = connect_with(SessionConfig::default(), connected("2.0", "0,0")).await;
        assert!(matches!(unsupported, Err(Error::UnsupportedVersion(_))));
    }

    #[tokio::test]
    async fn receipts_resolve_in_any_order() {
        let (connection, (mut reader, mut writer)) =
            connect_with(SessionConfig::default(), connected("1.2", "0,0"))
                .await
                .unwrap();

        let server = tokio::spawn(async move {
            let mut receipts = Vec::new();
            for _ in 0..5 {
                let frame = next_frame(&mut reader).await;
                assert_eq!(Command::Send, frame.command);
                receipts.push(frame.headers.get("receipt").unwrap().to_owned());
            }
            let mut stray = Frame::new(Command::Message);
            stray.headers.push(Header::new("subscription", "nobody"));
            writer.send(stray).await.unwrap();
            for receipt in receipts.iter().rev() {
                writer.send(Transmission::HeartBeat).await.unwrap();
                writer.send(Frame::receipt(receipt)).await.unwrap();
            }
            (reader, writer)
        });

        let sends = (0..5).map(|i| {
            let connection = connection.clone();
            async move {
                connection
                    .message("/queue/a", format!("body {}", i))
                    .with(crate::message_builder::WithReceipt)
                    .send()
                    .await
            }
        });
        let results = futures::future::join_all(sends).await;
        assert!(results.iter().all(|r| r.is_ok()));
        let _server = server.await.unwrap();
    }

    #[tokio::test]
    async fn error_frame_fails_pending_receipts() {
        let (connection, (mut reader, mut writer)) =
            connect_with(SessionConfig::default(), connected("1.2", "0,0"))
                .await
                .unwrap();

        let server = tokio::spawn(async move {
            let frame = next_frame(&mut reader).await;
            assert!(frame.headers.contains("receipt"));
            writer.send(Frame::error("disk full")).await.unwrap();
            (reader, writer)
        });

        let result = connection
            .message("/queue/a", "payload")
            .with(crate::message_builder::WithReceipt)
            .send()
            .await;
        assert!(matches!(result, Err(Error::ErrorFrame { ref message, .. }) if message == "disk full"));
        let _server = server.await.unwrap();
        timeout(Duration::from_secs(1), connection.requests.closed())
            .await
            .unwrap();
        assert!(matches!(
            connection.message("/queue/a", "late").send().await,
            Err(Error::AlreadyClosed)
        ));
    }

    #[tokio::test]
    async fn subscription_delivery_and_unsubscribe() {
        let (connection, (mut reader, mut writer)) =
            connect_with(SessionConfig::default(), connected("1.2", "0,0"))
                .await
                .unwrap();

        let mut subscription = connection
            .subscription("/topic/news")
            .with(AckMode::Client)
            .start()
            .await
            .unwrap();
        let subscribe = next_frame(&mut reader).await;
        assert_eq!(Command::Subscribe, subscribe.command);
        assert_eq!(Some(subscription.id()), subscribe.headers.get("id"));
        assert_eq!(Some("client"), subscribe.headers.get("ack"));

        let mut message = Frame::new(Command::Message);
        message.headers.push(Header::new("subscription", subscription.id()));
        message.headers.push(Header::new("destination", "/topic/news"));
        message.headers.push(Header::new("message-id", "1"));
        message.headers.push(Header::new("ack", "a-1"));
        message.body = b"hello".to_vec();
        writer.send(message).await.unwrap();

        let received = subscription.read().await.unwrap();
        assert_eq!(b"hello".to_vec(), received.body);
        assert_eq!("/topic/news", received.destination);
        connection.ack(&received).await.unwrap();
        let ack = next_frame(&mut reader).await;
        assert_eq!(Command::Ack, ack.command);
        assert_eq!(Some("a-1"), ack.headers.get("id"));

        subscription.unsubscribe().await.unwrap();
        let unsubscribe = next_frame(&mut reader).await;
        assert_eq!(Command::Unsubscribe, unsubscribe.command);
        assert_eq!(Some(subscription.id()), unsubscribe.headers.get("receipt"));
        writer.send(Frame::receipt(subscription.id())).await.unwrap();

        assert!(matches!(subscription.read().await, Err(Error::CompletedSubscription)));
        assert!(!subscription.active());
    }

    #[tokio::test]
    async fn explicit_subscription_id_is_kept() {
        let (connection, (mut reader, _writer)) =
            connect_with(SessionConfig::default(), connected("1.2", "0,0"))
                .await
                .unwrap();
        let subscription = connection
            .subscription("/queue/jobs")
            .with(Header::new("id", "mine"))
            .start()
            .await
            .unwrap();
        assert_eq!("mine", subscription.id());
        let subscribe = next_frame(&mut reader).await;
        assert_eq!(vec!["mine"], subscribe.headers.get_all("id"));
    }

    #[tokio::test]
    async fn idle_writer_sends_heart_beats() {
        let config = SessionBuilder::new().with(HeartBeat(50, 0)).config;
        let (_connection, (mut reader, _writer)) = connect_with(config, connected("1.2", "0,50"))
            .await
            .unwrap();
        let beat = timeout(Duration::from_secs(2), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(Transmission::HeartBeat, beat);
    }

    #[tokio::test]
    async fn silent_server_times_out_without_an_address() {
        let config = SessionBuilder::new()
            .with(HeartBeat(0, 20))
            .with(HeartBeatError(Duration::from_millis(10)))
            .config;
        let (connection, _server) = connect_with(config, connected("1.2", "20,0"))
            .await
            .unwrap();
        timeout(Duration::from_secs(2), connection.requests.closed())
            .await
            .unwrap();
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn silent_listener_fails_the_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, _writer) = codec::split(stream);
            match reader.next().await {
                Some(Ok(Transmission::CompleteFrame(frame))) => assert_eq!(Command::Connect, frame.command),
                _ => panic!("expected CONNECT"),
            }
            reader
        });
        let attempt = SessionBuilder::new()
            .with(crate::session_builder::ConnectTimeout(Duration::from_millis(100)))
            .dial(&address);
        let outcome = timeout(Duration::from_secs(5), attempt).await.unwrap();
        assert!(matches!(outcome, Err(Error::ReadTimeout)));
        let _reader = silent.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_waits_for_its_receipt() {
        let (connection, (mut reader, mut writer)) =
            connect_with(SessionConfig::default(), connected("1.2", "0,0"))
                .await
                .unwrap();
        let server = tokio::spawn(async move {
            let frame = next_frame(&mut reader).await;
            assert_eq!(Command::Disconnect, frame.command);
            let receipt = frame.headers.get("receipt").unwrap().to_owned();
            writer.send(Frame::receipt(&receipt)).await.unwrap();
        });
        connection.disconnect().await.unwrap();
        server.await.unwrap();
        assert!(connection.is_closed());
        connection.disconnect().await.unwrap();
    }
}
