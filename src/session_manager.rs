use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};

use crate::backoff::Backoff;
use crate::codec::{self, FrameReader, FrameWriter};
use crate::connection::{self, BoxedTransport, SessionInfo};
use crate::error::{Error, Result};
use crate::frame::{Command, Frame, Transmission};
use crate::header::{self, HeartBeat, StompVersion};
use crate::session_builder::SessionConfig;
use crate::subscription::Control;

pub(crate) enum Request {
    Frame(WriteRequest),
    Shutdown,
}

pub(crate) struct WriteRequest {
    pub frame: Frame,
    pub reply: Reply,
}

/// Where the answer to a written frame should go.
pub(crate) enum Reply {
    None,
    Receipt(oneshot::Sender<Frame>),
    Subscription {
        route: Route,
        receipt: Option<oneshot::Sender<Frame>>,
    },
}

pub(crate) struct Route {
    pub frames: mpsc::Sender<Frame>,
    pub control: mpsc::Sender<Control>,
}

struct ActiveRoute {
    /// SUBSCRIBE frame replayed after reconnecting, without its receipt.
    subscribe: Frame,
    frames: mpsc::Sender<Frame>,
    control: mpsc::Sender<Control>,
}

/// One established transport: the frames read off it and the writer.
pub(crate) struct Link {
    frames: mpsc::Receiver<Transmission>,
    writer: FrameWriter<BoxedTransport>,
    reader: JoinHandle<()>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

enum Outcome {
    Closed,
    Lost(String),
}

/// Performs the CONNECT handshake over `transport` and starts reading.
pub(crate) async fn establish(
    transport: BoxedTransport,
    config: &SessionConfig,
    dialed_host: Option<&str>,
) -> Result<(Link, SessionInfo)> {
    let (mut reader, mut writer) = codec::split(transport);

    let connect_frame = config.connect_frame(dialed_host);
    debug!("Sending CONNECT frame:\n{}", connect_frame);
    writer.send(Transmission::CompleteFrame(connect_frame)).await?;

    let awaited = timeout(config.connect_timeout, async {
        loop {
            match reader.next().await {
                Some(Ok(Transmission::HeartBeat)) => continue,
                Some(Ok(Transmission::CompleteFrame(frame))) => return Ok(frame),
                Some(Err(error)) => return Err(error),
                None => return Err(Error::ConnectionClosed),
            }
        }
    })
    .await;
    let response = match awaited {
        Ok(response) => response?,
        Err(_) => {
            warn!("No answer to CONNECT within {:?}", config.connect_timeout);
            return Err(Error::ReadTimeout);
        }
    };
    match response.command {
        Command::Connected => {}
        Command::Error => return Err(Error::from_error_frame(response)),
        other => return Err(Error::UnexpectedCommand(other)),
    }
    debug!("Received CONNECTED frame:\n{}", response);

    let version = match response.headers.get_version() {
        Some(version) => version?.0,
        None => StompVersion::Stomp_v1_0,
    };
    let HeartBeat(server_tx_ms, server_rx_ms) = match response.headers.get_heart_beat() {
        Some(heart_beat) => heart_beat?,
        None => HeartBeat(0, 0),
    };
    let HeartBeat(client_tx_ms, client_rx_ms) = config.heartbeat;
    let (tx_ms, rx_ms) =
        connection::select_heartbeat(client_tx_ms, client_rx_ms, server_tx_ms, server_rx_ms);
    let (read_timeout, write_timeout) =
        connection::heart_beat_timeouts(tx_ms, rx_ms, config.heart_beat_error);
    debug!(
        "Heart-beat timeouts: read {:?}, write {:?}",
        read_timeout, write_timeout
    );

    let info = SessionInfo {
        version,
        session: response
            .headers
            .get_session()
            .map(|header::Session(s)| s.to_owned()),
        server: response
            .headers
            .get_server()
            .map(|header::Server(s)| s.to_owned()),
    };
    let (frames, reader) = spawn_reader(reader, config.read_capacity.max(1));
    let link = Link {
        frames,
        writer,
        reader,
        read_timeout,
        write_timeout,
    };
    Ok((link, info))
}

/// Decodes frames off the wire until the first error, then closes the
/// channel it feeds.
fn spawn_reader(
    mut reader: FrameReader<BoxedTransport>,
    capacity: usize,
) -> (mpsc::Receiver<Transmission>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(async move {
        while let Some(item) = reader.next().await {
            match item {
                Ok(transmission) => {
                    if tx.send(transmission).await.is_err() {
                        return;
                    }
                }
                Err(error) => {
                    debug!("Read failed: {}", error);
                    return;
                }
            }
        }
    });
    (rx, handle)
}

async fn dial_once(address: &str, config: &SessionConfig) -> Result<(Link, SessionInfo)> {
    let stream = TcpStream::connect(address).await?;
    let host = stream.peer_addr().ok().map(|peer| peer.ip().to_string());
    establish(Box::new(stream), config, host.as_deref()).await
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}

/// The session's decision loop. It alone owns the receipt table and the
/// subscription routes, and it alone touches the transport.
pub(crate) struct SessionManager {
    config: Arc<SessionConfig>,
    address: Option<String>,
    requests: mpsc::Receiver<Request>,
    info: watch::Sender<SessionInfo>,
    receipts: HashMap<String, oneshot::Sender<Frame>>,
    routes: HashMap<String, ActiveRoute>,
    disconnect_receipt: Option<String>,
    failure: Option<String>,
}

impl SessionManager {
    pub(crate) fn new(
        config: Arc<SessionConfig>,
        address: Option<String>,
        requests: mpsc::Receiver<Request>,
        info: watch::Sender<SessionInfo>,
    ) -> SessionManager {
        SessionManager {
            config,
            address,
            requests,
            info,
            receipts: HashMap::new(),
            routes: HashMap::new(),
            disconnect_receipt: None,
            failure: None,
        }
    }

    pub(crate) async fn run(mut self, link: Link) {
        let mut current = Some(link);
        while let Some(mut link) = current.take() {
            let outcome = self.process(&mut link).await;
            let _ = SinkExt::<Transmission>::close(&mut link.writer).await;
            drop(link);

            current = match outcome {
                Outcome::Closed => None,
                Outcome::Lost(reason) => {
                    warn!("Connection lost: {}", reason);
                    self.fail_receipts(&reason);
                    self.failure = Some(reason);
                    if self.disconnect_receipt.is_some() {
                        None
                    } else {
                        self.reconnect().await
                    }
                }
            };
        }
        self.teardown();
        info!("Connection closed");
    }

    async fn process(&mut self, link: &mut Link) -> Outcome {
        let mut read_deadline = deadline(link.read_timeout);
        let mut write_deadline = deadline(link.write_timeout);
        loop {
            tokio::select! {
                _ = sleep_until_deadline(read_deadline) => {
                    return Outcome::Lost("read timeout".to_owned());
                }
                _ = sleep_until_deadline(write_deadline) => {
                    debug!("Sending heart-beat");
                    if let Err(error) = link.writer.send(Transmission::HeartBeat).await {
                        return Outcome::Lost(error.to_string());
                    }
                    write_deadline = deadline(link.write_timeout);
                }
                transmission = link.frames.recv() => {
                    read_deadline = deadline(link.read_timeout);
                    match transmission {
                        None => return Outcome::Lost("connection closed".to_owned()),
                        Some(Transmission::HeartBeat) => debug!("Received heart-beat"),
                        Some(Transmission::CompleteFrame(frame)) => {
                            if let Some(outcome) = self.on_frame(frame).await {
                                return outcome;
                            }
                        }
                    }
                }
                request = self.requests.recv() => match request {
                    None | Some(Request::Shutdown) => return Outcome::Closed,
                    Some(Request::Frame(request)) => {
                        if let Err(error) = self.on_request(request, &mut link.writer).await {
                            return Outcome::Lost(error.to_string());
                        }
                        write_deadline = deadline(link.write_timeout);
                    }
                },
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Option<Outcome> {
        match frame.command {
            Command::Receipt => {
                let receipt_id = match frame.headers.get_receipt_id() {
                    Some(header::ReceiptId(id)) => id.to_owned(),
                    None => {
                        error!("Received RECEIPT frame without a receipt-id");
                        self.fail_receipts("missing receipt-id");
                        return Some(Outcome::Closed);
                    }
                };
                if let Some(reply) = self.receipts.remove(&receipt_id) {
                    let _ = reply.send(frame);
                } else if self.routes.remove(&receipt_id).is_some() {
                    debug!("Subscription {} closed", receipt_id);
                } else {
                    debug!("Ignoring unexpected RECEIPT '{}'", receipt_id);
                }
                if self.disconnect_receipt.as_deref() == Some(receipt_id.as_str()) {
                    return Some(Outcome::Closed);
                }
                None
            }
            Command::Error => {
                error!(
                    "Received ERROR, closing connection: {}",
                    frame.headers.get("message").unwrap_or_default()
                );
                for (_, reply) in self.receipts.drain() {
                    let _ = reply.send(frame.clone());
                }
                for route in self.routes.values() {
                    let _ = route.frames.try_send(frame.clone());
                }
                Some(Outcome::Closed)
            }
            Command::Message => {
                let id = match frame.headers.get_subscription() {
                    Some(header::Subscription(id)) => id.to_owned(),
                    None => {
                        warn!("Ignored MESSAGE without a subscription header");
                        return None;
                    }
                };
                match self.routes.get(&id) {
                    Some(route) => {
                        if route.frames.send(frame).await.is_err() {
                            debug!("Subscription {} no longer reading", id);
                        }
                    }
                    None => warn!("Ignored MESSAGE for subscription {}", id),
                }
                None
            }
            other => {
                debug!("Ignoring unexpected {} frame", other);
                None
            }
        }
    }

    async fn on_request(
        &mut self,
        request: WriteRequest,
        writer: &mut FrameWriter<BoxedTransport>,
    ) -> Result<()> {
        let WriteRequest { mut frame, reply } = request;
        let receipt = frame.headers.get("receipt").map(str::to_owned);
        match reply {
            Reply::None => {}
            Reply::Receipt(reply) => {
                if let Some(receipt) = receipt {
                    self.receipts.insert(receipt, reply);
                }
            }
            Reply::Subscription {
                route,
                receipt: reply,
            } => {
                if let Some(id) = frame.headers.get("id") {
                    let mut subscribe = frame.clone();
                    subscribe.headers.remove("receipt");
                    self.routes.insert(
                        id.to_owned(),
                        ActiveRoute {
                            subscribe,
                            frames: route.frames,
                            control: route.control,
                        },
                    );
                }
                if let (Some(reply), Some(receipt)) = (reply, receipt) {
                    self.receipts.insert(receipt, reply);
                }
            }
        }

        match frame.command {
            Command::Unsubscribe => {
                // The RECEIPT for this id drops the route.
                if let Some(id) = frame.headers.get("id").map(str::to_owned) {
                    frame.headers.set("receipt", &id);
                }
            }
            Command::Disconnect => {
                self.disconnect_receipt = frame.headers.get("receipt").map(str::to_owned);
            }
            _ => {}
        }

        debug!("Sending frame:\n{}", frame);
        writer.send(Transmission::CompleteFrame(frame)).await
    }

    /// Answers every caller waiting on a receipt with an ERROR-shaped frame.
    fn fail_receipts(&mut self, reason: &str) {
        let error = Frame::error(reason);
        for (_, reply) in self.receipts.drain() {
            let _ = reply.send(error.clone());
        }
    }

    fn teardown(&mut self) {
        if let Some(reason) = self.failure.take() {
            self.fail_receipts(&reason);
            let error = Frame::error(&reason);
            for route in self.routes.values() {
                let _ = route.frames.try_send(error.clone());
            }
        }
        self.receipts.clear();
        self.routes.clear();
    }

    async fn reconnect(&mut self) -> Option<Link> {
        let address = match self.address.clone() {
            Some(address) => address,
            None => {
                info!("No address to reconnect to");
                return None;
            }
        };
        let mut backoff = Backoff::new(self.config.backoff_unit, self.config.retry_limit);
        loop {
            info!("Trying to reconnect to {}", address);
            match self.try_reconnect(&address).await {
                Ok(link) => {
                    info!("Reconnected to {}", address);
                    self.failure = None;
                    return Some(link);
                }
                Err(error) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Reconnecting to {} failed: {}; next attempt in {:?}",
                            address, error, delay
                        );
                        sleep(delay).await;
                    }
                    None => {
                        error!("Could not connect to server {}: retry limit reached", address);
                        return None;
                    }
                },
            }
        }
    }

    async fn try_reconnect(&mut self, address: &str) -> Result<Link> {
        let (mut link, info) = dial_once(address, &self.config).await?;
        self.info.send_replace(info);
        self.resubscribe(&mut link).await?;
        Ok(link)
    }

    /// Re-issues every live SUBSCRIBE on a fresh transport, handing each
    /// subscription a new frame channel.
    async fn resubscribe(&mut self, link: &mut Link) -> Result<()> {
        let capacity = self.config.subscription_capacity.max(1);
        let mut gone = Vec::new();
        for (id, route) in self.routes.iter_mut() {
            let (frames_tx, frames_rx) = mpsc::channel(capacity);
            if route.control.send(Control::Rebind(frames_rx)).await.is_err() {
                gone.push(id.clone());
                continue;
            }
            route.frames = frames_tx;
            debug!("Resubscribing {}", id);
            link.writer
                .send(Transmission::CompleteFrame(route.subscribe.clone()))
                .await?;
        }
        for id in gone {
            self.routes.remove(&id);
        }
        Ok(())
    }
}
