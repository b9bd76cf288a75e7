//! One task per accepted socket: a read activity feeding a decision loop
//! that owns the connection's protocol state.

pub mod request;
pub mod session;
pub mod subscription;
pub mod tx_store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, timeout, Instant};

use crate::codec::{self, FrameReader, FrameWriter};
use crate::connection::BoxedTransport;
use crate::error::{Error, Result};
use crate::frame::{Command, Frame, Transmission};
use crate::header::{self, HeartBeat};
use crate::server::config::Config;

use self::request::Request;
use self::session::{clamp_heart_beat, min_heart_beat_ms, Flow, Outbox, Session};
use self::subscription::QueueDelivery;

/// How long a new socket may take to send CONNECT.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(180);

/// Pause before answering a failed login.
const AUTHENTICATION_DELAY: Duration = Duration::from_secs(1);

/// Per-connection traffic counters, shared with the router for status.
#[derive(Debug, Default)]
pub struct Counters {
    pub sent_frames: AtomicU64,
    pub received_frames: AtomicU64,
    pub skipped_writes: AtomicU64,
}

/// Serves one client until it disconnects or misbehaves, then tears the
/// connection down.
pub(crate) async fn serve_connection(
    transport: BoxedTransport,
    id: u64,
    peer: String,
    config: Arc<dyn Config>,
    router: mpsc::Sender<Request>,
) {
    let (reader, writer) = codec::split(transport);
    let counters = Arc::new(Counters::default());

    let (frames_tx, frames) = mpsc::channel(config.max_pending_reads().max(1));
    let reader = tokio::spawn(read_loop(
        id,
        reader,
        frames_tx,
        config.clone(),
        counters.clone(),
    ));

    let (topic_tx, topic) = mpsc::channel(config.max_pending_writes().max(1));
    let (queue_tx, queue) = mpsc::unbounded_channel();
    let session = Session::new(id, &peer, config.clone(), topic_tx, queue_tx, counters.clone());

    let conn = Conn {
        id,
        peer,
        config,
        session,
        writer,
        router,
        frames,
        topic,
        queue,
        counters,
        write_deadline: None,
    };
    conn.run().await;
    reader.abort();
}

/// Decodes frames for the decision loop. Before CONNECT a client has three
/// minutes per frame; afterwards twice its promised heart-beat interval,
/// or forever if it promised none.
async fn read_loop(
    id: u64,
    mut reader: FrameReader<BoxedTransport>,
    frames: mpsc::Sender<Result<Frame>>,
    config: Arc<dyn Config>,
    counters: Arc<Counters>,
) {
    let mut read_timeout = Some(CONNECT_TIMEOUT);
    let mut connecting = true;
    loop {
        let item = match read_timeout {
            Some(read_timeout) => match timeout(read_timeout, reader.next()).await {
                Ok(item) => item,
                Err(_) => Some(Err(Error::ReadTimeout)),
            },
            None => reader.next().await,
        };
        let frame = match item {
            None => return,
            Some(Err(error)) => {
                debug!("[{}] read failed: {}", id, error);
                let _ = frames.send(Err(error)).await;
                return;
            }
            Some(Ok(Transmission::HeartBeat)) => {
                counters.received_frames.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            Some(Ok(Transmission::CompleteFrame(frame))) => frame,
        };
        counters.received_frames.fetch_add(1, Ordering::Relaxed);

        if connecting && matches!(frame.command, Command::Connect | Command::Stomp) {
            connecting = false;
            let cx = match frame.headers.get_heart_beat() {
                Some(Ok(HeartBeat(cx, _))) => {
                    clamp_heart_beat(cx, min_heart_beat_ms(config.as_ref()))
                }
                _ => 0,
            };
            read_timeout = match cx {
                0 => None,
                ms => Some(Duration::from_millis(ms.saturating_mul(2))),
            };
        }

        if frames.send(Ok(frame)).await.is_err() {
            return;
        }
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Conn {
    id: u64,
    peer: String,
    config: Arc<dyn Config>,
    session: Session,
    writer: FrameWriter<BoxedTransport>,
    router: mpsc::Sender<Request>,
    frames: mpsc::Receiver<Result<Frame>>,
    topic: mpsc::Receiver<Frame>,
    queue: mpsc::UnboundedReceiver<QueueDelivery>,
    counters: Arc<Counters>,
    write_deadline: Option<Instant>,
}

impl Conn {
    async fn run(mut self) {
        match self.process().await {
            Ok(()) => info!("[{}] {} closed", self.id, self.peer),
            Err(error) => info!("[{}] {} closed: {}", self.id, self.peer, error),
        }
        self.cleanup().await;
        let _ = SinkExt::<Transmission>::close(&mut self.writer).await;
    }

    async fn process(&mut self) -> Result<()> {
        loop {
            let write_deadline = self.write_deadline;
            tokio::select! {
                frame = self.frames.recv() => match frame {
                    None => return Ok(()),
                    Some(Err(error)) => {
                        if !error.is_transport() {
                            self.send_error_immediately(&error, None).await;
                        }
                        return Err(error);
                    }
                    Some(Ok(frame)) => {
                        if self.on_frame(frame).await? == Flow::Disconnect {
                            return Ok(());
                        }
                    }
                },
                Some(frame) = self.topic.recv() => {
                    if let Some(frame) = self.session.topic_frame(frame) {
                        self.write(frame).await?;
                    }
                }
                Some(delivery) = self.queue.recv() => {
                    let mut out = Outbox::default();
                    self.session.deliver(delivery, &mut out);
                    self.flush(out).await?;
                }
                _ = sleep_until_deadline(write_deadline) => {
                    if self.config.is_debug() {
                        debug!("[{}] sending heart-beat", self.id);
                    }
                    self.writer.send(Transmission::HeartBeat).await?;
                    self.write_deadline = deadline(self.session.write_timeout());
                }
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<Flow> {
        if self.config.is_debug() {
            debug!("[{}] received:\n{}", self.id, frame);
        }
        let receipt = frame
            .headers
            .get_receipt()
            .map(|header::Receipt(receipt)| receipt.to_owned());
        let mut out = Outbox::default();
        let result = self.session.dispatch(frame, &mut out);
        self.flush(out).await?;
        match result {
            Ok(flow) => Ok(flow),
            Err(error) => {
                if let Error::AuthenticationFailed = error {
                    sleep(AUTHENTICATION_DELAY).await;
                }
                self.send_error_immediately(&error, receipt.as_deref()).await;
                Err(error)
            }
        }
    }

    /// Writes the ERROR frame for `error` ahead of anything still queued.
    async fn send_error_immediately(&mut self, error: &Error, receipt: Option<&str>) {
        warn!("[{}] {}: {}", self.id, self.peer, error);
        let mut frame = Frame::error(&error.to_string());
        if let Some(receipt) = receipt {
            frame.headers.set("receipt-id", receipt);
        }
        if let Err(error) = self.write(frame).await {
            debug!("[{}] could not send ERROR: {}", self.id, error);
        }
    }

    async fn write(&mut self, frame: Frame) -> Result<()> {
        if self.config.is_debug() {
            debug!("[{}] sending:\n{}", self.id, frame);
        }
        self.writer.send(Transmission::CompleteFrame(frame)).await?;
        self.counters.sent_frames.fetch_add(1, Ordering::Relaxed);
        self.write_deadline = deadline(self.session.write_timeout());
        Ok(())
    }

    /// Router requests go out before any frame, so a RECEIPT is only
    /// written once the router holds what the receipted frame asked for.
    async fn flush(&mut self, out: Outbox) -> Result<()> {
        self.send_requests(out.requests).await?;
        for frame in out.frames {
            self.write(frame).await?;
        }
        Ok(())
    }

    async fn send_requests(&mut self, requests: Vec<Request>) -> Result<()> {
        for request in requests {
            if self.router.send(request).await.is_err() {
                return Err(Error::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Hands back every queue frame that reached this connection but was
    /// never written, and throws away pending topic frames.
    fn drain(&mut self, out: &mut Outbox) {
        while self.topic.try_recv().is_ok() {}
        while let Ok(delivery) = self.queue.try_recv() {
            out.requests.push(Request::Requeue(delivery.frame));
        }
    }

    async fn cleanup(&mut self) {
        let mut out = Outbox::default();
        while self.topic.try_recv().is_ok() {}
        self.session.cleanup(&mut out);
        self.drain(&mut out);
        let _ = self.send_requests(out.requests).await;

        // Once the router confirms, nothing more can be on its way here.
        let (done, confirmed) = oneshot::channel();
        let disconnected = Request::Disconnected { id: self.id, done };
        if self.router.send(disconnected).await.is_ok() {
            let _ = confirmed.await;
        }

        let mut out = Outbox::default();
        self.drain(&mut out);
        let _ = self.send_requests(out.requests).await;
    }
}
