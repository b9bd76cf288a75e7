use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::frame::{Command, Frame};
use crate::header::{self, HeaderList, StompVersion};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_text(&self) -> &'static str {
        match *self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

impl FromStr for AckMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<AckMode> {
        match s {
            "" | "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(Error::InvalidHeader(format!("ack:{}", other))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOrNack {
    Ack,
    Nack,
}

impl AckOrNack {
    pub fn command(&self) -> Command {
        match *self {
            AckOrNack::Ack => Command::Ack,
            AckOrNack::Nack => Command::Nack,
        }
    }
}

/// A MESSAGE delivered to a subscription, or the error that ended it.
#[derive(Debug)]
pub struct Message {
    pub destination: String,
    pub content_type: Option<String>,
    pub headers: HeaderList,
    pub body: Vec<u8>,
    /// Id of the subscription the message arrived on.
    pub subscription: String,
    pub ack_mode: AckMode,
    pub err: Option<Error>,
}

impl Message {
    fn from_frame(frame: Frame, subscription: &str, ack_mode: AckMode) -> Message {
        let destination = frame
            .headers
            .get_destination()
            .map(|header::Destination(d)| d.to_owned())
            .unwrap_or_default();
        let content_type = frame
            .headers
            .get_content_type()
            .map(|header::ContentType(c)| c.to_owned());
        let err = if frame.is_error() {
            Some(Error::from_error_frame(frame.clone()))
        } else {
            None
        };
        Message {
            destination,
            content_type,
            headers: frame.headers,
            body: frame.body,
            subscription: subscription.to_owned(),
            ack_mode,
            err,
        }
    }
}

/// Builds the ACK or NACK frame for `message`. The layout depends only on
/// the negotiated version; auto-mode ACKs need no frame at all.
pub fn ack_frame(version: StompVersion, message: &Message, kind: AckOrNack) -> Result<Option<Frame>> {
    if kind == AckOrNack::Nack && !version.supports_nack() {
        return Err(Error::NackNotSupported);
    }
    if message.err.is_some() || message.subscription.is_empty() {
        return Err(Error::NotReceivedMessage);
    }
    if message.ack_mode == AckMode::Auto {
        return match kind {
            AckOrNack::Ack => Ok(None),
            AckOrNack::Nack => Err(Error::CannotNackAutoSubscription),
        };
    }

    let mut frame = Frame::new(kind.command());
    match version {
        StompVersion::Stomp_v1_0 | StompVersion::Stomp_v1_1 => {
            let header::MessageId(message_id) = message
                .headers
                .get_message_id()
                .ok_or(Error::MissingHeader("message-id"))?;
            frame.headers.push(header::Header::new("subscription", &message.subscription));
            frame.headers.push(header::Header::new("message-id", message_id));
        }
        StompVersion::Stomp_v1_2 => {
            let header::Ack(ack) = message.headers.get_ack().ok_or(Error::MissingHeader("ack"))?;
            frame.headers.push(header::Header::new("id", ack));
        }
    }
    Ok(Some(frame))
}

/// Commands the owning connection feeds a subscription's delivery loop.
#[derive(Debug)]
pub(crate) enum Control {
    /// Stop delivering and close the message channel.
    Unsubscribe,
    /// The transport was replaced; frames now arrive on this channel.
    Rebind(mpsc::Receiver<Frame>),
}

/// An active subscription to a destination. Messages are read in the
/// order the server delivered them.
pub struct Subscription {
    id: String,
    destination: String,
    ack_mode: AckMode,
    connection: Connection,
    messages: mpsc::UnboundedReceiver<Message>,
    control: mpsc::Sender<Control>,
    completed: Arc<AtomicBool>,
}

impl Subscription {
    pub(crate) fn start(
        id: String,
        destination: String,
        ack_mode: AckMode,
        connection: Connection,
        frames: mpsc::Receiver<Frame>,
        control: (mpsc::Sender<Control>, mpsc::Receiver<Control>),
    ) -> Subscription {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let completed = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = control;

        let delivery = Delivery {
            id: id.clone(),
            ack_mode,
            frames: Some(frames),
            control: control_rx,
            messages: Some(message_tx),
            completed: completed.clone(),
        };
        tokio::spawn(delivery.run());

        Subscription {
            id,
            destination,
            ack_mode,
            connection,
            messages: message_rx,
            control: control_tx,
            completed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// False once unsubscribed, or once the connection is gone for good.
    pub fn active(&self) -> bool {
        !self.completed.load(Ordering::Acquire)
    }

    /// Waits for the next message. An ERROR frame routed to this
    /// subscription is returned as its error.
    pub async fn read(&mut self) -> Result<Message> {
        match self.messages.recv().await {
            None => Err(Error::CompletedSubscription),
            Some(Message { err: Some(err), .. }) => Err(err),
            Some(message) => Ok(message),
        }
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        if !self.active() {
            return Err(Error::CompletedSubscription);
        }
        self.connection.send_frame(Frame::unsubscribe(&self.id)).await?;
        self.control
            .send(Control::Unsubscribe)
            .await
            .map_err(|_| Error::CompletedSubscription)
    }
}

/// Delivery loop of one subscription: the only place its frames are
/// turned into messages.
struct Delivery {
    id: String,
    ack_mode: AckMode,
    frames: Option<mpsc::Receiver<Frame>>,
    control: mpsc::Receiver<Control>,
    messages: Option<mpsc::UnboundedSender<Message>>,
    completed: Arc<AtomicBool>,
}

impl Delivery {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                control = self.control.recv() => match control {
                    Some(Control::Unsubscribe) => {
                        debug!("Subscription {} unsubscribed", self.id);
                        self.complete();
                        return;
                    }
                    Some(Control::Rebind(frames)) => self.rebind(frames),
                    None => {
                        self.complete();
                        return;
                    }
                },
                frame = recv_frame(&mut self.frames) => match frame {
                    Some(frame) => self.deliver(frame),
                    None => {
                        // The connection dropped this route for good.
                        self.frames = None;
                        self.complete();
                        return;
                    }
                },
            }
        }
    }

    fn rebind(&mut self, frames: mpsc::Receiver<Frame>) {
        if let Some(mut old) = self.frames.take() {
            while let Ok(frame) = old.try_recv() {
                self.deliver(frame);
            }
        }
        debug!("Subscription {} rebound to a new transport", self.id);
        self.frames = Some(frames);
    }

    fn deliver(&mut self, frame: Frame) {
        if !matches!(frame.command, Command::Message | Command::Error) {
            return;
        }
        if frame.is_error() {
            warn!(
                "Subscription {}: ERROR message: {}",
                self.id,
                frame.headers.get("message").unwrap_or_default()
            );
        }
        if let Some(messages) = &self.messages {
            let message = Message::from_frame(frame, &self.id, self.ack_mode);
            if messages.send(message).is_err() {
                debug!("Subscription {} handle dropped, discarding message", self.id);
            }
        }
    }

    fn complete(&mut self) {
        self.completed.store(true, Ordering::Release);
        self.messages = None;
    }
}

async fn recv_frame(frames: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
    match frames {
        Some(frames) => frames.recv().await,
        None => std::future::pending().await,
    }
}
