use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::frame::{Command, Frame};
use crate::header::{self, Header, HeartBeat, StompVersion, MAX_HEART_BEAT_MS};
use crate::server::client::request::{ClientHandle, Request};
use crate::server::client::subscription::{Pending, QueueDelivery, Subscription, SubscriptionList};
use crate::server::client::tx_store::TxStore;
use crate::server::client::Counters;
use crate::server::config::Config;
use crate::server::SERVER_NAME;
use crate::subscription::AckMode;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Connecting,
    Connected,
}

/// What handling one event produced: requests for the router, and frames
/// for the client written right after them.
#[derive(Debug, Default)]
pub struct Outbox {
    pub frames: Vec<Frame>,
    pub requests: Vec<Request>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// Raises a non-zero heart-beat interval to `min_ms`. Zero means none
/// and stays zero.
pub fn clamp_heart_beat(value_ms: u64, min_ms: u64) -> u64 {
    if value_ms > 0 && value_ms < min_ms {
        min_ms
    } else {
        value_ms
    }
}

pub(crate) fn min_heart_beat_ms(config: &dyn Config) -> u64 {
    (config.heart_beat().as_millis() as u64).min(MAX_HEART_BEAT_MS)
}

/// Version for a CONNECT frame: the highest one both sides speak. No
/// `accept-version` at all means 1.0, which is not served.
fn negotiate_version(frame: &Frame) -> Result<StompVersion> {
    let version = match frame.headers.get_accept_version() {
        Some(offered) => StompVersion::negotiate(&offered).ok_or_else(|| {
            Error::UnsupportedVersion(
                frame
                    .headers
                    .get("accept-version")
                    .unwrap_or_default()
                    .to_owned(),
            )
        })?,
        None => StompVersion::Stomp_v1_0,
    };
    if version == StompVersion::Stomp_v1_0 {
        return Err(Error::UnsupportedVersion(version.to_string()));
    }
    Ok(version)
}

fn transaction_of(frame: &Frame) -> Result<String> {
    let header::Transaction(tx) = frame
        .headers
        .get_transaction()
        .ok_or(Error::MissingHeader("transaction"))?;
    Ok(tx.to_owned())
}

fn id_of(frame: &Frame) -> Result<String> {
    let header::Id(id) = frame.headers.get_id().ok_or(Error::MissingHeader("id"))?;
    Ok(id.to_owned())
}

fn destination_of(frame: &Frame) -> Result<String> {
    let header::Destination(destination) = frame
        .headers
        .get_destination()
        .ok_or(Error::MissingHeader("destination"))?;
    Ok(destination.to_owned())
}

/// Protocol state of one server connection. Everything here is touched
/// only by that connection's decision loop; nothing here does I/O.
pub struct Session {
    id: u64,
    peer: String,
    config: Arc<dyn Config>,
    state: State,
    version: StompVersion,
    write_timeout: Option<Duration>,
    login: Option<String>,
    subs: HashMap<String, Subscription>,
    sub_list: SubscriptionList,
    tx_store: TxStore,
    last_message_id: u64,
    last_serial: u64,
    topic: mpsc::Sender<Frame>,
    queue: mpsc::UnboundedSender<QueueDelivery>,
    counters: Arc<Counters>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        peer: &str,
        config: Arc<dyn Config>,
        topic: mpsc::Sender<Frame>,
        queue: mpsc::UnboundedSender<QueueDelivery>,
        counters: Arc<Counters>,
    ) -> Session {
        Session {
            id,
            peer: peer.to_owned(),
            config,
            state: State::Connecting,
            version: StompVersion::Stomp_v1_2,
            write_timeout: None,
            login: None,
            subs: HashMap::new(),
            sub_list: SubscriptionList::new(),
            tx_store: TxStore::new(),
            last_message_id: 0,
            last_serial: 0,
            topic,
            queue,
            counters,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn version(&self) -> StompVersion {
        self.version
    }

    /// How long the connection may stay silent before a heart-beat is due.
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Routes one client frame to its handler for the current state.
    pub fn dispatch(&mut self, frame: Frame, out: &mut Outbox) -> Result<Flow> {
        match self.state {
            State::Connecting => match frame.command {
                Command::Connect | Command::Stomp => self.handle_connect(frame, out),
                _ => Err(Error::NotConnected),
            },
            State::Connected => match frame.command {
                Command::Disconnect => self.handle_disconnect(frame, out),
                Command::Begin => self.handle_begin(frame, out),
                Command::Commit => self.handle_commit(frame, out),
                Command::Abort => self.handle_abort(frame, out),
                Command::Send => self.handle_send(frame, out),
                Command::Subscribe => self.handle_subscribe(frame, out),
                Command::Unsubscribe => self.handle_unsubscribe(frame, out),
                Command::Ack => self.handle_ack(frame, out),
                Command::Nack => self.handle_nack(frame, out),
                other @ (Command::Connect
                | Command::Stomp
                | Command::Connected
                | Command::Message
                | Command::Receipt
                | Command::Error) => Err(Error::UnexpectedCommand(other)),
            },
        }
    }

    fn handle_connect(&mut self, frame: Frame, out: &mut Outbox) -> Result<Flow> {
        if frame.headers.get_receipt().is_some() {
            return Err(Error::ReceiptInConnect);
        }

        let login = frame.headers.get_login().map_or("", |header::Login(login)| login);
        let passcode = frame
            .headers
            .get_passcode()
            .map_or("", |header::Passcode(passcode)| passcode);
        if !self.config.authenticate(login, passcode) {
            return Err(Error::AuthenticationFailed);
        }

        let version = negotiate_version(&frame)?;
        let HeartBeat(cx, cy) = match frame.headers.get_heart_beat() {
            Some(heart_beat) => heart_beat?,
            None => HeartBeat(0, 0),
        };
        let min_ms = min_heart_beat_ms(self.config.as_ref());
        let (cx, cy) = (clamp_heart_beat(cx, min_ms), clamp_heart_beat(cy, min_ms));

        self.version = version;
        self.write_timeout = match cy {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        self.login = Some(login.to_owned()).filter(|login| !login.is_empty());

        let mut connected = Frame::connected(version, SERVER_NAME, HeartBeat(cy, cx));
        connected
            .headers
            .push(Header::new("session", &format!("session/{}", self.id)));
        out.frames.push(connected);

        self.state = State::Connected;
        out.requests.push(Request::Connected(ClientHandle {
            id: self.id,
            peer: self.peer.clone(),
            login: self.login.clone(),
            counters: self.counters.clone(),
        }));
        debug!(
            "[{}] connected with STOMP {}, heart-beat {},{}",
            self.id, version, cy, cx
        );
        Ok(Flow::Continue)
    }

    /// Answers a `receipt` header straight away and removes it.
    fn send_receipt(&self, frame: &mut Frame, out: &mut Outbox) {
        if let Some(receipt) = frame.headers.remove("receipt") {
            out.frames.push(Frame::receipt(&receipt));
        }
    }

    fn handle_disconnect(&mut self, mut frame: Frame, out: &mut Outbox) -> Result<Flow> {
        self.send_receipt(&mut frame, out);
        Ok(Flow::Disconnect)
    }

    fn handle_begin(&mut self, mut frame: Frame, out: &mut Outbox) -> Result<Flow> {
        let tx = transaction_of(&frame)?;
        self.send_receipt(&mut frame, out);
        self.tx_store.begin(&tx)?;
        Ok(Flow::Continue)
    }

    fn handle_commit(&mut self, mut frame: Frame, out: &mut Outbox) -> Result<Flow> {
        let tx = transaction_of(&frame)?;
        self.send_receipt(&mut frame, out);
        // Frames replayed before a failure stay applied.
        for buffered in self.tx_store.commit(&tx)? {
            self.dispatch(buffered, out)?;
        }
        Ok(Flow::Continue)
    }

    fn handle_abort(&mut self, mut frame: Frame, out: &mut Outbox) -> Result<Flow> {
        let tx = transaction_of(&frame)?;
        self.send_receipt(&mut frame, out);
        self.tx_store.abort(&tx)?;
        Ok(Flow::Continue)
    }

    fn handle_send(&mut self, mut frame: Frame, out: &mut Outbox) -> Result<Flow> {
        destination_of(&frame)?;
        self.send_receipt(&mut frame, out);
        match frame.headers.get_transaction().map(|header::Transaction(tx)| tx.to_owned()) {
            Some(tx) => self.tx_store.add(&tx, frame)?,
            None => {
                frame.command = Command::Message;
                out.requests.push(Request::Enqueue(frame));
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_subscribe(&mut self, mut frame: Frame, out: &mut Outbox) -> Result<Flow> {
        let id = id_of(&frame)?;
        let destination = destination_of(&frame)?;
        let ack_mode: AckMode = frame.headers.get_ack().map_or("", |header::Ack(ack)| ack).parse()?;
        if self.subs.contains_key(&id) {
            return Err(Error::SubscriptionExists(id));
        }
        self.send_receipt(&mut frame, out);

        self.last_serial += 1;
        let sub = Subscription::new(
            &id,
            &destination,
            ack_mode,
            self.id,
            self.last_serial,
            self.topic.clone(),
            self.queue.clone(),
            self.counters.clone(),
        );
        debug!("[{}] subscribed {} to {}", self.id, id, destination);
        self.subs.insert(id, sub.clone());
        out.requests.push(Request::Subscribe(sub));
        Ok(Flow::Continue)
    }

    fn handle_unsubscribe(&mut self, mut frame: Frame, out: &mut Outbox) -> Result<Flow> {
        let id = id_of(&frame)?;
        let sub = self
            .subs
            .remove(&id)
            .ok_or_else(|| Error::SubscriptionNotFound(id.clone()))?;
        self.send_receipt(&mut frame, out);
        debug!("[{}] unsubscribed {}", self.id, id);
        out.requests.push(Request::Unsubscribe(sub));
        for pending in self.sub_list.remove(&id) {
            out.requests.push(Request::Requeue(pending.frame));
        }
        Ok(Flow::Continue)
    }

    /// The message id an ACK or NACK refers to.
    fn target_message_id(&self, frame: &Frame) -> Result<u64> {
        let keys: &[&'static str] = match self.version {
            StompVersion::Stomp_v1_2 => &["id", "ack", "message-id"],
            _ => &["message-id", "ack"],
        };
        let value = keys
            .iter()
            .find_map(|key| frame.headers.get(key))
            .ok_or(Error::MissingHeader(keys[0]))?;
        value
            .parse::<u64>()
            .map_err(|_| Error::InvalidHeader(format!("message id {:?}", value)))
    }

    fn handle_ack(&mut self, mut frame: Frame, out: &mut Outbox) -> Result<Flow> {
        let message_id = self.target_message_id(&frame)?;
        self.send_receipt(&mut frame, out);
        match frame.headers.get_transaction().map(|header::Transaction(tx)| tx.to_owned()) {
            Some(tx) => self.tx_store.add(&tx, frame)?,
            None => {
                for pending in self.sub_list.ack(message_id) {
                    out.requests.push(Request::Subscribe(pending.subscription));
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_nack(&mut self, mut frame: Frame, out: &mut Outbox) -> Result<Flow> {
        let message_id = self.target_message_id(&frame)?;
        self.send_receipt(&mut frame, out);
        match frame.headers.get_transaction().map(|header::Transaction(tx)| tx.to_owned()) {
            Some(tx) => self.tx_store.add(&tx, frame)?,
            None => {
                if let Some(pending) = self.sub_list.nack(message_id) {
                    out.requests.push(Request::Requeue(pending.frame));
                    out.requests.push(Request::Subscribe(pending.subscription));
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Stamps a MESSAGE with the next message id. Only subscriptions that
    /// must acknowledge get an `ack` header.
    fn allocate_message_id(&mut self, frame: &mut Frame, ack_mode: AckMode) -> u64 {
        self.last_message_id += 1;
        let message_id = self.last_message_id.to_string();
        frame.headers.set("message-id", &message_id);
        if ack_mode == AckMode::Auto {
            frame.headers.remove("ack");
        } else {
            frame.headers.set("ack", &message_id);
        }
        self.last_message_id
    }

    /// Prepares a topic frame for the wire, or drops it if its
    /// subscription has since gone.
    pub fn topic_frame(&mut self, mut frame: Frame) -> Option<Frame> {
        let ack_mode = match frame.headers.get_subscription() {
            Some(header::Subscription(id)) => self.subs.get(id).map(Subscription::ack_mode),
            None => None,
        };
        match ack_mode {
            Some(ack_mode) => {
                self.allocate_message_id(&mut frame, ack_mode);
                Some(frame)
            }
            None => {
                if self.config.is_debug() {
                    debug!("[{}] dropping frame for a closed subscription", self.id);
                }
                None
            }
        }
    }

    /// Writes a queue frame to its subscription, or sends it back to the
    /// router if that subscription is no longer live.
    pub fn deliver(&mut self, delivery: QueueDelivery, out: &mut Outbox) {
        let QueueDelivery {
            subscription,
            mut frame,
        } = delivery;
        let live = self
            .subs
            .get(subscription.id())
            .map_or(false, |sub| sub.serial() == subscription.serial());
        if !live {
            out.requests.push(Request::Requeue(frame));
            return;
        }

        let held = frame.clone();
        let message_id = self.allocate_message_id(&mut frame, subscription.ack_mode());
        out.frames.push(frame);
        if subscription.ack_mode() == AckMode::Auto {
            out.requests.push(Request::Subscribe(subscription));
        } else {
            self.sub_list.add(Pending {
                subscription,
                message_id,
                frame: held,
            });
        }
    }

    /// First stage of teardown: forgets transactions, unsubscribes every
    /// live subscription and requeues every unacknowledged frame.
    pub fn cleanup(&mut self, out: &mut Outbox) {
        self.tx_store.init();
        for (_, sub) in self.subs.drain() {
            out.requests.push(Request::Unsubscribe(sub));
        }
        while let Some(pending) = self.sub_list.get() {
            out.requests.push(Request::Requeue(pending.frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::{ServerConfig, Settings};
    use crate::server::StaticAuthenticator;

    struct Fixture {
        session: Session,
        topic_rx: mpsc::Receiver<Frame>,
        queue_rx: mpsc::UnboundedReceiver<QueueDelivery>,
    }

    fn fixture_with(config: ServerConfig, authenticator: Option<StaticAuthenticator>) -> Fixture {
        let authenticator =
            authenticator.map(|a| Arc::new(a) as Arc<dyn crate::server::Authenticator>);
        let settings = Arc::new(Settings::new(config, authenticator));
        let (topic, topic_rx) = mpsc::channel(4);
        let (queue, queue_rx) = mpsc::unbounded_channel();
        Fixture {
            session: Session::new(
                1,
                "127.0.0.1:9",
                settings,
                topic,
                queue,
                Arc::new(Counters::default()),
            ),
            topic_rx,
            queue_rx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            ServerConfig {
                heart_beat: Duration::from_millis(1000),
                ..ServerConfig::default()
            },
            None,
        )
    }

    fn connect_frame(accept_version: Option<&str>, heart_beat: &str) -> Frame {
        let mut frame = Frame::with_headers(Command::Connect, header_list!["heart-beat" => heart_beat]);
        if let Some(accept_version) = accept_version {
            frame
                .headers
                .push(Header::new("accept-version", accept_version));
        }
        frame
    }

    fn dispatch(session: &mut Session, frame: Frame) -> (Result<Flow>, Outbox) {
        let mut out = Outbox::default();
        let result = session.dispatch(frame, &mut out);
        (result, out)
    }

    fn connected() -> Fixture {
        let mut f = fixture();
        let (result, _) = dispatch(&mut f.session, connect_frame(Some("1.1,1.2"), "0,0"));
        assert_eq!(Flow::Continue, result.unwrap());
        f
    }

    fn with_header(mut frame: Frame, key: &str, value: &str) -> Frame {
        frame.headers.push(Header::new(key, value));
        frame
    }

    fn subscribe(session: &mut Session, id: &str, destination: &str, ack: AckMode) -> Subscription {
        let (result, mut out) = dispatch(session, Frame::subscribe(id, destination, ack));
        result.unwrap();
        match out.requests.pop() {
            Some(Request::Subscribe(sub)) => sub,
            other => panic!("expected a subscribe request, got {:?}", other),
        }
    }

    fn queue_message(sub: &Subscription, body: &str) -> QueueDelivery {
        let mut frame = Frame::send(sub.destination(), body.as_bytes());
        frame.command = Command::Message;
        frame.headers.set("subscription", sub.id());
        QueueDelivery {
            subscription: sub.clone(),
            frame,
        }
    }

    #[test]
    fn connect_negotiates_highest_common_version() {
        let mut f = fixture();
        let (result, out) = dispatch(&mut f.session, connect_frame(Some("1.0,1.1,1.2"), "0,0"));
        assert_eq!(Flow::Continue, result.unwrap());
        assert_eq!(State::Connected, f.session.state());
        assert_eq!(StompVersion::Stomp_v1_2, f.session.version());

        let connected = &out.frames[0];
        assert_eq!(Command::Connected, connected.command);
        assert_eq!(Some("1.2"), connected.headers.get("version"));
        assert_eq!(Some(SERVER_NAME), connected.headers.get("server"));
        assert_eq!(Some("session/1"), connected.headers.get("session"));
        assert!(matches!(out.requests[..], [Request::Connected(ref h)] if h.id == 1));

        let mut f = fixture();
        dispatch(&mut f.session, connect_frame(Some("1.1"), "0,0")).0.unwrap();
        assert_eq!(StompVersion::Stomp_v1_1, f.session.version());
    }

    #[test]
    fn version_one_zero_is_rejected() {
        for accept in [Some("1.0"), None, Some("2.0")] {
            let mut f = fixture();
            let (result, out) = dispatch(&mut f.session, connect_frame(accept, "0,0"));
            assert!(matches!(result, Err(Error::UnsupportedVersion(_))), "{:?}", accept);
            assert!(out.frames.is_empty());
            assert_eq!(State::Connecting, f.session.state());
        }
    }

    #[test]
    fn heart_beats_are_clamped_but_zero_is_kept() {
        let mut f = fixture();
        let (result, out) = dispatch(&mut f.session, connect_frame(Some("1.2"), "10,20"));
        result.unwrap();
        assert_eq!(Some("1000,1000"), out.frames[0].headers.get("heart-beat"));
        assert_eq!(Some(Duration::from_millis(1000)), f.session.write_timeout());

        let mut f = fixture();
        let (result, out) = dispatch(&mut f.session, connect_frame(Some("1.2"), "0,5000"));
        result.unwrap();
        // CONNECTED echoes "cy,cx".
        assert_eq!(Some("5000,0"), out.frames[0].headers.get("heart-beat"));
        assert_eq!(Some(Duration::from_millis(5000)), f.session.write_timeout());

        let mut f = fixture();
        let (result, _) = dispatch(&mut f.session, connect_frame(Some("1.2"), "0,0"));
        result.unwrap();
        assert_eq!(None, f.session.write_timeout());

        assert_eq!(0, clamp_heart_beat(0, 1000));
        assert_eq!(1000, clamp_heart_beat(1, 1000));
        assert_eq!(1500, clamp_heart_beat(1500, 1000));
    }

    #[test]
    fn malformed_heart_beat_is_rejected() {
        let mut f = fixture();
        let (result, _) = dispatch(&mut f.session, connect_frame(Some("1.2"), "fast"));
        assert!(matches!(result, Err(Error::InvalidHeartBeat(_))));
    }

    #[test]
    fn receipt_in_connect_is_rejected() {
        let mut f = fixture();
        let frame = with_header(connect_frame(Some("1.2"), "0,0"), "receipt", "r1");
        let (result, _) = dispatch(&mut f.session, frame);
        assert!(matches!(result, Err(Error::ReceiptInConnect)));
    }

    #[test]
    fn credentials_are_checked() {
        let users = StaticAuthenticator::new().with_user("guest", "secret");
        let mut f = fixture_with(ServerConfig::default(), Some(users.clone()));
        let frame = with_header(connect_frame(Some("1.2"), "0,0"), "login", "guest");
        let frame = with_header(frame, "passcode", "wrong");
        let (result, _) = dispatch(&mut f.session, frame);
        assert!(matches!(result, Err(Error::AuthenticationFailed)));

        let mut f = fixture_with(ServerConfig::default(), Some(users));
        let frame = with_header(connect_frame(Some("1.2"), "0,0"), "login", "guest");
        let frame = with_header(frame, "passcode", "secret");
        let (result, out) = dispatch(&mut f.session, frame);
        result.unwrap();
        assert!(matches!(
            out.requests[..],
            [Request::Connected(ref h)] if h.login.as_deref() == Some("guest")
        ));
    }

    #[test]
    fn state_table_rejects_out_of_place_commands() {
        let mut f = fixture();
        let (result, _) = dispatch(&mut f.session, Frame::send("/queue/a", b""));
        assert!(matches!(result, Err(Error::NotConnected)));

        let mut f = connected();
        for command in [Command::Connect, Command::Stomp, Command::Message, Command::Receipt] {
            let (result, _) = dispatch(&mut f.session, Frame::new(command));
            assert!(matches!(result, Err(Error::UnexpectedCommand(c)) if c == command));
        }
    }

    #[test]
    fn send_becomes_message_after_receipt() {
        let mut f = connected();
        let frame = with_header(Frame::send("/queue/a", b"hi"), "receipt", "r-7");
        let (result, out) = dispatch(&mut f.session, frame);
        assert_eq!(Flow::Continue, result.unwrap());
        assert_eq!(Command::Receipt, out.frames[0].command);
        assert_eq!(Some("r-7"), out.frames[0].headers.get("receipt-id"));
        match &out.requests[..] {
            [Request::Enqueue(message)] => {
                assert_eq!(Command::Message, message.command);
                assert!(!message.headers.contains("receipt"));
                assert_eq!(b"hi".to_vec(), message.body);
            }
            other => panic!("unexpected requests {:?}", other),
        }

        let (result, _) = dispatch(&mut f.session, Frame::new(Command::Send));
        assert!(matches!(result, Err(Error::MissingHeader("destination"))));
    }

    #[test]
    fn duplicate_subscription_is_rejected() {
        let mut f = connected();
        subscribe(&mut f.session, "s1", "/queue/a", AckMode::Auto);
        let (result, _) = dispatch(&mut f.session, Frame::subscribe("s1", "/queue/b", AckMode::Auto));
        assert!(matches!(result, Err(Error::SubscriptionExists(ref id)) if id == "s1"));

        let (result, _) = dispatch(&mut f.session, Frame::unsubscribe("nope"));
        assert!(matches!(result, Err(Error::SubscriptionNotFound(_))));

        let bad_ack = with_header(Frame::with_headers(Command::Subscribe, header_list!["id" => "s2", "destination" => "/queue/a"]), "ack", "sometimes");
        let (result, _) = dispatch(&mut f.session, bad_ack);
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn committed_transaction_enqueues_in_order() {
        let mut f = connected();
        let in_tx = |frame: Frame| with_header(frame, "transaction", "t");
        dispatch(&mut f.session, Frame::begin("t")).0.unwrap();
        let (_, out) = dispatch(&mut f.session, in_tx(Frame::send("/queue/a", b"a")));
        assert!(out.requests.is_empty());
        dispatch(&mut f.session, in_tx(Frame::send("/queue/b", b"b"))).0.unwrap();

        let (result, out) = dispatch(&mut f.session, Frame::commit("t"));
        result.unwrap();
        let bodies: Vec<&[u8]> = out
            .requests
            .iter()
            .map(|request| match request {
                Request::Enqueue(frame) => {
                    assert!(!frame.headers.contains("transaction"));
                    &frame.body[..]
                }
                other => panic!("unexpected request {:?}", other),
            })
            .collect();
        assert_eq!(vec![&b"a"[..], &b"b"[..]], bodies);

        let (result, _) = dispatch(&mut f.session, Frame::commit("t"));
        assert!(matches!(result, Err(Error::TransactionUnknown(_))));
    }

    #[test]
    fn aborted_transaction_enqueues_nothing() {
        let mut f = connected();
        dispatch(&mut f.session, Frame::begin("t")).0.unwrap();
        let (result, _) = dispatch(&mut f.session, Frame::begin("t"));
        assert!(matches!(result, Err(Error::TransactionInProgress(_))));
        let send = with_header(Frame::send("/queue/a", b"a"), "transaction", "t");
        dispatch(&mut f.session, send).0.unwrap();
        let (result, out) = dispatch(&mut f.session, Frame::abort("t"));
        result.unwrap();
        assert!(out.requests.is_empty());

        let send = with_header(Frame::send("/queue/a", b"a"), "transaction", "t");
        let (result, _) = dispatch(&mut f.session, send);
        assert!(matches!(result, Err(Error::TransactionUnknown(_))));

        let (result, _) = dispatch(&mut f.session, Frame::new(Command::Begin));
        assert!(matches!(result, Err(Error::MissingHeader("transaction"))));
    }

    #[test]
    fn client_ack_frees_the_subscription_for_the_next_frame() {
        let mut f = connected();
        let sub = subscribe(&mut f.session, "s1", "/queue/a", AckMode::Client);

        let mut out = Outbox::default();
        f.session.deliver(queue_message(&sub, "one"), &mut out);
        let written = &out.frames[0];
        assert_eq!(Some("1"), written.headers.get("message-id"));
        assert_eq!(Some("1"), written.headers.get("ack"));
        assert_eq!(Some("s1"), written.headers.get("subscription"));
        // Held until acknowledged: the router hears nothing yet.
        assert!(out.requests.is_empty());

        let ack = Frame::with_headers(Command::Ack, header_list!["id" => "1"]);
        let (result, out) = dispatch(&mut f.session, ack);
        result.unwrap();
        assert!(matches!(out.requests[..], [Request::Subscribe(ref s)] if s.id() == "s1"));

        // A second ack for the same id frees nothing.
        let ack = Frame::with_headers(Command::Ack, header_list!["id" => "1"]);
        let (_, out) = dispatch(&mut f.session, ack);
        assert!(out.requests.is_empty());
    }

    #[test]
    fn nack_requeues_then_frees() {
        let mut f = connected();
        let sub = subscribe(&mut f.session, "s1", "/queue/a", AckMode::ClientIndividual);
        let mut out = Outbox::default();
        f.session.deliver(queue_message(&sub, "one"), &mut out);

        let nack = Frame::with_headers(Command::Nack, header_list!["id" => "1", "receipt" => "r"]);
        let (result, out) = dispatch(&mut f.session, nack);
        result.unwrap();
        assert_eq!(Command::Receipt, out.frames[0].command);
        match &out.requests[..] {
            [Request::Requeue(frame), Request::Subscribe(s)] => {
                assert_eq!(b"one".to_vec(), frame.body);
                assert_eq!(sub.serial(), s.serial());
            }
            other => panic!("unexpected requests {:?}", other),
        }
    }

    #[test]
    fn ack_requires_a_numeric_message_id() {
        let mut f = connected();
        let (result, _) = dispatch(&mut f.session, Frame::new(Command::Ack));
        assert!(matches!(result, Err(Error::MissingHeader("id"))));
        let ack = Frame::with_headers(Command::Ack, header_list!["id" => "abc"]);
        let (result, _) = dispatch(&mut f.session, ack);
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn auto_delivery_asks_for_more_without_ack_header() {
        let mut f = connected();
        let sub = subscribe(&mut f.session, "s1", "/queue/a", AckMode::Auto);
        let mut out = Outbox::default();
        let mut delivery = queue_message(&sub, "one");
        delivery.frame.headers.set("ack", "stale");
        f.session.deliver(delivery, &mut out);
        assert!(!out.frames[0].headers.contains("ack"));
        assert!(matches!(out.requests[..], [Request::Subscribe(_)]));
    }

    #[test]
    fn transactional_ack_waits_for_commit() {
        let mut f = connected();
        let sub = subscribe(&mut f.session, "s1", "/queue/a", AckMode::Client);
        let mut out = Outbox::default();
        f.session.deliver(queue_message(&sub, "one"), &mut out);

        dispatch(&mut f.session, Frame::begin("t")).0.unwrap();
        let ack = Frame::with_headers(Command::Ack, header_list!["id" => "1", "transaction" => "t"]);
        let (result, out) = dispatch(&mut f.session, ack);
        result.unwrap();
        assert!(out.requests.is_empty());

        let (result, out) = dispatch(&mut f.session, Frame::commit("t"));
        result.unwrap();
        assert!(matches!(out.requests[..], [Request::Subscribe(ref s)] if s.id() == "s1"));

        // Nothing is held any more, so teardown has nothing to requeue.
        let mut out = Outbox::default();
        f.session.cleanup(&mut out);
        assert!(matches!(out.requests[..], [Request::Unsubscribe(_)]));
    }

    #[test]
    fn aborted_nack_leaves_the_frame_held() {
        let mut f = connected();
        let sub = subscribe(&mut f.session, "s1", "/queue/a", AckMode::ClientIndividual);
        let mut out = Outbox::default();
        f.session.deliver(queue_message(&sub, "one"), &mut out);

        dispatch(&mut f.session, Frame::begin("t")).0.unwrap();
        let nack = Frame::with_headers(Command::Nack, header_list!["id" => "1", "transaction" => "t"]);
        let (result, out) = dispatch(&mut f.session, nack);
        result.unwrap();
        assert!(out.requests.is_empty());

        let (result, out) = dispatch(&mut f.session, Frame::abort("t"));
        result.unwrap();
        assert!(out.requests.is_empty());

        // Still held: a plain NACK afterwards requeues it.
        let nack = Frame::with_headers(Command::Nack, header_list!["id" => "1"]);
        let (result, out) = dispatch(&mut f.session, nack);
        result.unwrap();
        assert!(matches!(
            out.requests[..],
            [Request::Requeue(ref frame), Request::Subscribe(_)] if frame.body == b"one"
        ));
    }

    #[test]
    fn delivery_to_a_replaced_subscription_is_requeued() {
        let mut f = connected();
        let old = subscribe(&mut f.session, "s1", "/queue/a", AckMode::Client);
        dispatch(&mut f.session, Frame::unsubscribe("s1")).0.unwrap();
        subscribe(&mut f.session, "s1", "/queue/a", AckMode::Client);

        let mut out = Outbox::default();
        f.session.deliver(queue_message(&old, "late"), &mut out);
        assert!(out.frames.is_empty());
        assert!(matches!(out.requests[..], [Request::Requeue(ref frame)] if frame.body == b"late"));
    }

    #[test]
    fn unsubscribe_requeues_held_frames() {
        let mut f = connected();
        let sub = subscribe(&mut f.session, "s1", "/queue/a", AckMode::Client);
        let mut out = Outbox::default();
        f.session.deliver(queue_message(&sub, "held"), &mut out);

        let (result, out) = dispatch(&mut f.session, Frame::unsubscribe("s1"));
        result.unwrap();
        match &out.requests[..] {
            [Request::Unsubscribe(s), Request::Requeue(frame)] => {
                assert_eq!("s1", s.id());
                assert_eq!(b"held".to_vec(), frame.body);
            }
            other => panic!("unexpected requests {:?}", other),
        }
    }

    #[test]
    fn topic_frames_are_stamped_or_dropped() {
        let mut f = connected();
        subscribe(&mut f.session, "t1", "/topic/t", AckMode::Client);
        let mut frame = Frame::send("/topic/t", b"x");
        frame.command = Command::Message;
        frame.headers.set("subscription", "t1");
        let stamped = f.session.topic_frame(frame.clone()).unwrap();
        assert_eq!(Some("1"), stamped.headers.get("message-id"));
        assert_eq!(Some("1"), stamped.headers.get("ack"));

        frame.headers.set("subscription", "gone");
        assert!(f.session.topic_frame(frame).is_none());
        assert!(f.topic_rx.try_recv().is_err());
    }

    #[test]
    fn cleanup_unsubscribes_then_requeues() {
        let mut f = connected();
        let sub = subscribe(&mut f.session, "s1", "/queue/a", AckMode::Client);
        let mut out = Outbox::default();
        f.session.deliver(queue_message(&sub, "held"), &mut out);
        dispatch(&mut f.session, Frame::begin("t")).0.unwrap();

        let mut out = Outbox::default();
        f.session.cleanup(&mut out);
        assert!(matches!(
            out.requests[..],
            [Request::Unsubscribe(_), Request::Requeue(_)]
        ));
        let (result, _) = dispatch(&mut f.session, Frame::commit("t"));
        assert!(matches!(result, Err(Error::TransactionUnknown(_))));
        assert!(f.queue_rx.try_recv().is_err());
    }

    #[test]
    fn disconnect_receipts_and_stops() {
        let mut f = connected();
        let (result, out) = dispatch(&mut f.session, Frame::disconnect("bye"));
        assert_eq!(Flow::Disconnect, result.unwrap());
        assert_eq!(Some("bye"), out.frames[0].headers.get("receipt-id"));
    }
}
