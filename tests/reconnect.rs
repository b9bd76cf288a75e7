use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stompbox::server::{Server, ServerConfig, ServerHandle};
use stompbox::{AckMode, BackoffUnit, ConnectTimeout, Connection, RetryLimit, SessionBuilder, Subscription, WithReceipt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const PATIENCE: Duration = Duration::from_secs(5);

/// Forwards loopback connections to the broker and can sever them.
struct Proxy {
    address: SocketAddr,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
    silent: Arc<AtomicBool>,
    accept: JoinHandle<()>,
}

impl Proxy {
    async fn start(upstream: SocketAddr) -> Proxy {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let links = Arc::new(Mutex::new(Vec::new()));
        let silent = Arc::new(AtomicBool::new(false));
        let accept = tokio::spawn({
            let links = links.clone();
            let silent = silent.clone();
            async move {
                let mut held = Vec::new();
                while let Ok((mut inbound, _)) = listener.accept().await {
                    if silent.load(Ordering::SeqCst) {
                        held.push(inbound);
                        continue;
                    }
                    let mut outbound = match TcpStream::connect(upstream).await {
                        Ok(outbound) => outbound,
                        Err(_) => continue,
                    };
                    let link = tokio::spawn(async move {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    });
                    links.lock().unwrap().push(link);
                }
            }
        });
        Proxy {
            address,
            links,
            silent,
            accept,
        }
    }

    /// Drops every forwarded connection; new ones are still accepted.
    fn cut(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }

    /// New connections are accepted but never answered.
    fn silence(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    /// Stops listening, then drops every forwarded connection.
    async fn stop(mut self) {
        self.accept.abort();
        let _ = (&mut self.accept).await;
        self.cut();
    }
}

async fn start_server() -> ServerHandle {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    Server::new(ServerConfig::default()).start(listener).unwrap()
}

async fn dial_through(proxy: &Proxy, retry_limit: u32) -> Connection {
    SessionBuilder::new()
        .with(BackoffUnit(Duration::from_millis(10)))
        .with(RetryLimit(retry_limit))
        .dial(&proxy.address.to_string())
        .await
        .unwrap()
}

async fn subscribe(connection: &Connection, destination: &str) -> Subscription {
    connection
        .subscription(destination)
        .with(AckMode::Auto)
        .with(WithReceipt)
        .start()
        .await
        .unwrap()
}

async fn publish(connection: &Connection, destination: &str, body: &str) {
    connection
        .message(destination, body)
        .with(WithReceipt)
        .send()
        .await
        .unwrap();
}

async fn read_text(subscription: &mut Subscription) -> String {
    let message = timeout(PATIENCE, subscription.read())
        .await
        .expect("no message in time")
        .unwrap();
    String::from_utf8(message.body).unwrap()
}

#[tokio::test]
async fn session_survives_a_lost_transport() {
    let server = start_server().await;
    let proxy = Proxy::start(server.local_addr()).await;
    let publisher = SessionBuilder::new()
        .dial(&server.local_addr().to_string())
        .await
        .unwrap();
    let consumer = dial_through(&proxy, 10).await;
    let mut sub = subscribe(&consumer, "/queue/durable").await;
    let first_session = consumer.session();

    publish(&publisher, "/queue/durable", "before").await;
    assert_eq!("before", read_text(&mut sub).await);

    proxy.cut();

    // The old connection must be gone and the replayed SUBSCRIBE in place.
    let mut replaced = false;
    for _ in 0..500 {
        let status = server.status().await.unwrap();
        let resubscribed = status
            .queue("/queue/durable")
            .map_or(false, |queue| queue.subscription_count == 1);
        if status.disconnect_count == 1 && status.clients.len() == 2 && resubscribed {
            let client = status
                .clients
                .iter()
                .find(|client| !client.subscriptions.is_empty())
                .unwrap();
            assert_eq!(sub.id(), client.subscriptions[0].id);
            replaced = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(replaced, "consumer never came back");
    assert_ne!(first_session, consumer.session());
    assert!(sub.active());

    publish(&publisher, "/queue/durable", "after").await;
    assert_eq!("after", read_text(&mut sub).await);

    publish(&consumer, "/queue/durable", "from the consumer").await;
    assert_eq!("from the consumer", read_text(&mut sub).await);
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn session_ends_when_retries_run_out() {
    let server = start_server().await;
    let proxy = Proxy::start(server.local_addr()).await;
    let consumer = dial_through(&proxy, 2).await;
    let mut sub = subscribe(&consumer, "/topic/gone").await;

    proxy.stop().await;

    let outcome = timeout(PATIENCE, sub.read()).await.expect("read never failed");
    assert!(outcome.is_err());

    let mut closed = false;
    for _ in 0..500 {
        if consumer.is_closed() {
            closed = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(closed);
    assert!(consumer.message("/topic/gone", "late").send().await.is_err());
}

#[tokio::test]
async fn unanswered_handshakes_count_as_failed_attempts() {
    let server = start_server().await;
    let proxy = Proxy::start(server.local_addr()).await;
    let consumer = SessionBuilder::new()
        .with(BackoffUnit(Duration::from_millis(10)))
        .with(RetryLimit(2))
        .with(ConnectTimeout(Duration::from_millis(100)))
        .dial(&proxy.address.to_string())
        .await
        .unwrap();
    let mut sub = subscribe(&consumer, "/topic/mute").await;

    proxy.silence();
    proxy.cut();

    let outcome = timeout(PATIENCE, sub.read()).await.expect("read never failed");
    assert!(outcome.is_err());
    for _ in 0..500 {
        if consumer.is_closed() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(consumer.is_closed());
    proxy.stop().await;
}
