use stompbox::{AckMode, Credentials, Header, HeartBeat, SessionBuilder, SuppressedHeader, WithReceipt};

#[tokio::main]
async fn main() {
    env_logger::init();

    println!("Setting up client.");
    let connection = SessionBuilder::new()
        .with(Header::new("custom-client-id", "hmspna4"))
        .with(SuppressedHeader("content-length"))
        .with(HeartBeat(5_000, 2_000))
        .with(Credentials("sullivan", "m1k4d0"))
        .dial("127.0.0.1:61613")
        .await
        .expect("failed to connect");
    println!(
        "Session {:?} established with {:?}.",
        connection.session(),
        connection.server()
    );

    let destination = "/topic/modern_major_general";
    let mut subscription = connection
        .subscription(destination)
        .with(AckMode::Auto)
        .with(Header::new("custom-subscription-header", "lozenge"))
        .with(WithReceipt)
        .start()
        .await
        .expect("failed to subscribe");
    println!("Subscribed to '{}'.", destination);

    for body in &["Animal", "Vegetable", "Mineral"] {
        connection
            .message(destination, *body)
            .send()
            .await
            .expect("failed to send");
    }

    for _ in 0..3 {
        match subscription.read().await {
            Ok(message) => println!(
                "Another droll reference!: '{}'",
                String::from_utf8_lossy(&message.body)
            ),
            Err(error) => {
                println!("Something went horribly wrong: {}", error);
                break;
            }
        }
    }

    connection.disconnect().await.expect("failed to disconnect");
}
