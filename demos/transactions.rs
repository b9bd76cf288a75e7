use stompbox::{AckMode, SessionBuilder};

#[tokio::main]
async fn main() {
    env_logger::init();

    let destination = "/queue/messages";
    let connection = match SessionBuilder::new().dial("127.0.0.1:61613").await {
        Ok(connection) => connection,
        Err(error) => panic!("Could not connect to the server: {}", error),
    };

    let mut subscription = connection
        .subscription(destination)
        .with(AckMode::ClientIndividual)
        .start()
        .await
        .expect("failed to subscribe");

    let mut transaction = connection.begin().await.expect("failed to begin");
    for body in &["Animal", "Vegetable", "Mineral"] {
        transaction
            .message(destination, *body)
            .expect("transaction already finished")
            .send()
            .await
            .expect("failed to send");
    }
    transaction.commit().await.expect("failed to commit");

    for message_count in 1..=3 {
        let message = subscription.read().await.expect("subscription ended");
        println!(
            "Received message #{}: {}",
            message_count,
            String::from_utf8_lossy(&message.body)
        );
        connection.ack(&message).await.expect("failed to ack");
    }

    connection.disconnect().await.expect("failed to disconnect");
}
