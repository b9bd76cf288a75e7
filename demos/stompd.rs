use std::env;

use stompbox::server::{Server, ServerConfig, StaticAuthenticator};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(address) = env::args().nth(1) {
        config.address = address;
    }
    config.debug = env::var("STOMPD_DEBUG").is_ok();

    let mut server = Server::new(config);
    if let (Ok(login), Ok(passcode)) = (env::var("STOMPD_LOGIN"), env::var("STOMPD_PASSCODE")) {
        server = server.with_authenticator(StaticAuthenticator::new().with_user(&login, &passcode));
    }

    if let Err(error) = server.listen_and_serve().await {
        eprintln!("stompd: {}", error);
        std::process::exit(1);
    }
}
