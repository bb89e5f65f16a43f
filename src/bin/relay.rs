//! Relay-Binary
//!
//! Startet das Rendezvous-Relay auf der per Argument oder
//! `FUNKRUF_BIND` übergebenen Adresse (Default 0.0.0.0:8443).

use funkruf::relay::{LogPushNotifier, Relay};
use funkruf::RelayConfig;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging initialisieren
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("funkruf=debug".parse()?)
                .add_directive("relay=debug".parse()?),
        )
        .init();

    let bind_addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FUNKRUF_BIND").ok())
        .unwrap_or_else(|| "0.0.0.0:8443".to_string());

    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Starting relay on {}", bind_addr);

    let relay = Relay::new(RelayConfig::default(), Arc::new(LogPushNotifier));
    relay.run(listener).await;
    Ok(())
}
