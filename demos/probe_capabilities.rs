use dircon::{probe_capabilities, DEFAULT_DIRCON_PORT};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args
        .next()
        .and_then(|port| port.parse().ok())
        .unwrap_or(DEFAULT_DIRCON_PORT);

    info!("🔍 Probing DIRCON device at {}:{}", host, port);

    match probe_capabilities(&host, port).await {
        Some(capabilities) => {
            info!("✅ Device answered");
            for feature in capabilities.supported() {
                info!("  supports: {}", feature);
            }
        }
        None => error!("❌ Device could not be configured"),
    }
}
