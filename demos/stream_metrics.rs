use dircon::{probe_capabilities, DeviceConfig, DirconDevice, DEFAULT_DIRCON_PORT};
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{info, warn};

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

    info!("📊 DIRCON Metric Stream Example");

    let mut config = DeviceConfig::new(host.as_str(), port);
    match probe_capabilities(&host, port).await {
        Some(features) => config = config.with_features(features),
        None => warn!("⚠️ Capability probe failed, reporting every metric"),
    }

    let treadmill = DirconDevice::configure(
        config,
        |metrics| {
            for (metric, value) in metrics.iter() {
                info!("  {}: {:.2}", metric, value);
            }
        },
        |status| info!("🔌 Status: {}", status),
    );

    treadmill.start_streaming().await;
    info!("Press Ctrl+C to stop");

    let mut report = interval(Duration::from_secs(10));
    let started = Instant::now();
    let mut enabled = treadmill.enabled_watch();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = enabled.wait_for(|enabled| !*enabled) => {
                warn!("❌ Giving up on the device");
                break;
            }
            _ = report.tick() => {
                let state = treadmill.state();
                info!(
                    "⏱️ {}s, connected: {}, pace: {}",
                    started.elapsed().as_secs(),
                    state.connected,
                    state
                        .pace()
                        .map_or_else(|| "-".to_string(), |pace| format!("{}:{:02}/km", pace / 60, pace % 60))
                );
            }
        }
    }

    treadmill.stop().await;
    info!("✅ Stopped");
}
