use dircon::{DeviceConfig, DirconDevice, SessionStatus, DEFAULT_DIRCON_PORT};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info};

#[tokio::main]
async fn main() -> dircon::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let speed: f64 = args
        .next()
        .and_then(|speed| speed.parse().ok())
        .unwrap_or(5.0);

    info!("🏃 DIRCON Speed Control Example");

    let treadmill = DirconDevice::configure(
        DeviceConfig::new(host, DEFAULT_DIRCON_PORT),
        |_| {},
        |status| info!("🔌 Status: {}", status),
    );
    let mut status = treadmill.session().status_watch();

    treadmill.start_streaming().await;
    let connected = timeout(
        Duration::from_secs(30),
        status.wait_for(|status| *status == SessionStatus::Connected),
    )
    .await
    .is_ok_and(|result| result.is_ok());
    if !connected {
        error!("❌ Device did not connect");
        treadmill.stop().await;
        return Err(dircon::DirconError::NotConnected);
    }

    info!("⚡ Setting speed to {:.1} km/h...", speed);
    treadmill.try_write("speed", speed).await?;
    info!("✅ Speed set");

    sleep(Duration::from_secs(10)).await;

    info!("📉 Slowing down...");
    treadmill.try_write("speed", 0.0).await?;

    treadmill.stop().await;
    Ok(())
}
