use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    error::{DirconError, Result},
    metrics::{encode_control_write, CapabilityParser, MetricDecoder},
    session::DirconSession,
    supervisor::{disabled, SessionRunner, Supervisor},
    types::{
        CapabilitySet, DeviceConfig, DeviceState, Metric, MetricSnapshot, RunTargets,
        SessionConfig, SessionStatus,
    },
    FTMS_CONTROL_POINT,
};

/// Streaming runs driven by the supervisor
struct StreamingRun {
    session: Arc<DirconSession>,
    targets: RunTargets,
}

#[async_trait]
impl SessionRunner for StreamingRun {
    async fn run_once(&self, mut enabled: watch::Receiver<bool>) -> bool {
        self.session
            .run_until(&self.targets, async move { disabled(&mut enabled).await })
            .await
    }

    async fn close(&self) {
        self.session.close().await;
    }
}

/// Handle to one configured DIRCON treadmill
///
/// `DirconDevice` ties a [`DirconSession`], a [`MetricDecoder`] and a
/// [`Supervisor`] together. Once streaming is started it keeps a connection
/// to the device, reconnecting after failures, and reports every decoded
/// metric update and status transition to the callbacks given to
/// [`configure`](DirconDevice::configure).
///
/// # Features
///
/// - **Metric streaming**: FTMS Treadmill Data and RSC Measurement decoded into
///   speed, incline, distance, cadence, heart rate, stride and elapsed time
/// - **Feature gating**: metrics and control writes outside the configured
///   [`CapabilitySet`] are dropped or rejected
/// - **Control**: target speed and incline through the FTMS control point
/// - **Resilience**: bounded reconnect loop that disables itself after
///   repeated failures
///
/// # Examples
///
/// ```no_run
/// use dircon::{DeviceConfig, DirconDevice, Metric};
///
/// #[tokio::main]
/// async fn main() {
///     let device = DirconDevice::configure(
///         DeviceConfig::new("192.168.1.40", 36866),
///         |metrics| {
///             if let Some(speed) = metrics.get(Metric::Speed) {
///                 println!("speed: {speed:.2} km/h");
///             }
///         },
///         |status| println!("status: {status}"),
///     );
///
///     device.start_streaming().await;
///     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
///     device.stop().await;
/// }
/// ```
pub struct DirconDevice {
    config: DeviceConfig,
    session: Arc<DirconSession>,
    supervisor: Supervisor,
    state: Arc<RwLock<DeviceState>>,
}

impl std::fmt::Debug for DirconDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirconDevice")
            .field("config", &self.config)
            .field("session", &self.session)
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl DirconDevice {
    /// Configure a device without connecting to it
    ///
    /// `on_metric` receives every non-empty batch of decoded metrics that
    /// passes the feature filter; `on_status` receives every session status
    /// transition. Both run on the session task and must not block.
    pub fn configure<M, S>(config: DeviceConfig, on_metric: M, on_status: S) -> Self
    where
        M: Fn(&MetricSnapshot) + Send + Sync + 'static,
        S: Fn(SessionStatus) + Send + Sync + 'static,
    {
        info!("Configuring DIRCON device at {}", config.session.address());

        let session = Arc::new(DirconSession::new(config.session.clone()));
        let state = Arc::new(RwLock::new(DeviceState::default()));
        let decoder = Arc::new(Mutex::new(MetricDecoder::new()));

        {
            let decoder = Arc::clone(&decoder);
            let state = Arc::clone(&state);
            let features = config.features.clone();
            session.subscribe_characteristic(move |event| {
                let decoded = decoder
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .decode(event.uuid, &event.payload);
                let mut metrics = match decoded {
                    Ok(metrics) => metrics,
                    Err(e) => {
                        warn!("Dropping value of 0x{:04X}: {}", event.uuid, e);
                        return;
                    }
                };

                if let Some(features) = &features {
                    metrics.retain(|metric| features.supports(metric.feature()));
                }
                if metrics.is_empty() {
                    return;
                }

                debug!("Metrics update: {:?}", metrics);
                state
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .metrics
                    .merge(&metrics);
                on_metric(&metrics);
            });
        }

        {
            let state = Arc::clone(&state);
            session.subscribe_status(move |status| {
                if *status == SessionStatus::Connecting {
                    // New connection, possibly to different hardware
                    decoder
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .reset();
                }
                state.write().unwrap_or_else(PoisonError::into_inner).connected =
                    *status == SessionStatus::Connected;
                on_status(*status);
            });
        }

        let runner = Arc::new(StreamingRun {
            session: Arc::clone(&session),
            targets: RunTargets::streaming(),
        });
        let supervisor = Supervisor::new(runner, config.retry.clone());

        Self {
            config,
            session,
            supervisor,
            state,
        }
    }

    /// Device configuration
    #[must_use]
    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Underlying session, for raw characteristic listeners
    #[must_use]
    pub const fn session(&self) -> &Arc<DirconSession> {
        &self.session
    }

    /// Current session status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Snapshot of the running state
    #[must_use]
    pub fn state(&self) -> DeviceState {
        let mut state = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        state.enabled = self.supervisor.is_enabled();
        state
    }

    /// Whether streaming is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.supervisor.is_enabled()
    }

    /// Watch the enabled flag
    ///
    /// The flag turns `false` on [`stop`](DirconDevice::stop) and when the
    /// supervisor gives up after too many failed connections.
    #[must_use]
    pub fn enabled_watch(&self) -> watch::Receiver<bool> {
        self.supervisor.enabled_watch()
    }

    /// Start streaming in the background
    ///
    /// Returns immediately. Calling it while streaming is already enabled has
    /// no further effect.
    pub async fn start_streaming(&self) {
        info!("Starting streaming from {}", self.config.session.address());
        self.supervisor.enable().await;
    }

    /// Stop streaming and wait until the connection is closed
    pub async fn stop(&self) {
        info!("Stopping streaming from {}", self.config.session.address());
        self.supervisor.disable().await;
    }

    /// Set a target value on the device
    ///
    /// The value is encoded as an FTMS control point command and written to
    /// the Fitness Machine Control Point. The write is not acknowledged: the
    /// device echo arrives later as an ordinary characteristic value. On
    /// success the requested value is also stored in the running state.
    ///
    /// # Arguments
    ///
    /// * `name` - Metric name, `"speed"` or `"incline"`
    /// * `value` - Target in km/h for speed, in percent for incline
    ///
    /// # Feature Gating
    ///
    /// When the device was configured with a [`CapabilitySet`], both the
    /// metric itself and its control feature (`speed_set` / `incline_set`)
    /// must be enabled.
    ///
    /// # Errors
    ///
    /// Returns [`DirconError::UnsupportedOperation`] for metrics that cannot
    /// be set or whose features are not enabled,
    /// [`DirconError::InvalidParameters`] for values that cannot be encoded,
    /// [`DirconError::NotConnected`] unless the session is connected and
    /// [`DirconError::Disconnected`] if sending fails.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use dircon::{DeviceConfig, DirconDevice};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let device = DirconDevice::configure(
    ///         DeviceConfig::new("192.168.1.40", 36866),
    ///         |_| {},
    ///         |_| {},
    ///     );
    ///     device.start_streaming().await;
    ///
    ///     // once connected
    ///     device.try_write("speed", 6.5).await?;
    ///     device.try_write("incline", 2.0).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn try_write(&self, name: &str, value: f64) -> Result<()> {
        let metric: Metric = name.parse()?;

        if let Some(features) = &self.config.features {
            let control = metric.control_feature().ok_or_else(|| {
                DirconError::UnsupportedOperation(format!("{metric} cannot be written"))
            })?;
            // A control without its metric is not offered either
            for feature in [metric.feature(), control] {
                if !features.supports(feature) {
                    return Err(DirconError::UnsupportedOperation(format!(
                        "{feature} is not enabled for this device"
                    )));
                }
            }
        }

        let payload = encode_control_write(metric, value)?;
        if self.session.status() != SessionStatus::Connected {
            return Err(DirconError::NotConnected);
        }
        if !self.session.write(FTMS_CONTROL_POINT, payload).await {
            return Err(DirconError::Disconnected);
        }

        info!("Set {} to {}", metric, value);
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .insert(metric, value);
        Ok(())
    }

    /// Set a target value on the device, reporting failures as `false`
    pub async fn write(&self, name: &str, value: f64) -> bool {
        match self.try_write(name, value).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write {} = {}: {}", name, value, e);
                false
            }
        }
    }
}

/// Find out which optional metrics and controls a device supports
///
/// Runs one discovery-only session that reads the FTMS and RSC feature
/// characteristics, then disconnects. Nothing is subscribed, so the probe
/// never streams. `speed` is always reported as supported.
///
/// # Arguments
///
/// * `host` - Device host name or IP address
/// * `port` - DIRCON TCP port, usually advertised over mDNS
///
/// Returns `None` if the session could not be configured, e.g. because the
/// device is unreachable or exposes no services.
///
/// # Examples
///
/// ```no_run
/// use dircon::{probe_capabilities, DeviceConfig, DirconDevice};
///
/// #[tokio::main]
/// async fn main() {
///     let Some(features) = probe_capabilities("192.168.1.40", 36866).await else {
///         eprintln!("device could not be probed");
///         return;
///     };
///
///     let config = DeviceConfig::new("192.168.1.40", 36866).with_features(features);
///     let _device = DirconDevice::configure(config, |_| {}, |_| {});
/// }
/// ```
pub async fn probe_capabilities(host: &str, port: u16) -> Option<CapabilitySet> {
    probe_capabilities_with(SessionConfig::new(host, port)).await
}

/// [`probe_capabilities`] with explicit connection settings
pub async fn probe_capabilities_with(config: SessionConfig) -> Option<CapabilitySet> {
    info!("Probing capabilities of {}", config.address());

    let session = DirconSession::new(config);
    let parser = Arc::new(Mutex::new(CapabilityParser::new()));
    let sink = Arc::clone(&parser);
    session.subscribe_characteristic(move |event| {
        if let Err(e) = sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .feed(event.uuid, &event.payload)
        {
            warn!("Ignoring feature value of 0x{:04X}: {}", event.uuid, e);
        }
    });

    if !session.run(&RunTargets::capability_probe()).await {
        warn!("Capability probe of {} failed", session.config().address());
        return None;
    }

    let capabilities = parser
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .capabilities()
        .clone();
    info!(
        "Device {} supports: {:?}",
        session.config().address(),
        capabilities.supported().collect::<Vec<_>>()
    );
    Some(capabilities)
}
