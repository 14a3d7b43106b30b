use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use crate::{
    error::DirconError, DEFAULT_DIRCON_PORT, FITNESS_MACHINE_STATUS, FTMS_FEATURE,
    FTMS_TREADMILL_DATA, RSC_FEATURE, RSC_MEASUREMENT, TRAINING_STATUS,
};

/// Connection status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionStatus {
    /// No connection
    #[default]
    Disconnected,
    /// TCP connection is being opened
    Connecting,
    /// Services and characteristics are being discovered
    Configuring,
    /// Commands are flowing and notifications are streamed
    Connected,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Configuring => write!(f, "Configuring"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Metrics decoded from exercise data characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Instantaneous speed in km/h
    Speed,
    /// Total distance in meters
    Distance,
    /// Inclination in percent
    Incline,
    /// Running cadence in steps per minute
    Cadence,
    /// Heart rate in beats per minute
    Hrm,
    /// Elapsed time in seconds
    Time,
    /// Stride length in centimeters
    Stride,
}

impl Metric {
    /// All metrics in a stable order
    pub const ALL: [Self; 7] = [
        Self::Speed,
        Self::Distance,
        Self::Incline,
        Self::Cadence,
        Self::Hrm,
        Self::Time,
        Self::Stride,
    ];

    /// Name used by callers and in serialized snapshots
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::Distance => "distance",
            Self::Incline => "incline",
            Self::Cadence => "cadence",
            Self::Hrm => "hrm",
            Self::Time => "time",
            Self::Stride => "stride",
        }
    }

    /// Capability that must be present for this metric to be reported
    #[must_use]
    pub const fn feature(self) -> Feature {
        match self {
            Self::Speed => Feature::Speed,
            Self::Distance => Feature::Distance,
            Self::Incline => Feature::Incline,
            Self::Cadence => Feature::Cadence,
            Self::Hrm => Feature::Hrm,
            Self::Time => Feature::Time,
            Self::Stride => Feature::Stride,
        }
    }

    /// Capability that must be present to write this metric, if writable at all
    #[must_use]
    pub const fn control_feature(self) -> Option<Feature> {
        match self {
            Self::Speed => Some(Feature::SpeedSet),
            Self::Incline => Some(Feature::InclineSet),
            _ => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = DirconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.as_str() == s)
            .ok_or_else(|| DirconError::UnsupportedOperation(format!("Unknown metric: {s}")))
    }
}

/// Mapping of metric to value produced by one decode
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricSnapshot(BTreeMap<Metric, f64>);

impl MetricSnapshot {
    /// Create an empty snapshot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a metric value
    pub fn insert(&mut self, metric: Metric, value: f64) {
        self.0.insert(metric, value);
    }

    /// Get a metric value
    #[must_use]
    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.0.get(&metric).copied()
    }

    /// Whether the metric is present
    #[must_use]
    pub fn contains(&self, metric: Metric) -> bool {
        self.0.contains_key(&metric)
    }

    /// Whether no metric is present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of metrics present
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over metrics and values
    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.0.iter().map(|(metric, value)| (*metric, *value))
    }

    /// Overwrite this snapshot's values with the ones from `other`
    pub fn merge(&mut self, other: &Self) {
        self.0.extend(other.iter());
    }

    /// Keep only the metrics accepted by `keep`
    pub fn retain(&mut self, mut keep: impl FnMut(Metric) -> bool) {
        self.0.retain(|metric, _| keep(*metric));
    }
}

impl FromIterator<(Metric, f64)> for MetricSnapshot {
    fn from_iter<T: IntoIterator<Item = (Metric, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Optional device features detected by a capability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Speed is reported
    Speed,
    /// Distance is reported
    Distance,
    /// Incline is reported
    Incline,
    /// Cadence is reported
    Cadence,
    /// Heart rate is reported
    Hrm,
    /// Elapsed time is reported
    Time,
    /// Stride length is reported
    Stride,
    /// Target speed can be set
    SpeedSet,
    /// Target incline can be set
    InclineSet,
}

impl Feature {
    /// Name used by callers and in serialized capability sets
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::Distance => "distance",
            Self::Incline => "incline",
            Self::Cadence => "cadence",
            Self::Hrm => "hrm",
            Self::Time => "time",
            Self::Stride => "stride",
            Self::SpeedSet => "speed_set",
            Self::InclineSet => "incline_set",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature name to support flag
///
/// Features never mentioned are treated as unsupported.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeMap<Feature, bool>);

impl CapabilitySet {
    /// Create an empty capability set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the support flag of a feature
    pub fn set(&mut self, feature: Feature, supported: bool) {
        self.0.insert(feature, supported);
    }

    /// Whether the feature is supported
    #[must_use]
    pub fn supports(&self, feature: Feature) -> bool {
        self.0.get(&feature).copied().unwrap_or(false)
    }

    /// Whether the feature has been mentioned at all
    #[must_use]
    pub fn contains(&self, feature: Feature) -> bool {
        self.0.contains_key(&feature)
    }

    /// Iterate over supported features
    pub fn supported(&self) -> impl Iterator<Item = Feature> + '_ {
        self.0
            .iter()
            .filter(|(_, supported)| **supported)
            .map(|(feature, _)| *feature)
    }
}

impl FromIterator<Feature> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Feature>>(iter: T) -> Self {
        Self(iter.into_iter().map(|feature| (feature, true)).collect())
    }
}

/// Characteristics a single session run reads and subscribes to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunTargets {
    /// Characteristics read once after discovery
    pub read: BTreeSet<u32>,
    /// Characteristics subscribed to for notifications
    pub notify: BTreeSet<u32>,
    /// Keep reading notifications after the command queue drained
    pub listen: bool,
}

impl RunTargets {
    /// Targets of a streaming session
    #[must_use]
    pub fn streaming() -> Self {
        Self {
            read: BTreeSet::from([FTMS_FEATURE, TRAINING_STATUS, RSC_FEATURE]),
            notify: BTreeSet::from([
                FTMS_TREADMILL_DATA,
                FITNESS_MACHINE_STATUS,
                RSC_MEASUREMENT,
                TRAINING_STATUS,
            ]),
            listen: true,
        }
    }

    /// Targets of a one-shot capability probe
    #[must_use]
    pub fn capability_probe() -> Self {
        Self {
            read: BTreeSet::from([FTMS_FEATURE, TRAINING_STATUS, RSC_FEATURE]),
            notify: BTreeSet::new(),
            listen: false,
        }
    }
}

/// Running state of a configured device as seen by the caller
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceState {
    /// Streaming is enabled by the caller
    pub enabled: bool,
    /// Session is in [`SessionStatus::Connected`]
    pub connected: bool,
    /// Latest value of every metric seen so far
    pub metrics: MetricSnapshot,
}

impl DeviceState {
    /// Pace in seconds per kilometer derived from the current speed
    #[must_use]
    pub fn pace(&self) -> Option<u32> {
        pace_seconds_per_km(self.metrics.get(Metric::Speed)?)
    }
}

/// Convert a speed in km/h into seconds per kilometer
///
/// Returns `None` when standing still.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn pace_seconds_per_km(speed_kmh: f64) -> Option<u32> {
    if speed_kmh <= 0.0 || !speed_kmh.is_finite() {
        return None;
    }
    Some((3600.0 / speed_kmh) as u32)
}

/// Connection settings of one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Device host name or address
    pub host: String,
    /// Device TCP port
    pub port: u16,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Timeout for a response while one is outstanding, in milliseconds
    pub response_timeout_ms: u64,
    /// Maximum silence while streaming notifications, in milliseconds
    pub idle_timeout_ms: Option<u64>,
}

impl SessionConfig {
    /// Create a configuration with default timeouts
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// `host:port` string used in logs and errors
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_DIRCON_PORT,
            connect_timeout_ms: 10_000,
            response_timeout_ms: 10_000,
            idle_timeout_ms: None,
        }
    }
}

/// Reconnect policy of the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay between two session runs in milliseconds
    pub retry_interval_ms: u64,
    /// Consecutive failed runs after which streaming is disabled
    pub max_consecutive_failures: u32,
    /// Forget earlier failures once a run configures successfully
    pub reset_on_success: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 10_000,
            max_consecutive_failures: 6,
            reset_on_success: true,
        }
    }
}

/// Everything needed to stream from one device
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Connection settings
    pub session: SessionConfig,
    /// Reconnect policy
    pub retry: RetryConfig,
    /// Enabled features, `None` reports everything the device sends
    pub features: Option<CapabilitySet>,
}

impl DeviceConfig {
    /// Create a configuration with default timeouts and retry policy
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            session: SessionConfig::new(host, port),
            ..Self::default()
        }
    }

    /// Restrict reporting and control to the given features
    #[must_use]
    pub fn with_features(mut self, features: CapabilitySet) -> Self {
        self.features = Some(features);
        self
    }
}
