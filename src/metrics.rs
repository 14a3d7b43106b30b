//! Decoding of fitness characteristics into metrics.
//!
//! Two profiles are understood:
//!
//! - **FTMS Treadmill Data** (`0x2ACD`): a 16-bit little-endian flags field
//!   followed by optional fields in fixed order. Every set flag consumes its
//!   field width, whether the value is reported or not.
//! - **RSC Measurement** (`0x2A53`): an 8-bit flags field, speed and cadence at
//!   fixed offsets, then optional stride length and total distance.
//!
//! When a device exposes both, FTMS wins for `speed` and `distance`: once the
//! treadmill data characteristic supplied one of them, RSC values for the same
//! metric are dropped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use tracing::debug;

use crate::{
    error::{DirconError, Result},
    types::{CapabilitySet, Feature, Metric, MetricSnapshot},
    FTMS_FEATURE, FTMS_TREADMILL_DATA, RSC_FEATURE, RSC_MEASUREMENT,
};

/// FTMS control point opcode to set the target speed
pub const OPCODE_SET_TARGET_SPEED: u8 = 0x02;

/// FTMS control point opcode to set the target inclination
pub const OPCODE_SET_TARGET_INCLINE: u8 = 0x03;

/// Widths of the optional FTMS treadmill data fields, indexed by flag bit
///
/// Bit 0 is inverted: the speed field is present when the bit is clear.
/// Bit 3 covers inclination and ramp angle.
pub const FTMS_FIELD_WIDTHS: [usize; 11] = [2, 2, 3, 4, 4, 1, 1, 5, 1, 1, 2];

const FTMS_FEATURE_FLAGS: [(u32, Feature); 5] = [
    (1, Feature::Cadence),
    (2, Feature::Distance),
    (3, Feature::Incline),
    (10, Feature::Hrm),
    (12, Feature::Time),
];

const FTMS_TARGET_FLAGS: [(u32, Feature); 2] = [(0, Feature::SpeedSet), (1, Feature::InclineSet)];

const RSC_FEATURE_FLAGS: [(u32, Feature); 2] = [(0, Feature::Stride), (1, Feature::Distance)];

fn ensure(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(DirconError::ParseError(format!(
            "{what}: need {needed} bytes, {} left",
            buf.remaining()
        )));
    }
    Ok(())
}

/// Payload length implied by an FTMS treadmill data flags field
#[must_use]
pub fn ftms_payload_length(flags: u16) -> usize {
    let optional: usize = FTMS_FIELD_WIDTHS
        .iter()
        .enumerate()
        .filter(|(bit, _)| {
            let set = flags & (1 << bit) != 0;
            if *bit == 0 {
                !set
            } else {
                set
            }
        })
        .map(|(_, width)| width)
        .sum();
    2 + optional
}

/// Stateful decoder of one session's characteristic payloads
///
/// Remembers which characteristic last supplied each metric so that a
/// secondary profile does not contradict the primary one.
#[derive(Debug, Default, Clone)]
pub struct MetricDecoder {
    sources: HashMap<Metric, u32>,
}

impl MetricDecoder {
    /// Create a decoder with no source history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every recorded source, used when a new connection begins
    pub fn reset(&mut self) {
        self.sources.clear();
    }

    /// Characteristic that last supplied `metric`
    #[must_use]
    pub fn source_of(&self, metric: Metric) -> Option<u32> {
        self.sources.get(&metric).copied()
    }

    /// Decode a characteristic payload
    ///
    /// Characteristics that carry no metrics decode to an empty snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`DirconError::ParseError`] if the payload is shorter than its
    /// flags announce. Source tracking is left untouched in that case.
    pub fn decode(&mut self, characteristic: u32, payload: &[u8]) -> Result<MetricSnapshot> {
        let snapshot = match characteristic {
            FTMS_TREADMILL_DATA => decode_treadmill_data(payload)?,
            RSC_MEASUREMENT => self.decode_rsc_measurement(payload)?,
            _ => return Ok(MetricSnapshot::new()),
        };

        for (metric, _) in snapshot.iter() {
            self.sources.insert(metric, characteristic);
        }

        Ok(snapshot)
    }

    fn decode_rsc_measurement(&self, payload: &[u8]) -> Result<MetricSnapshot> {
        let mut buf = payload;
        let mut result = MetricSnapshot::new();

        ensure(buf, 4, "RSC measurement")?;
        let flags = buf.get_u8();
        let speed = f64::from(buf.get_u16_le()) * 360.0 / 25600.0;
        let cadence = f64::from(buf.get_u8()) * 2.0;

        if self.source_of(Metric::Speed) != Some(FTMS_TREADMILL_DATA) {
            result.insert(Metric::Speed, speed);
        }
        // Running cadence is reported per foot
        result.insert(Metric::Cadence, cadence);

        if flags & 0x01 != 0 {
            ensure(buf, 2, "RSC stride length")?;
            result.insert(Metric::Stride, f64::from(buf.get_u16_le()));
        }
        if flags & 0x02 != 0 {
            ensure(buf, 4, "RSC total distance")?;
            let distance = f64::from(buf.get_u32_le()) / 10.0;
            if self.source_of(Metric::Distance) != Some(FTMS_TREADMILL_DATA) {
                result.insert(Metric::Distance, distance);
            }
        }

        debug!("RSC measurement = {:?}", result);
        Ok(result)
    }
}

/// Decode an FTMS treadmill data payload
///
/// # Errors
///
/// Returns [`DirconError::ParseError`] if the payload is shorter than its
/// flags announce.
pub fn decode_treadmill_data(payload: &[u8]) -> Result<MetricSnapshot> {
    let mut buf = payload;
    let mut result = MetricSnapshot::new();

    ensure(buf, 2, "FTMS flags")?;
    let flags = buf.get_u16_le();
    ensure(buf, ftms_payload_length(flags) - 2, "FTMS treadmill data")?;

    let has = |bit: u16| flags & (1 << bit) != 0;

    if !has(0) {
        result.insert(Metric::Speed, f64::from(buf.get_u16_le()) / 100.0);
    }
    if has(1) {
        // Average speed
        buf.advance(2);
    }
    if has(2) {
        #[allow(clippy::cast_precision_loss)]
        let distance = buf.get_uint_le(3) as f64;
        result.insert(Metric::Distance, distance);
    }
    if has(3) {
        result.insert(Metric::Incline, f64::from(buf.get_i16_le()) / 10.0);
        // Ramp angle
        buf.advance(2);
    }
    for (bit, width) in [(4, 4), (5, 1), (6, 1), (7, 5)] {
        if has(bit) {
            buf.advance(width);
        }
    }
    if has(8) {
        result.insert(Metric::Hrm, f64::from(buf.get_u8()));
    }
    if has(9) {
        // Metabolic equivalent
        buf.advance(1);
    }
    if has(10) {
        result.insert(Metric::Time, f64::from(buf.get_u16_le()));
    }

    debug!("FTMS treadmill data = {:?}", result);
    Ok(result)
}

fn apply_flags(capabilities: &mut CapabilitySet, flags: u16, mapping: &[(u32, Feature)]) {
    for (bit, feature) in mapping {
        if u32::from(flags) & (1 << bit) != 0 {
            debug!("Feature supported: {}", feature);
            capabilities.set(*feature, true);
        }
    }
}

/// Accumulates device capabilities from feature characteristics
#[derive(Debug, Clone)]
pub struct CapabilityParser {
    capabilities: CapabilitySet,
}

impl Default for CapabilityParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityParser {
    /// Create a parser; speed is always supported
    #[must_use]
    pub fn new() -> Self {
        let mut capabilities = CapabilitySet::new();
        capabilities.set(Feature::Speed, true);
        Self { capabilities }
    }

    /// Inspect one characteristic value
    ///
    /// Values of characteristics other than the FTMS and RSC feature
    /// characteristics are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DirconError::ParseError`] if a feature payload is too short.
    pub fn feed(&mut self, characteristic: u32, payload: &[u8]) -> Result<()> {
        match characteristic {
            FTMS_FEATURE => {
                let mut buf = payload;
                ensure(buf, 6, "FTMS feature")?;
                let machine = buf.get_u16_le();
                buf.advance(2);
                let targets = buf.get_u16_le();
                debug!("FTMS feature flags: 0x{machine:04X}, target flags: 0x{targets:04X}");
                apply_flags(&mut self.capabilities, machine, &FTMS_FEATURE_FLAGS);
                apply_flags(&mut self.capabilities, targets, &FTMS_TARGET_FLAGS);
            }
            RSC_FEATURE => {
                let mut buf = payload;
                ensure(buf, 2, "RSC feature")?;
                let flags = buf.get_u16_le();
                debug!("RSC feature flags: 0x{flags:04X}");
                apply_flags(&mut self.capabilities, flags, &RSC_FEATURE_FLAGS);
            }
            _ => {}
        }
        Ok(())
    }

    /// Capabilities collected so far
    #[must_use]
    pub const fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Consume the parser
    #[must_use]
    pub fn into_capabilities(self) -> CapabilitySet {
        self.capabilities
    }
}

/// Encode a control point write that sets `metric` to `value`
///
/// # Errors
///
/// Returns [`DirconError::UnsupportedOperation`] for metrics that cannot be
/// set and [`DirconError::InvalidParameters`] for values outside the encodable
/// range.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn encode_control_write(metric: Metric, value: f64) -> Result<Bytes> {
    if !value.is_finite() {
        return Err(DirconError::InvalidParameters(format!(
            "{metric} value {value} is not a number"
        )));
    }

    let mut buf = BytesMut::with_capacity(3);
    match metric {
        Metric::Speed => {
            let raw = (value * 100.0).round();
            if !(0.0..=f64::from(u16::MAX)).contains(&raw) {
                return Err(DirconError::InvalidParameters(format!(
                    "Speed {value:.2} km/h is out of range"
                )));
            }
            buf.put_u8(OPCODE_SET_TARGET_SPEED);
            buf.put_u16_le(raw as u16);
        }
        Metric::Incline => {
            let raw = (value * 10.0).round();
            if !(f64::from(i16::MIN)..=f64::from(i16::MAX)).contains(&raw) {
                return Err(DirconError::InvalidParameters(format!(
                    "Incline {value:.1}% is out of range"
                )));
            }
            buf.put_u8(OPCODE_SET_TARGET_INCLINE);
            buf.put_i16_le(raw as i16);
        }
        other => {
            return Err(DirconError::UnsupportedOperation(format!(
                "{other} cannot be written"
            )));
        }
    }

    Ok(buf.freeze())
}
