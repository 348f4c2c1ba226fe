//! Header Fields
//!
//! A closed map of the header fields the engine consumes. Every field is optional so a
//! missing keyword is an ordinary, testable state; parsing a raw keyword/value card map
//! never fails, it just leaves unparseable fields absent.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Exposure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Light,
    Bias,
    Dark,
    Flat,
    Master,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Light => "light",
            FrameKind::Bias => "bias",
            FrameKind::Dark => "dark",
            FrameKind::Flat => "flat",
            FrameKind::Master => "master",
        }
    }

    /// Bias, dark and flat frames feed calibration sessions.
    pub fn is_calibration(self) -> bool {
        matches!(self, FrameKind::Bias | FrameKind::Dark | FrameKind::Flat)
    }

    /// Parse an IMAGETYP/FRAME value such as `Light Frame`, `DARK`, `Flat Field`, `MasterBias`.
    pub fn parse_image_type(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        if lower.contains("master") {
            return Some(FrameKind::Master);
        }
        if lower.starts_with("light") || lower == "object" {
            Some(FrameKind::Light)
        } else if lower.starts_with("bias") || lower.starts_with("offset") || lower == "zero" {
            Some(FrameKind::Bias)
        } else if lower.starts_with("dark") {
            Some(FrameKind::Dark)
        } else if lower.starts_with("flat") {
            Some(FrameKind::Flat)
        } else {
            None
        }
    }

    /// Directory / file name segment used under `Masters/`
    pub fn title(self) -> &'static str {
        match self {
            FrameKind::Light => "Light",
            FrameKind::Bias => "Bias",
            FrameKind::Dark => "Dark",
            FrameKind::Flat => "Flat",
            FrameKind::Master => "Master",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FrameKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Ok(FrameKind::Light),
            "bias" => Ok(FrameKind::Bias),
            "dark" => Ok(FrameKind::Dark),
            "flat" => Ok(FrameKind::Flat),
            "master" => Ok(FrameKind::Master),
            _ => Err(format!("Invalid frame kind: {s}")),
        }
    }
}

/// Pixel binning
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Binning {
    pub x: u32,
    pub y: u32,
}

impl Binning {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl Default for Binning {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl fmt::Display for Binning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.x, self.y)
    }
}

/// Header keywords read and written by the engine
pub mod keys {
    pub const IMAGE_TYPE: &str = "IMAGETYP";
    pub const FRAME: &str = "FRAME";
    pub const OBJECT: &str = "OBJECT";
    pub const TELESCOPE: &str = "TELESCOP";
    pub const INSTRUMENT: &str = "INSTRUME";
    pub const FILTER: &str = "FILTER";
    pub const EXPOSURE: &str = "EXPTIME";
    pub const EXPOSURE_ALT: &str = "EXPOSURE";
    pub const XBINNING: &str = "XBINNING";
    pub const YBINNING: &str = "YBINNING";
    pub const GAIN: &str = "GAIN";
    pub const OFFSET: &str = "OFFSET";
    pub const CCD_TEMP: &str = "CCD-TEMP";
    pub const SET_TEMP: &str = "SET-TEMP";
    pub const DATE_OBS: &str = "DATE-OBS";

    pub const NCOMBINE: &str = "NCOMBINE";
    pub const CALSTAT: &str = "CALSTAT";
    pub const MASTER_BIAS: &str = "MBIAS";
    pub const MASTER_DARK: &str = "MDARK";
    pub const MASTER_FLAT: &str = "MFLAT";
}

/// Typed view over an exposure header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMap {
    frame_kind: Option<FrameKind>,
    object: Option<String>,
    telescope: Option<String>,
    instrument: Option<String>,
    filter: Option<String>,
    exposure_s: Option<f64>,
    binning_x: Option<u32>,
    binning_y: Option<u32>,
    gain: Option<i32>,
    offset: Option<i32>,
    temperature_c: Option<f64>,
    observed_at: Option<DateTime<Utc>>,
    /// Free-form provenance cards written back after calibration
    #[serde(default)]
    extra: BTreeMap<String, String>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw keyword/value cards (keywords are matched case-insensitively).
    pub fn from_cards(cards: &BTreeMap<String, String>) -> Self {
        let mut upper: BTreeMap<String, &str> = BTreeMap::new();
        for (k, v) in cards {
            upper.insert(k.trim().to_ascii_uppercase(), v.trim());
        }
        let text = |key: &str| -> Option<String> {
            upper
                .get(key)
                .map(|v| v.trim_matches('\'').trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut fields = FieldMap {
            frame_kind: text(keys::IMAGE_TYPE)
                .or_else(|| text(keys::FRAME))
                .and_then(|v| FrameKind::parse_image_type(&v)),
            object: text(keys::OBJECT),
            telescope: text(keys::TELESCOPE),
            instrument: text(keys::INSTRUMENT),
            filter: text(keys::FILTER),
            exposure_s: text(keys::EXPOSURE)
                .or_else(|| text(keys::EXPOSURE_ALT))
                .and_then(|v| parse_number(keys::EXPOSURE, &v)),
            binning_x: text(keys::XBINNING).and_then(|v| parse_number::<f64>(keys::XBINNING, &v).map(|b| b as u32)),
            binning_y: text(keys::YBINNING).and_then(|v| parse_number::<f64>(keys::YBINNING, &v).map(|b| b as u32)),
            gain: text(keys::GAIN).and_then(|v| parse_number::<f64>(keys::GAIN, &v).map(|g| g.round() as i32)),
            offset: text(keys::OFFSET).and_then(|v| parse_number::<f64>(keys::OFFSET, &v).map(|o| o.round() as i32)),
            temperature_c: text(keys::CCD_TEMP)
                .or_else(|| text(keys::SET_TEMP))
                .and_then(|v| parse_number(keys::CCD_TEMP, &v)),
            observed_at: text(keys::DATE_OBS).and_then(|v| parse_timestamp(&v)),
            extra: BTreeMap::new(),
        };

        for key in [
            keys::NCOMBINE,
            keys::CALSTAT,
            keys::MASTER_BIAS,
            keys::MASTER_DARK,
            keys::MASTER_FLAT,
        ] {
            if let Some(value) = text(key) {
                fields.extra.insert(key.to_string(), value);
            }
        }
        fields
    }

    /// Render back to keyword/value cards
    pub fn to_cards(&self) -> BTreeMap<String, String> {
        let mut cards = BTreeMap::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(v) = value {
                cards.insert(key.to_string(), v);
            }
        };
        put(keys::IMAGE_TYPE, self.frame_kind.map(|k| k.as_str().to_ascii_uppercase()));
        put(keys::OBJECT, self.object.clone());
        put(keys::TELESCOPE, self.telescope.clone());
        put(keys::INSTRUMENT, self.instrument.clone());
        put(keys::FILTER, self.filter.clone());
        put(keys::EXPOSURE, self.exposure_s.map(|e| e.to_string()));
        put(keys::XBINNING, self.binning_x.map(|b| b.to_string()));
        put(keys::YBINNING, self.binning_y.map(|b| b.to_string()));
        put(keys::GAIN, self.gain.map(|g| g.to_string()));
        put(keys::OFFSET, self.offset.map(|o| o.to_string()));
        put(keys::CCD_TEMP, self.temperature_c.map(|t| t.to_string()));
        put(
            keys::DATE_OBS,
            self.observed_at
                .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
        );
        for (k, v) in &self.extra {
            cards.insert(k.clone(), v.clone());
        }
        cards
    }

    pub fn frame_kind(&self) -> Option<FrameKind> {
        self.frame_kind
    }

    pub fn object(&self) -> Option<&str> {
        self.object.as_deref()
    }

    pub fn telescope(&self) -> Option<&str> {
        self.telescope.as_deref()
    }

    pub fn instrument(&self) -> Option<&str> {
        self.instrument.as_deref()
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn exposure_s(&self) -> Option<f64> {
        self.exposure_s
    }

    /// Binning is present only when both axes are
    pub fn binning(&self) -> Option<Binning> {
        match (self.binning_x, self.binning_y) {
            (Some(x), Some(y)) => Some(Binning::new(x, y)),
            _ => None,
        }
    }

    pub fn gain(&self) -> Option<i32> {
        self.gain
    }

    pub fn offset(&self) -> Option<i32> {
        self.offset
    }

    pub fn temperature_c(&self) -> Option<f64> {
        self.temperature_c
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.observed_at
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra.get(key).map(String::as_str)
    }

    pub fn with_frame_kind(mut self, kind: FrameKind) -> Self {
        self.frame_kind = Some(kind);
        self
    }

    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    pub fn with_telescope(mut self, telescope: impl Into<String>) -> Self {
        self.telescope = Some(telescope.into());
        self
    }

    pub fn with_instrument(mut self, instrument: impl Into<String>) -> Self {
        self.instrument = Some(instrument.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_exposure(mut self, seconds: f64) -> Self {
        self.exposure_s = Some(seconds);
        self
    }

    pub fn with_binning(mut self, binning: Binning) -> Self {
        self.binning_x = Some(binning.x);
        self.binning_y = Some(binning.y);
        self
    }

    pub fn with_gain(mut self, gain: i32) -> Self {
        self.gain = Some(gain);
        self
    }

    pub fn with_offset(mut self, offset: i32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.temperature_c = Some(celsius);
        self
    }

    pub fn with_observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Overlay every field present in `other`
    pub fn merge(&mut self, other: &FieldMap) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        take!(
            frame_kind, object, telescope, instrument, filter, exposure_s, binning_x,
            binning_y, gain, offset, temperature_c, observed_at
        );
        for (k, v) in &other.extra {
            self.extra.insert(k.clone(), v.clone());
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            debug!(keyword = key, value = raw, "ignoring unparseable header value");
            None
        }
    }
}

/// DATE-OBS values come with or without a zone; zone-less values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    debug!(value = raw, "ignoring unparseable DATE-OBS");
    None
}
