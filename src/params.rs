//! Tracker parameters, loaded from an XML parameter file.

use crate::types::{VetError, VetResult};
use chrono::{DateTime, Utc};
use quick_xml::de::from_str;
use serde::{Deserialize, Deserializer};
use std::path::Path;

/// First-guess uniform motion (m/s)
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConstantMotion {
    pub u: f64,
    pub v: f64,
}

impl Default for ConstantMotion {
    fn default() -> Self {
        Self { u: 0.0, v: 0.0 }
    }
}

/// Weights on the curvature penalty of each velocity component
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct SmoothnessWeights {
    pub u_weight: f64,
    pub v_weight: f64,
}

impl Default for SmoothnessWeights {
    fn default() -> Self {
        Self {
            u_weight: 1.0,
            v_weight: 1.0,
        }
    }
}

/// How the reflectivity-conservation residuals enter the cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConservationNorm {
    /// Signed residual sum
    #[default]
    Linear,
    /// Sum of squared residuals
    Squared,
}

impl std::str::FromStr for ConservationNorm {
    type Err = VetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Ok(ConservationNorm::Linear),
            "squared" => Ok(ConservationNorm::Squared),
            other => Err(VetError::Config(format!(
                "Unknown conservation norm '{}', expected 'linear' or 'squared'",
                other
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for ConservationNorm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// What drives the processing loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Watch the input directory and process each newest field as it arrives
    #[default]
    LatestData,
    /// Process every field in the `time_list` window, then stop
    TimeList,
}

impl std::str::FromStr for TriggerMode {
    type Err = VetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "latest_data" => Ok(TriggerMode::LatestData),
            "time_list" => Ok(TriggerMode::TimeList),
            other => Err(VetError::Config(format!(
                "Unknown trigger mode '{}', expected 'latest_data' or 'time_list'",
                other
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for TriggerMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Polling settings for latest-data mode
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct LatestDataParams {
    /// Seconds to wait between directory checks when nothing new arrived
    pub poll_interval_secs: u64,
}

impl Default for LatestDataParams {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
        }
    }
}

/// Where base fields are read from
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BaseFieldInfo {
    pub input_dir: String,
    pub use_field_name: bool,
    pub field_name: String,
    pub field_num: usize,
    /// Largest allowed distance between requested and file time
    pub search_margin_secs: i64,
}

impl Default for BaseFieldInfo {
    fn default() -> Self {
        Self {
            input_dir: ".".to_string(),
            use_field_name: true,
            field_name: "DBZ".to_string(),
            field_num: 0,
            search_margin_secs: 0,
        }
    }
}

/// Processing window for time-list mode
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TimeList {
    pub start_time: String,
    pub end_time: String,
}

impl TimeList {
    pub fn start(&self) -> VetResult<DateTime<Utc>> {
        parse_time(&self.start_time)
    }

    pub fn end(&self) -> VetResult<DateTime<Utc>> {
        parse_time(&self.end_time)
    }
}

fn parse_time(text: &str) -> VetResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VetError::Config(format!("Invalid time '{}': {}", text, e)))
}

/// Complete tracker configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    pub debug: bool,
    pub max_iterations: usize,
    pub constant_motion: ConstantMotion,
    pub conservation_constraint_weight: f64,
    pub smoothness_constraint_weights: SmoothnessWeights,
    pub convergence_tolerance: f64,
    /// Number of correction pairs kept by the minimizer
    pub history_depth: usize,
    pub conservation_norm: ConservationNorm,
    pub output_gradients: bool,
    pub base_field_info: BaseFieldInfo,
    pub output_dir: String,
    pub trigger_mode: TriggerMode,
    pub latest_data: LatestDataParams,
    pub time_list: Option<TimeList>,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            debug: false,
            max_iterations: 100,
            constant_motion: ConstantMotion::default(),
            conservation_constraint_weight: 1.0,
            smoothness_constraint_weights: SmoothnessWeights::default(),
            convergence_tolerance: 1.0e-6,
            history_depth: 3,
            conservation_norm: ConservationNorm::Linear,
            output_gradients: false,
            base_field_info: BaseFieldInfo::default(),
            output_dir: "output".to_string(),
            trigger_mode: TriggerMode::LatestData,
            latest_data: LatestDataParams::default(),
            time_list: None,
        }
    }
}

impl TrackerParams {
    /// Parse parameters from XML text
    pub fn from_xml(xml_content: &str) -> VetResult<Self> {
        let params: TrackerParams = from_str(xml_content)
            .map_err(|e| VetError::XmlParsing(format!("Failed to parse parameters: {}", e)))?;
        params.validate()?;
        Ok(params)
    }

    /// Load parameters from an XML file
    pub fn load<P: AsRef<Path>>(path: P) -> VetResult<Self> {
        log::info!("Loading tracker parameters from: {}", path.as_ref().display());
        let xml_content = std::fs::read_to_string(path.as_ref())?;
        Self::from_xml(&xml_content)
    }

    pub fn validate(&self) -> VetResult<()> {
        if self.max_iterations == 0 {
            return Err(VetError::Config("max_iterations must be at least 1".to_string()));
        }
        if self.history_depth == 0 {
            return Err(VetError::Config("history_depth must be at least 1".to_string()));
        }
        if !self.convergence_tolerance.is_finite() || self.convergence_tolerance <= 0.0 {
            return Err(VetError::Config(format!(
                "convergence_tolerance must be positive, got {}",
                self.convergence_tolerance
            )));
        }

        let finite = [
            ("constant_motion.u", self.constant_motion.u),
            ("constant_motion.v", self.constant_motion.v),
            ("conservation_constraint_weight", self.conservation_constraint_weight),
            ("smoothness_constraint_weights.u_weight", self.smoothness_constraint_weights.u_weight),
            ("smoothness_constraint_weights.v_weight", self.smoothness_constraint_weights.v_weight),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(VetError::Config(format!("{} must be finite, got {}", name, value)));
            }
        }

        if self.trigger_mode == TriggerMode::TimeList && self.time_list.is_none() {
            return Err(VetError::Config(
                "trigger_mode time_list needs a time_list element".to_string(),
            ));
        }

        if let Some(time_list) = &self.time_list {
            let (start, end) = (time_list.start()?, time_list.end()?);
            if end < start {
                return Err(VetError::Config(format!(
                    "time_list end {} is before start {}",
                    end, start
                )));
            }
        }

        Ok(())
    }
}
