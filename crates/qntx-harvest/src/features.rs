//! Node-map collaborator
//!
//! Named feature access on the remote device. Missing or unreadable
//! features fall back to documented defaults instead of failing.

use tracing::{debug, warn};

use crate::error::FeatureError;

/// Well-known feature names
pub mod names {
    pub const PAYLOAD_SIZE: &str = "PayloadSize";
    pub const ACQUISITION_MODE: &str = "AcquisitionMode";
    pub const ACQUISITION_FRAME_COUNT: &str = "AcquisitionFrameCount";
    pub const ACQUISITION_START: &str = "AcquisitionStart";
    pub const ACQUISITION_STOP: &str = "AcquisitionStop";
    pub const TL_PARAMS_LOCKED: &str = "TLParamsLocked";
    pub const WIDTH: &str = "Width";
    pub const HEIGHT: &str = "Height";
    pub const PIXEL_FORMAT: &str = "PixelFormat";
    pub const OFFSET_X: &str = "OffsetX";
    pub const OFFSET_Y: &str = "OffsetY";
    pub const TIMESTAMP_TICK_FREQUENCY: &str = "GevTimestampTickFrequency";
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Enumeration(String),
}

impl FeatureValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FeatureValue::Integer(v) => Some(*v),
            FeatureValue::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Enumeration(s) => Some(s),
            _ => None,
        }
    }
}

/// Feature read/write/execute on a device
pub trait NodeMap: Send + Sync {
    fn get(&self, name: &str) -> Result<FeatureValue, FeatureError>;

    fn set(&self, name: &str, value: FeatureValue) -> Result<(), FeatureError>;

    /// Execute a command feature.
    fn invoke(&self, name: &str) -> Result<(), FeatureError>;
}

/// Node map for producers without one
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNodeMap;

impl NodeMap for NullNodeMap {
    fn get(&self, name: &str) -> Result<FeatureValue, FeatureError> {
        Err(FeatureError::NotFound(name.to_string()))
    }

    fn set(&self, name: &str, _value: FeatureValue) -> Result<(), FeatureError> {
        Err(FeatureError::NotFound(name.to_string()))
    }

    fn invoke(&self, name: &str) -> Result<(), FeatureError> {
        Err(FeatureError::NotFound(name.to_string()))
    }
}

/// How many frames a session acquires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquisitionMode {
    #[default]
    Continuous,
    SingleFrame,
    MultiFrame(u64),
}

impl AcquisitionMode {
    /// Number of frames after which the session is complete.
    pub fn frame_budget(&self) -> Option<u64> {
        match self {
            AcquisitionMode::Continuous => None,
            AcquisitionMode::SingleFrame => Some(1),
            AcquisitionMode::MultiFrame(n) => Some(*n),
        }
    }

    /// Read the mode from the device, defaulting to continuous.
    pub fn query(node_map: &dyn NodeMap) -> Self {
        let mode = match node_map.get(names::ACQUISITION_MODE) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "acquisition mode unavailable, assuming Continuous");
                return AcquisitionMode::Continuous;
            }
        };
        match mode.as_str() {
            Some("SingleFrame") => AcquisitionMode::SingleFrame,
            Some("MultiFrame") => match read_integer(node_map, names::ACQUISITION_FRAME_COUNT) {
                Some(n) if n > 0 => AcquisitionMode::MultiFrame(n as u64),
                _ => {
                    warn!("MultiFrame without a usable AcquisitionFrameCount, assuming Continuous");
                    AcquisitionMode::Continuous
                }
            },
            Some("Continuous") => AcquisitionMode::Continuous,
            other => {
                warn!(mode = ?other, "unrecognised acquisition mode, assuming Continuous");
                AcquisitionMode::Continuous
            }
        }
    }
}

/// Read an integer feature, `None` if missing or of another type.
pub fn read_integer(node_map: &dyn NodeMap, name: &str) -> Option<i64> {
    node_map.get(name).ok().and_then(|v| v.as_integer())
}

/// Read a non-negative integer feature as a size.
pub fn read_size(node_map: &dyn NodeMap, name: &str) -> Option<usize> {
    read_integer(node_map, name).and_then(|v| usize::try_from(v).ok())
}

pub fn read_enumeration(node_map: &dyn NodeMap, name: &str) -> Option<String> {
    match node_map.get(name).ok()? {
        FeatureValue::Enumeration(s) => Some(s),
        _ => None,
    }
}
