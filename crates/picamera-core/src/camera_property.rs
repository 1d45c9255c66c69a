use serde::{Deserialize, Serialize};

/// libcamera control ids understood by the camera's property handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CameraPropertyKey {
    AeEnable = 1,
    AeState = 2,
    AeMeteringMode = 3,
    AeConstraintMode = 4,
    AeExposureMode = 5,
    ExposureValue = 6,
    ExposureTime = 7,
    ExposureTimeMode = 8,
    AnalogueGain = 9,
    AnalogueGainMode = 10,
    AeFlickerMode = 11,
    AeFlickerPeriod = 12,
    AeFlickerDetected = 13,
    Brightness = 14,
    Contrast = 15,
    Lux = 16,
    AwbEnable = 17,
    AwbMode = 18,
    AwbLocked = 19,
    ColourGains = 20,
    ColourTemperature = 21,
    Saturation = 22,
    SensorBlackLevels = 23,
    Sharpness = 24,
    FocusFoM = 25,
    ColourCorrectionMatrix = 26,
    ScalerCrop = 27,
    DigitalGain = 28,
    FrameDuration = 29,
    FrameDurationLimits = 30,
    SensorTemperature = 31,
    SensorTimestamp = 32,
    AfMode = 33,
    AfRange = 34,
    AfSpeed = 35,
    AfMetering = 36,
    AfWindows = 37,
    AfTrigger = 38,
    AfPause = 39,
    LensPosition = 40,
    AfState = 41,
    AfPauseState = 42,
    HdrMode = 43,
    HdrChannel = 44,
    Gamma = 45,
    DebugMetadataEnable = 46,
    FrameWallClock = 47,
}

impl CameraPropertyKey {
    pub const ALL: [CameraPropertyKey; 47] = [
        Self::AeEnable,
        Self::AeState,
        Self::AeMeteringMode,
        Self::AeConstraintMode,
        Self::AeExposureMode,
        Self::ExposureValue,
        Self::ExposureTime,
        Self::ExposureTimeMode,
        Self::AnalogueGain,
        Self::AnalogueGainMode,
        Self::AeFlickerMode,
        Self::AeFlickerPeriod,
        Self::AeFlickerDetected,
        Self::Brightness,
        Self::Contrast,
        Self::Lux,
        Self::AwbEnable,
        Self::AwbMode,
        Self::AwbLocked,
        Self::ColourGains,
        Self::ColourTemperature,
        Self::Saturation,
        Self::SensorBlackLevels,
        Self::Sharpness,
        Self::FocusFoM,
        Self::ColourCorrectionMatrix,
        Self::ScalerCrop,
        Self::DigitalGain,
        Self::FrameDuration,
        Self::FrameDurationLimits,
        Self::SensorTemperature,
        Self::SensorTimestamp,
        Self::AfMode,
        Self::AfRange,
        Self::AfSpeed,
        Self::AfMetering,
        Self::AfWindows,
        Self::AfTrigger,
        Self::AfPause,
        Self::LensPosition,
        Self::AfState,
        Self::AfPauseState,
        Self::HdrMode,
        Self::HdrChannel,
        Self::Gamma,
        Self::DebugMetadataEnable,
        Self::FrameWallClock,
    ];

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id() == id)
    }
}

impl From<CameraPropertyKey> for u32 {
    fn from(key: CameraPropertyKey) -> Self {
        key.id()
    }
}

/// Control value. Integers stay integers on the wire (`2`, not `2.0`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Int(i64),
    Float(f64),
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Int(v as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_contiguous() {
        for (i, key) in CameraPropertyKey::ALL.iter().enumerate() {
            assert_eq!(key.id() as usize, i + 1);
        }
        assert_eq!(CameraPropertyKey::from_id(7), Some(CameraPropertyKey::ExposureTime));
        assert_eq!(CameraPropertyKey::from_id(0), None);
    }

    #[test]
    fn integer_values_serialize_without_fraction() {
        assert_eq!(serde_json::to_string(&PropertyValue::from(2)).unwrap(), "2");
        assert_eq!(serde_json::to_string(&PropertyValue::from(0.5)).unwrap(), "0.5");
        assert_eq!(serde_json::to_string(&PropertyValue::from(true)).unwrap(), "1");
    }
}
