// Live-tunable transform parameters shared by the pipeline, the controller and the state store
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("unknown parameter '{0}'")]
    UnknownName(String),
    #[error("unknown profile '{0}'")]
    UnknownProfile(String),
}

/// Inclusive range plus the identity value used for NaN inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamRange {
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

impl ParamRange {
    pub const fn new(min: f32, max: f32, default: f32) -> Self {
        Self { min, max, default }
    }

    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            return self.default;
        }
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

pub const CONTRAST: ParamRange = ParamRange::new(0.0, 4.0, 1.0);
pub const BRIGHTNESS: ParamRange = ParamRange::new(-1.0, 1.0, 0.0);
pub const GAMMA: ParamRange = ParamRange::new(0.1, 4.0, 1.0);
pub const SATURATION: ParamRange = ParamRange::new(0.0, 2.0, 1.0);
pub const EDGE_STRENGTH: ParamRange = ParamRange::new(0.0, 1.0, 0.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvertMode {
    #[default]
    None,
    Full,
    BrightnessOnly,
}

impl InvertMode {
    /// Index written into the GPU parameter block.
    pub fn as_index(self) -> i32 {
        match self {
            InvertMode::None => 0,
            InvertMode::Full => 1,
            InvertMode::BrightnessOnly => 2,
        }
    }

    /// Nearest mode for a numeric value; out-of-range values clamp to the ends.
    pub fn from_value(value: f32) -> Self {
        if value.is_nan() || value <= 0.5 {
            InvertMode::None
        } else if value <= 1.5 {
            InvertMode::Full
        } else {
            InvertMode::BrightnessOnly
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamName {
    Contrast,
    Brightness,
    Gamma,
    Saturation,
    InvertMode,
    EdgeStrength,
}

impl ParamName {
    pub const ALL: [ParamName; 6] = [
        ParamName::Contrast,
        ParamName::Brightness,
        ParamName::Gamma,
        ParamName::Saturation,
        ParamName::InvertMode,
        ParamName::EdgeStrength,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamName::Contrast => "contrast",
            ParamName::Brightness => "brightness",
            ParamName::Gamma => "gamma",
            ParamName::Saturation => "saturation",
            ParamName::InvertMode => "invertMode",
            ParamName::EdgeStrength => "edgeStrength",
        }
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamName {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match normalized.as_str() {
            "contrast" => Ok(ParamName::Contrast),
            "brightness" => Ok(ParamName::Brightness),
            "gamma" => Ok(ParamName::Gamma),
            "saturation" => Ok(ParamName::Saturation),
            "invertmode" | "invert" => Ok(ParamName::InvertMode),
            "edgestrength" | "edge" => Ok(ParamName::EdgeStrength),
            _ => Err(ParamError::UnknownName(s.to_string())),
        }
    }
}

/// The flat numeric parameter set consumed by the transform passes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransformParameters {
    pub contrast: f32,
    pub brightness: f32,
    pub gamma: f32,
    pub saturation: f32,
    pub invert_mode: InvertMode,
    pub edge_strength: f32,
}

impl Default for TransformParameters {
    fn default() -> Self {
        Self {
            contrast: CONTRAST.default,
            brightness: BRIGHTNESS.default,
            gamma: GAMMA.default,
            saturation: SATURATION.default,
            invert_mode: InvertMode::None,
            edge_strength: EDGE_STRENGTH.default,
        }
    }
}

impl TransformParameters {
    pub fn clamped(self) -> Self {
        Self {
            contrast: CONTRAST.clamp(self.contrast),
            brightness: BRIGHTNESS.clamp(self.brightness),
            gamma: GAMMA.clamp(self.gamma),
            saturation: SATURATION.clamp(self.saturation),
            invert_mode: self.invert_mode,
            edge_strength: EDGE_STRENGTH.clamp(self.edge_strength),
        }
    }

    pub fn is_in_range(&self) -> bool {
        CONTRAST.contains(self.contrast)
            && BRIGHTNESS.contains(self.brightness)
            && GAMMA.contains(self.gamma)
            && SATURATION.contains(self.saturation)
            && EDGE_STRENGTH.contains(self.edge_strength)
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Writes one field, clamping the value into its range.
    pub fn set(&mut self, name: ParamName, value: f32) {
        match name {
            ParamName::Contrast => self.contrast = CONTRAST.clamp(value),
            ParamName::Brightness => self.brightness = BRIGHTNESS.clamp(value),
            ParamName::Gamma => self.gamma = GAMMA.clamp(value),
            ParamName::Saturation => self.saturation = SATURATION.clamp(value),
            ParamName::InvertMode => self.invert_mode = InvertMode::from_value(value),
            ParamName::EdgeStrength => self.edge_strength = EDGE_STRENGTH.clamp(value),
        }
    }

    pub fn get(&self, name: ParamName) -> f32 {
        match name {
            ParamName::Contrast => self.contrast,
            ParamName::Brightness => self.brightness,
            ParamName::Gamma => self.gamma,
            ParamName::Saturation => self.saturation,
            ParamName::InvertMode => self.invert_mode.as_index() as f32,
            ParamName::EdgeStrength => self.edge_strength,
        }
    }

    pub fn set_named(&mut self, name: &str, value: f32) -> Result<ParamName, ParamError> {
        let name: ParamName = name.parse()?;
        self.set(name, value);
        Ok(name)
    }
}

/// A named preset applied to the pipeline as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualProfile {
    pub name: String,
    pub parameters: TransformParameters,
}

impl VisualProfile {
    pub const BUILTIN_NAMES: [&'static str; 4] = ["identity", "high_contrast", "inverted", "dark_mode"];

    pub fn builtin(name: &str) -> Result<Self, ParamError> {
        let parameters = match name {
            "identity" => TransformParameters::default(),
            // Starting point for low vision
            "high_contrast" => TransformParameters {
                contrast: 1.5,
                brightness: 0.1,
                gamma: 1.0,
                saturation: 0.8,
                invert_mode: InvertMode::None,
                edge_strength: 0.0,
            },
            "inverted" => TransformParameters {
                invert_mode: InvertMode::Full,
                ..TransformParameters::default()
            },
            "dark_mode" => TransformParameters {
                contrast: 1.2,
                invert_mode: InvertMode::BrightnessOnly,
                ..TransformParameters::default()
            },
            other => return Err(ParamError::UnknownProfile(other.to_string())),
        };

        Ok(Self {
            name: name.to_string(),
            parameters,
        })
    }
}
