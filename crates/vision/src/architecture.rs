//! Supported classifier architectures.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::VisionError;

/// The classifier families the training agent can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Resnet18,
    Resnet34,
    Resnet50,
    MobilenetV2,
    EfficientnetB0,
}

impl Architecture {
    /// All supported architectures, in plan-schema order.
    pub const ALL: [Self; 5] = [
        Self::Resnet18,
        Self::Resnet34,
        Self::Resnet50,
        Self::MobilenetV2,
        Self::EfficientnetB0,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resnet18 => "resnet18",
            Self::Resnet34 => "resnet34",
            Self::Resnet50 => "resnet50",
            Self::MobilenetV2 => "mobilenet_v2",
            Self::EfficientnetB0 => "efficientnet_b0",
        }
    }
}

impl FromStr for Architecture {
    type Err = VisionError;

    /// Parses an architecture name, accepting the common family aliases
    /// (`resnet`, `mobilenet`, `efficientnet`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "resnet18" | "resnet" => Ok(Self::Resnet18),
            "resnet34" => Ok(Self::Resnet34),
            "resnet50" => Ok(Self::Resnet50),
            "mobilenet_v2" | "mobilenet" => Ok(Self::MobilenetV2),
            "efficientnet_b0" | "efficientnet" => Ok(Self::EfficientnetB0),
            other => Err(VisionError::UnsupportedArchitecture(other.to_string())),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
