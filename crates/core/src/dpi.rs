//! DPI bounds, labelled print-quality presets, and the highest-tier gate.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

pub const DPI_MIN: u32 = 150;
pub const DPI_MAX: u32 = 600;

/// The highest tier produces enormous intermediates (an A0 sheet at 600 DPI
/// approaches 20k x 28k pixels) and must be explicitly acknowledged.
pub const FORCE_GATED_DPI: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpiChoice {
    pub dpi: u32,
    pub label: &'static str,
}

pub const DPI_CHOICES: [DpiChoice; 6] = [
    DpiChoice {
        dpi: 150,
        label: "Good at distance (fast, smaller files)",
    },
    DpiChoice {
        dpi: 200,
        label: "Better detail, moderate size",
    },
    DpiChoice {
        dpi: 240,
        label: "Fine posters, closer viewing",
    },
    DpiChoice {
        dpi: 300,
        label: "Pro print standard",
    },
    DpiChoice {
        dpi: 360,
        label: "High detail inkjet workflows",
    },
    DpiChoice {
        dpi: 600,
        label: "Ultra fine detail; huge files",
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
    Highest,
}

impl QualityPreset {
    pub fn default_dpi(self) -> u32 {
        match self {
            Self::Low => 150,
            Self::Medium => 200,
            Self::High => 300,
            Self::Highest => 600,
        }
    }
}

impl std::fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Highest => "highest",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for QualityPreset {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "highest" => Ok(Self::Highest),
            other => Err(format!(
                "unrecognized quality preset '{other}' (expected low, medium, high, or highest)"
            )),
        }
    }
}

/// The label shown for a DPI value, when it is one of the documented
/// choices.
pub fn choice_label(dpi: u32) -> Option<&'static str> {
    DPI_CHOICES
        .iter()
        .find(|choice| choice.dpi == dpi)
        .map(|choice| choice.label)
}

/// Rejects out-of-range DPI and enforces the highest-tier acknowledgement.
/// Checked before any geometry is derived or any process is spawned.
pub fn validate_dpi(dpi: u32, force_max_dpi: bool) -> Result<(), PipelineError> {
    if !(DPI_MIN..=DPI_MAX).contains(&dpi) {
        return Err(PipelineError::InvalidGeometry(format!(
            "DPI {dpi} outside supported range {DPI_MIN}-{DPI_MAX}"
        )));
    }
    if dpi >= FORCE_GATED_DPI && !force_max_dpi {
        return Err(PipelineError::InvalidGeometry(format!(
            "{dpi} DPI requires the force-max-dpi acknowledgement"
        )));
    }
    Ok(())
}
