//! Deterministic pass planning: which fixed-factor AI passes are needed to
//! reach the target scale, and which slice of the 0-100 progress scale each
//! stage owns.

use serde::{Deserialize, Serialize};

/// Scale above which a 4x pass is scheduled. Exactly 3.2 stays below the
/// threshold (strict comparison).
const FOUR_X_THRESHOLD: f64 = 3.2;
/// Remaining scale above which a 2x pass is scheduled; same strictness.
const TWO_X_THRESHOLD: f64 = 1.6;

/// Half-open slice `[lo, hi)` of the overall 0-100 progress scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressWindow {
    pub lo: u8,
    pub hi: u8,
}

impl ProgressWindow {
    /// Maps a 0.0..=1.0 fraction into this window.
    pub fn at(&self, fraction: f32) -> u8 {
        let span = f32::from(self.hi - self.lo);
        self.lo + (span * fraction.clamp(0.0, 1.0)) as u8
    }
}

pub const SETUP_WINDOW: ProgressWindow = ProgressWindow { lo: 0, hi: 5 };
pub const PASS_4X_WINDOW: ProgressWindow = ProgressWindow { lo: 5, hi: 60 };
pub const PASS_2X_WINDOW: ProgressWindow = ProgressWindow { lo: 60, hi: 85 };
pub const RESAMPLE_END: u8 = 95;
pub const SAVE_WINDOW: ProgressWindow = ProgressWindow { lo: 95, hi: 100 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassFactor {
    X4,
    X2,
}

impl PassFactor {
    pub fn factor(self) -> u32 {
        match self {
            Self::X4 => 4,
            Self::X2 => 2,
        }
    }
}

impl std::fmt::Display for PassFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x", self.factor())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSpec {
    pub factor: PassFactor,
    pub window: ProgressWindow,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PassPlan {
    pub passes: Vec<PassSpec>,
}

impl PassPlan {
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Where the final resample begins. Skipped pass windows collapse
    /// forward: the resample starts right after the last pass that will
    /// actually run, or right after setup when no passes run at all.
    pub fn resample_start(&self) -> u8 {
        self.passes
            .last()
            .map_or(SETUP_WINDOW.hi, |pass| pass.window.hi)
    }

    pub fn resample_window(&self) -> ProgressWindow {
        ProgressWindow {
            lo: self.resample_start(),
            hi: RESAMPLE_END,
        }
    }
}

/// Greedy largest-factor-first ladder. Passes are never fractional and never
/// repeated; whatever scale difference remains is absorbed by the final
/// resample.
pub fn plan_passes(scale: f64) -> PassPlan {
    let mut passes = Vec::new();
    let mut remaining = scale;

    if remaining > FOUR_X_THRESHOLD {
        passes.push(PassSpec {
            factor: PassFactor::X4,
            window: PASS_4X_WINDOW,
        });
        remaining /= 4.0;
    }

    if remaining > TWO_X_THRESHOLD {
        passes.push(PassSpec {
            factor: PassFactor::X2,
            window: PASS_2X_WINDOW,
        });
    }

    PassPlan { passes }
}
