//! Crop recommendation from a soil NPK triple.
//!
//! The rule ranges overlap (n = 60 satisfies both corn and beans), so the
//! table is evaluated top-down and the first match wins. Keep the order.

use serde::Serialize;
use std::fmt;

use crate::feed::Npk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CropSuggestion {
    Banana,
    Turmeric,
    Garlic,
    Corn,
    Beans,
    Beetroot,
    Ragi,
    Kambu,
    Tapioca,
    SoilNeedsImprovement,
}

impl CropSuggestion {
    /// Stable identifier, identical to the serialised form.
    pub fn id(self) -> &'static str {
        match self {
            Self::Banana => "banana",
            Self::Turmeric => "turmeric",
            Self::Garlic => "garlic",
            Self::Corn => "corn",
            Self::Beans => "beans",
            Self::Beetroot => "beetroot",
            Self::Ragi => "ragi",
            Self::Kambu => "kambu",
            Self::Tapioca => "tapioca",
            Self::SoilNeedsImprovement => "soil-needs-improvement",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Banana => "Banana (high nitrogen & potassium soil)",
            Self::Turmeric => "Turmeric (well balanced nutrient soil)",
            Self::Garlic => "Garlic (good phosphorus & potassium level)",
            Self::Corn => "Corn (high nitrogen soil)",
            Self::Beans => "Beans (moderately fertile soil)",
            Self::Beetroot => "Beetroot (potassium rich soil)",
            Self::Ragi => "Ragi (suitable for moderate soil)",
            Self::Kambu => "Kambu (millet, tolerates low nutrient soil)",
            Self::Tapioca => "Tapioca (high potassium soil preferred)",
            Self::SoilNeedsImprovement => "Soil needs nutrient improvement",
        }
    }
}

impl fmt::Display for CropSuggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

struct Rule {
    crop: CropSuggestion,
    applies: fn(&Npk) -> bool,
}

static RULES: &[Rule] = &[
    Rule {
        crop: CropSuggestion::Banana,
        applies: |s| s.n >= 70.0 && s.k >= 70.0,
    },
    Rule {
        crop: CropSuggestion::Turmeric,
        applies: |s| s.n >= 40.0 && s.p >= 30.0 && s.k >= 40.0,
    },
    Rule {
        crop: CropSuggestion::Garlic,
        applies: |s| s.p >= 40.0 && s.k >= 40.0 && s.n >= 30.0,
    },
    Rule {
        crop: CropSuggestion::Corn,
        applies: |s| s.n >= 60.0,
    },
    Rule {
        crop: CropSuggestion::Beans,
        applies: |s| (30.0..=60.0).contains(&s.n) && s.p >= 30.0 && s.k >= 30.0,
    },
    Rule {
        crop: CropSuggestion::Beetroot,
        applies: |s| s.k >= 50.0 && s.n >= 30.0,
    },
    Rule {
        crop: CropSuggestion::Ragi,
        applies: |s| (20.0..=50.0).contains(&s.n) && s.p >= 20.0 && s.k >= 20.0,
    },
    Rule {
        crop: CropSuggestion::Kambu,
        applies: |s| s.n >= 15.0 && s.p >= 15.0 && s.k >= 15.0,
    },
    Rule {
        crop: CropSuggestion::Tapioca,
        applies: |s| s.k >= 60.0,
    },
];

/// Pick a crop for the given nitrogen, phosphorus and potassium levels.
pub fn suggest(n: f64, p: f64, k: f64) -> CropSuggestion {
    suggest_npk(&Npk { n, p, k })
}

pub fn suggest_npk(npk: &Npk) -> CropSuggestion {
    RULES
        .iter()
        .find(|rule| (rule.applies)(npk))
        .map_or(CropSuggestion::SoilNeedsImprovement, |rule| rule.crop)
}

// ===========================================================================
// Tests
// ===========================================================================
