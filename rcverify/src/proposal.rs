//! Extraction of reinforcement settings from backend design suggestions.
//!
//! Suggestions arrive either as a structured object using the same field names
//! as [`ReinforcementConfig`], or as free text such as
//! `"Vertical: Ø16@150, Horizontal: Ø12@200; Stirrups Ø10@100 (4 legs); 8Ø20"`.
//! Text is split into clauses on `,` `;` and newlines; each clause is
//! classified by keyword and anything that cannot be read is skipped.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::types::ReinforcementConfig;

struct Patterns {
    spaced_bar: Regex,
    counted_bars: Regex,
    legs: Regex,
    vertical: Regex,
    horizontal: Regex,
    stirrup: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            spaced_bar: Regex::new(r"(?i)([#øφ])?\s*(\d+(?:\.\d+)?)\s*(?:mm)?\s*@\s*(\d+(?:\.\d+)?)")?,
            counted_bars: Regex::new(r"(?i)(\d+)\s*(?:x|×|-)?\s*([#øφ]|t|d)\s*(\d+(?:\.\d+)?)")?,
            legs: Regex::new(r"(?i)(\d+)\s*-?\s*legs?\b")?,
            vertical: Regex::new(r"(?i)\bvert")?,
            horizontal: Regex::new(r"(?i)\bhoriz")?,
            // Whole words only: "tie" must not match "quantities" or "properties"
            stirrup: Regex::new(r"(?i)\b(?:stirrups?|ties?|hoops?|estribos?)\b")?,
        })
    }
}

static PATTERNS: LazyLock<Option<Patterns>> = LazyLock::new(|| {
    Patterns::compile()
        .map_err(|e| tracing::error!("Proposal patterns failed to compile: {}", e))
        .ok()
});

const MM_PER_INCH: f64 = 25.4;

/// A design suggestion for one element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DesignProposal {
    Structured(ReinforcementConfig),
    Text(String),
}

impl DesignProposal {
    /// The reinforcement fields this proposal sets; empty if nothing was recognised
    pub fn extract(&self) -> ReinforcementConfig {
        match self {
            DesignProposal::Structured(config) => config.clone(),
            DesignProposal::Text(text) => parse_proposal_text(text),
        }
    }
}

/// Nominal diameter of an ACI 318 / ASTM A615 bar size, in mm
pub fn aci_bar_diameter_mm(size: u32) -> Option<f64> {
    let d = match size {
        3 => 9.5,
        4 => 12.7,
        5 => 15.9,
        6 => 19.1,
        7 => 22.2,
        8 => 25.4,
        9 => 28.7,
        10 => 32.3,
        11 => 35.8,
        14 => 43.0,
        18 => 57.3,
        _ => return None,
    };
    Some(d)
}

#[derive(Clone, Copy, PartialEq)]
enum Clause {
    Vertical,
    Horizontal,
    Stirrup,
    Longitudinal,
}

fn classify(patterns: &Patterns, clause: &str) -> Clause {
    if patterns.vertical.is_match(clause) {
        Clause::Vertical
    } else if patterns.horizontal.is_match(clause) {
        Clause::Horizontal
    } else if patterns.stirrup.is_match(clause) {
        Clause::Stirrup
    } else {
        Clause::Longitudinal
    }
}

/// `#` designations are ACI bar sizes; everything else is read as mm
fn diameter(symbol: Option<&str>, value: &str) -> Option<f64> {
    if symbol == Some("#") {
        aci_bar_diameter_mm(value.parse().ok()?)
    } else {
        value.parse().ok().filter(|d: &f64| *d > 0.0)
    }
}

/// `(diameter_mm, spacing_mm)` from e.g. `Ø16@150` or `#5@12` (inches)
fn spaced_bar(patterns: &Patterns, clause: &str) -> Option<(Option<f64>, Option<f64>)> {
    let caps = patterns.spaced_bar.captures(clause)?;
    let symbol = caps.get(1).map(|m| m.as_str());
    let dia = diameter(symbol, &caps[2]);
    let mut spacing: Option<f64> = caps[3].parse().ok().filter(|s: &f64| *s > 0.0);
    if symbol == Some("#") && !clause.to_lowercase().contains("mm") {
        spacing = spacing.map(|s| s * MM_PER_INCH);
    }
    Some((dia, spacing))
}

/// Parse a free-text suggestion; unreadable parts are skipped
pub fn parse_proposal_text(text: &str) -> ReinforcementConfig {
    let mut config = ReinforcementConfig::default();
    let Some(patterns) = PATTERNS.as_ref() else {
        return config;
    };

    for clause in text.split([',', ';', '\n']).map(str::trim).filter(|c| !c.is_empty()) {
        match classify(patterns, clause) {
            Clause::Vertical => {
                if let Some((dia, spacing)) = spaced_bar(patterns, clause) {
                    config.vertical_bar_diameter_mm = dia.or(config.vertical_bar_diameter_mm);
                    config.vertical_bar_spacing_mm = spacing.or(config.vertical_bar_spacing_mm);
                }
            }
            Clause::Horizontal => {
                if let Some((dia, spacing)) = spaced_bar(patterns, clause) {
                    config.horizontal_bar_diameter_mm = dia.or(config.horizontal_bar_diameter_mm);
                    config.horizontal_bar_spacing_mm = spacing.or(config.horizontal_bar_spacing_mm);
                }
            }
            Clause::Stirrup => {
                if let Some((dia, spacing)) = spaced_bar(patterns, clause) {
                    config.stirrup_diameter_mm = dia.or(config.stirrup_diameter_mm);
                    config.stirrup_spacing_mm = spacing.or(config.stirrup_spacing_mm);
                }
                if let Some(legs) = patterns.legs.captures(clause).and_then(|c| c[1].parse().ok()) {
                    config.stirrup_legs = Some(legs);
                }
            }
            Clause::Longitudinal => {
                // A spaced bar here ("2 Ø16@150") is not a bar count
                if patterns.spaced_bar.is_match(clause) {
                    continue;
                }
                if let Some(caps) = patterns.counted_bars.captures(clause) {
                    let symbol = caps.get(2).map(|m| m.as_str());
                    if let Ok(count) = caps[1].parse::<u32>() {
                        if count > 0 {
                            config.longitudinal_bar_count = Some(count);
                        }
                    }
                    if let Some(dia) = diameter(symbol, &caps[3]) {
                        config.longitudinal_bar_diameter_mm = Some(dia);
                    }
                }
            }
        }
    }

    config
}
