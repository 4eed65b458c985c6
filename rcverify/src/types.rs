//! Data model shared by the HTTP client, the stream decoder and the reconciler

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ClientError, ClientResult};

// ========================
// Identifiers
// ========================

/// Opaque server-issued handle to an uploaded dataset
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite `story + label` identifier of a structural element
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementKey {
    pub story: String,
    pub label: String,
}

impl ElementKey {
    pub fn new(story: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            story: story.into(),
            label: label.into(),
        }
    }

    /// Parse `STORY/LABEL`. Story names may contain slashes, labels may not.
    pub fn parse(text: &str) -> ClientResult<Self> {
        match text.rsplit_once('/') {
            Some((story, label)) if !story.trim().is_empty() && !label.trim().is_empty() => {
                Ok(Self::new(story.trim(), label.trim()))
            }
            _ => Err(ClientError::InvalidInput(format!(
                "element key '{}' must look like STORY/LABEL",
                text
            ))),
        }
    }
}

impl fmt::Display for ElementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.story, self.label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementCategory {
    Pier,
    Column,
    Beam,
    Slab,
}

impl ElementCategory {
    pub const ALL: [ElementCategory; 4] = [
        ElementCategory::Pier,
        ElementCategory::Column,
        ElementCategory::Beam,
        ElementCategory::Slab,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            ElementCategory::Pier => "Piers / Walls",
            ElementCategory::Column => "Columns",
            ElementCategory::Beam => "Beams",
            ElementCategory::Slab => "Slabs",
        }
    }
}

// ========================
// Reinforcement
// ========================

/// User-adjustable bar and stirrup parameters of one element (mm).
///
/// Every field is optional: a config doubles as a set of field changes,
/// and merging applies only the fields that are present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReinforcementConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_bar_diameter_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertical_bar_spacing_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_bar_diameter_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_bar_spacing_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitudinal_bar_diameter_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitudinal_bar_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stirrup_diameter_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stirrup_spacing_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stirrup_legs: Option<u32>,
}

impl ReinforcementConfig {
    pub const FIELDS: [&'static str; 9] = [
        "vertical_bar_diameter_mm",
        "vertical_bar_spacing_mm",
        "horizontal_bar_diameter_mm",
        "horizontal_bar_spacing_mm",
        "longitudinal_bar_diameter_mm",
        "longitudinal_bar_count",
        "stirrup_diameter_mm",
        "stirrup_spacing_mm",
        "stirrup_legs",
    ];

    pub fn is_empty(&self) -> bool {
        *self == ReinforcementConfig::default()
    }

    /// Last-write-wins merge: every field present in `changes` overwrites ours.
    pub fn merge(&mut self, changes: &ReinforcementConfig) {
        fn take<T: Copy>(dst: &mut Option<T>, src: Option<T>) {
            if src.is_some() {
                *dst = src;
            }
        }
        take(&mut self.vertical_bar_diameter_mm, changes.vertical_bar_diameter_mm);
        take(&mut self.vertical_bar_spacing_mm, changes.vertical_bar_spacing_mm);
        take(&mut self.horizontal_bar_diameter_mm, changes.horizontal_bar_diameter_mm);
        take(&mut self.horizontal_bar_spacing_mm, changes.horizontal_bar_spacing_mm);
        take(&mut self.longitudinal_bar_diameter_mm, changes.longitudinal_bar_diameter_mm);
        take(&mut self.longitudinal_bar_count, changes.longitudinal_bar_count);
        take(&mut self.stirrup_diameter_mm, changes.stirrup_diameter_mm);
        take(&mut self.stirrup_spacing_mm, changes.stirrup_spacing_mm);
        take(&mut self.stirrup_legs, changes.stirrup_legs);
    }

    /// Set a single field by its wire name, e.g. from a `field=value` edit.
    pub fn set(&mut self, field: &str, value: f64) -> ClientResult<()> {
        if !value.is_finite() || value <= 0.0 {
            return Err(ClientError::InvalidInput(format!(
                "{} must be a positive number, got {}",
                field, value
            )));
        }
        let count = || -> ClientResult<u32> {
            if value.fract() != 0.0 || value > u32::MAX as f64 {
                return Err(ClientError::InvalidInput(format!(
                    "{} must be a whole number, got {}",
                    field, value
                )));
            }
            Ok(value as u32)
        };
        match field {
            "vertical_bar_diameter_mm" => self.vertical_bar_diameter_mm = Some(value),
            "vertical_bar_spacing_mm" => self.vertical_bar_spacing_mm = Some(value),
            "horizontal_bar_diameter_mm" => self.horizontal_bar_diameter_mm = Some(value),
            "horizontal_bar_spacing_mm" => self.horizontal_bar_spacing_mm = Some(value),
            "longitudinal_bar_diameter_mm" => self.longitudinal_bar_diameter_mm = Some(value),
            "longitudinal_bar_count" => self.longitudinal_bar_count = Some(count()?),
            "stirrup_diameter_mm" => self.stirrup_diameter_mm = Some(value),
            "stirrup_spacing_mm" => self.stirrup_spacing_mm = Some(value),
            "stirrup_legs" => self.stirrup_legs = Some(count()?),
            other => {
                return Err(ClientError::InvalidInput(format!(
                    "unknown reinforcement field '{}' (expected one of: {})",
                    other,
                    Self::FIELDS.join(", ")
                )))
            }
        }
        Ok(())
    }
}

// ========================
// Request Types
// ========================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MomentAxis {
    M2,
    #[default]
    M3,
    #[serde(rename = "SRSS")]
    Srss,
}

/// One per-element override sent with an analysis request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementUpdate {
    pub story: String,
    pub label: String,
    #[serde(flatten)]
    pub reinforcement: ReinforcementConfig,
}

impl ElementUpdate {
    pub fn new(key: &ElementKey, reinforcement: ReinforcementConfig) -> Self {
        Self {
            story: key.story.clone(),
            label: key.label.clone(),
            reinforcement,
        }
    }

    pub fn key(&self) -> ElementKey {
        ElementKey::new(self.story.clone(), self.label.clone())
    }
}

/// Request body shared by the single-shot and streaming analyze endpoints
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub session_id: SessionId,
    #[serde(default)]
    pub element_updates: Vec<ElementUpdate>,
    #[serde(default)]
    pub generate_plots: bool,
    #[serde(default)]
    pub moment_axis: MomentAxis,
    #[serde(default)]
    pub angle_deg: f64,
}

impl AnalysisRequest {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            element_updates: Vec::new(),
            generate_plots: false,
            moment_axis: MomentAxis::default(),
            angle_deg: 0.0,
        }
    }

    pub fn with_update(mut self, update: ElementUpdate) -> Self {
        self.element_updates.push(update);
        self
    }

    pub fn with_plots(mut self, generate_plots: bool) -> Self {
        self.generate_plots = generate_plots;
        self
    }

    pub fn with_moment_axis(mut self, axis: MomentAxis, angle_deg: f64) -> Self {
        self.moment_axis = axis;
        self.angle_deg = angle_deg;
        self
    }
}

/// Options for the PDF report endpoint
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReportConfig {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engineer: Option<String>,
    pub categories: Vec<ElementCategory>,
    #[serde(default)]
    pub include_plots: bool,
}

impl ReportConfig {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            project_name: None,
            engineer: None,
            categories: ElementCategory::ALL.to_vec(),
            include_plots: false,
        }
    }
}

// ========================
// Response Types
// ========================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionGeometry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thickness_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height_mm: Option<f64>,
}

/// Demand against capacity for one failure mode
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapacityCheck {
    /// Failure mode, e.g. "flexure", "shear", "axial"
    pub mode: String,
    pub demand: f64,
    pub capacity: f64,
    pub dcr: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_combination: Option<String>,
}

/// Immutable snapshot of one analysed element.
///
/// Replaced wholesale when a newer analysis response arrives, never edited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementResult {
    pub story: String,
    pub label: String,
    #[serde(default)]
    pub geometry: SectionGeometry,
    #[serde(default)]
    pub reinforcement: ReinforcementConfig,
    #[serde(default)]
    pub checks: Vec<CapacityCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_combination: Option<String>,
    /// Base64 plot image when the request asked for plots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    /// Remaining backend columns, passed through to the table layer untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ElementResult {
    pub fn key(&self) -> ElementKey {
        ElementKey::new(self.story.clone(), self.label.clone())
    }

    fn matches(&self, key: &ElementKey) -> bool {
        self.story == key.story && self.label == key.label
    }

    pub fn governing_check(&self) -> Option<&CapacityCheck> {
        self.checks
            .iter()
            .max_by(|a, b| a.dcr.total_cmp(&b.dcr))
    }

    pub fn max_dcr(&self) -> Option<f64> {
        self.governing_check().map(|c| c.dcr)
    }

    /// DCR ≤ 1.0 on every check. Elements without checks are not compliant.
    pub fn is_compliant(&self) -> bool {
        self.max_dcr().is_some_and(|dcr| dcr <= 1.0)
    }
}

/// Results of one analysis run, grouped by element category
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BatchPayload", into = "BatchPayload")]
pub struct AnalysisResultBatch {
    categories: BTreeMap<ElementCategory, Vec<ElementResult>>,
}

impl AnalysisResultBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, category: ElementCategory, result: ElementResult) {
        self.categories.entry(category).or_default().push(result);
    }

    pub fn category(&self, category: ElementCategory) -> &[ElementResult] {
        self.categories
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (ElementCategory, &ElementResult)> {
        self.categories
            .iter()
            .flat_map(|(category, results)| results.iter().map(move |r| (*category, r)))
    }

    pub fn get(&self, key: &ElementKey) -> Option<&ElementResult> {
        self.iter().map(|(_, r)| r).find(|r| r.matches(key))
    }

    pub fn contains(&self, key: &ElementKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace every entry with the same key as `result`, in whichever category
    /// lists it appears. Returns the number of entries replaced.
    pub fn replace(&mut self, result: &ElementResult) -> usize {
        let key = result.key();
        let mut replaced = 0;
        for slot in self.categories.values_mut().flat_map(|v| v.iter_mut()) {
            if slot.matches(&key) {
                *slot = result.clone();
                replaced += 1;
            }
        }
        replaced
    }
}

/// Wire shape of a result batch: piers arrive under `results`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct BatchPayload {
    #[serde(default)]
    results: Vec<ElementResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    column_results: Vec<ElementResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    beam_results: Vec<ElementResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    slab_results: Vec<ElementResult>,
}

impl From<BatchPayload> for AnalysisResultBatch {
    fn from(payload: BatchPayload) -> Self {
        let mut categories = BTreeMap::new();
        for (category, results) in [
            (ElementCategory::Pier, payload.results),
            (ElementCategory::Column, payload.column_results),
            (ElementCategory::Beam, payload.beam_results),
            (ElementCategory::Slab, payload.slab_results),
        ] {
            if !results.is_empty() {
                categories.insert(category, results);
            }
        }
        Self { categories }
    }
}

impl From<AnalysisResultBatch> for BatchPayload {
    fn from(mut batch: AnalysisResultBatch) -> Self {
        let mut take = |c: ElementCategory| batch.categories.remove(&c).unwrap_or_default();
        BatchPayload {
            results: take(ElementCategory::Pier),
            column_results: take(ElementCategory::Column),
            beam_results: take(ElementCategory::Beam),
            slab_results: take(ElementCategory::Slab),
        }
    }
}

/// Single-shot analyze response
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct AnalyzeResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(flatten)]
    pub batch: AnalysisResultBatch,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementSummary {
    pub story: String,
    pub label: String,
    #[serde(default)]
    pub reinforcement: ReinforcementConfig,
}

impl ElementSummary {
    pub fn key(&self) -> ElementKey {
        ElementKey::new(self.story.clone(), self.label.clone())
    }
}

/// Elements discovered in an uploaded export, per category
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadSummary {
    #[serde(default)]
    pub piers: Vec<ElementSummary>,
    #[serde(default)]
    pub columns: Vec<ElementSummary>,
    #[serde(default)]
    pub beams: Vec<ElementSummary>,
    #[serde(default)]
    pub slabs: Vec<ElementSummary>,
}

impl UploadSummary {
    pub fn iter(&self) -> impl Iterator<Item = (ElementCategory, &ElementSummary)> {
        self.piers
            .iter()
            .map(|s| (ElementCategory::Pier, s))
            .chain(self.columns.iter().map(|s| (ElementCategory::Column, s)))
            .chain(self.beams.iter().map(|s| (ElementCategory::Beam, s)))
            .chain(self.slabs.iter().map(|s| (ElementCategory::Slab, s)))
    }

    pub fn len(&self) -> usize {
        self.piers.len() + self.columns.len() + self.beams.len() + self.slabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct UploadResponse {
    pub success: bool,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub summary: Option<UploadSummary>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A successfully uploaded dataset
#[derive(Clone, Debug, PartialEq)]
pub struct UploadOutcome {
    pub session_id: SessionId,
    pub summary: UploadSummary,
}

/// One load combination's result row for an element
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CombinationRow {
    pub index: usize,
    pub name: String,
    #[serde(default)]
    pub axial_kn: f64,
    #[serde(default)]
    pub moment_major_knm: f64,
    #[serde(default)]
    pub moment_minor_knm: f64,
    #[serde(default)]
    pub shear_kn: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flexure_dcr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shear_dcr: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct CombinationsResponse {
    pub success: bool,
    #[serde(default)]
    pub combinations: Vec<CombinationRow>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Full breakdown of a single load combination for an element
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CombinationDetail {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plot: Option<String>,
    #[serde(flatten)]
    pub values: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct CombinationDetailResponse {
    pub success: bool,
    #[serde(default)]
    pub detail: Option<CombinationDetail>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pier(label: &str, dcr: f64) -> ElementResult {
        serde_json::from_value(json!({
            "story": "L1",
            "label": label,
            "checks": [{"mode": "shear", "demand": dcr * 100.0, "capacity": 100.0, "dcr": dcr}],
            "critical_combination": "1.2D+1.6L",
            "pu_kn": 512.0
        }))
        .unwrap()
    }

    #[test]
    fn test_element_key_parse() {
        let key = ElementKey::parse("Level 2/A/P1").unwrap();
        assert_eq!(key, ElementKey::new("Level 2/A", "P1"));
        assert_eq!(key.to_string(), "Level 2/A/P1");
        assert!(ElementKey::parse("P1").is_err());
        assert!(ElementKey::parse("L1/").is_err());
    }

    #[test]
    fn test_merge_is_last_write_wins_per_field() {
        let mut config = ReinforcementConfig {
            stirrup_diameter_mm: Some(10.0),
            stirrup_spacing_mm: Some(150.0),
            ..Default::default()
        };
        config.merge(&ReinforcementConfig {
            stirrup_diameter_mm: Some(12.0),
            ..Default::default()
        });
        assert_eq!(config.stirrup_diameter_mm, Some(12.0));
        assert_eq!(config.stirrup_spacing_mm, Some(150.0));
    }

    #[test]
    fn test_set_field_validation() {
        let mut config = ReinforcementConfig::default();
        config.set("stirrup_legs", 4.0).unwrap();
        assert_eq!(config.stirrup_legs, Some(4));
        assert!(config.set("stirrup_legs", 2.5).is_err());
        assert!(config.set("stirrup_spacing_mm", -1.0).is_err());
        assert!(config.set("cover_mm", 40.0).is_err());
    }

    #[test]
    fn test_batch_wire_format() {
        let batch: AnalysisResultBatch = serde_json::from_value(json!({
            "results": [{"story": "L1", "label": "P1"}],
            "column_results": [{"story": "L1", "label": "C1"}]
        }))
        .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.category(ElementCategory::Pier)[0].label, "P1");
        assert_eq!(batch.category(ElementCategory::Column)[0].label, "C1");
        assert!(batch.category(ElementCategory::Slab).is_empty());
    }

    #[test]
    fn test_batch_replace_by_key() {
        let mut batch = AnalysisResultBatch::new();
        batch.insert(ElementCategory::Pier, pier("P1", 0.5));
        batch.insert(ElementCategory::Pier, pier("P2", 0.7));

        let replaced = batch.replace(&pier("P2", 1.3));
        assert_eq!(replaced, 1);
        assert_eq!(batch.get(&ElementKey::new("L1", "P2")).unwrap().max_dcr(), Some(1.3));
        assert_eq!(batch.get(&ElementKey::new("L1", "P1")).unwrap().max_dcr(), Some(0.5));
        assert_eq!(batch.replace(&pier("P9", 0.1)), 0);
    }

    #[test]
    fn test_result_keeps_extra_columns() {
        let result = pier("P1", 0.8);
        assert_eq!(result.extra.get("pu_kn"), Some(&json!(512.0)));
        assert!(result.is_compliant());
        assert!(!pier("P1", 1.01).is_compliant());
    }

    #[test]
    fn test_request_serialization() {
        let key = ElementKey::new("L1", "P1");
        let request = AnalysisRequest::new(SessionId::new("abc"))
            .with_update(ElementUpdate::new(
                &key,
                ReinforcementConfig {
                    stirrup_diameter_mm: Some(12.0),
                    ..Default::default()
                },
            ))
            .with_moment_axis(MomentAxis::Srss, 30.0);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["session_id"], "abc");
        assert_eq!(value["moment_axis"], "SRSS");
        assert_eq!(value["element_updates"][0]["story"], "L1");
        assert_eq!(value["element_updates"][0]["stirrup_diameter_mm"], 12.0);
        assert!(value["element_updates"][0].get("stirrup_spacing_mm").is_none());
    }
}
