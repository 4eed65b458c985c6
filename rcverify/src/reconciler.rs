//! Optimistic reinforcement edits and per-element re-analysis.
//!
//! [`ElementReconciler`] is the single writer of the displayed result set, the
//! working reinforcement configs and the combination-detail cache. Readers
//! get cloned snapshots between writes.
//!
//! Row life cycle: `Idle -> Updating -> Idle | Failed`. Every request for an
//! element carries a sequence number; only the response to the latest one
//! issued for that element is applied. A dataset reload (new upload, full
//! batch, reset) starts a new epoch and retires everything in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, CombinationDetailCache};
use crate::client::AnalysisBackend;
use crate::error::{ClientError, ClientResult};
use crate::proposal::DesignProposal;
use crate::types::*;

/// Display state of one table row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowState {
    Idle,
    Updating,
    /// Idle, with the message of the last failed re-analysis
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReanalyzeOutcome {
    /// The fresh result now displayed for the element
    Applied(ElementResult),
    /// A newer request for the same element (or a dataset reload) made this response stale
    Superseded,
    /// No session, unknown element, or nothing to apply; the backend was not called
    Skipped,
}

/// Orientation and output options applied to every single-element request
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOptions {
    pub generate_plots: bool,
    pub moment_axis: MomentAxis,
    pub angle_deg: f64,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            generate_plots: false,
            moment_axis: MomentAxis::M3,
            angle_deg: 0.0,
        }
    }
}

#[derive(Debug)]
struct ElementSlot {
    category: ElementCategory,
    config: ReinforcementConfig,
    row: RowState,
    /// Sequence number of the latest request issued for this element
    last_issued: u64,
    /// Bumped by every edit so a late server echo cannot clobber a newer edit
    edits: u64,
}

impl ElementSlot {
    fn new(category: ElementCategory, config: ReinforcementConfig) -> Self {
        Self {
            category,
            config,
            row: RowState::Idle,
            last_issued: 0,
            edits: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Workspace {
    session_id: Option<SessionId>,
    epoch: u64,
    options: AnalysisOptions,
    elements: HashMap<ElementKey, ElementSlot>,
    results: AnalysisResultBatch,
    cache: CombinationDetailCache,
}

impl Workspace {
    fn is_current(&self, key: &ElementKey, epoch: u64, seq: u64) -> bool {
        self.epoch == epoch
            && self
                .elements
                .get(key)
                .is_some_and(|slot| slot.last_issued == seq)
    }

    fn start_epoch(&mut self) {
        self.epoch += 1;
        self.cache.clear();
    }
}

fn lock(state: &Mutex<Workspace>) -> MutexGuard<'_, Workspace> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears `Updating` on every exit path of a re-analysis, including a dropped future
struct UpdatingGuard<'a> {
    state: &'a Mutex<Workspace>,
    key: ElementKey,
    epoch: u64,
    seq: u64,
    armed: bool,
}

impl UpdatingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut ws = lock(self.state);
        if ws.is_current(&self.key, self.epoch, self.seq) {
            if let Some(slot) = ws.elements.get_mut(&self.key) {
                if slot.row == RowState::Updating {
                    slot.row = RowState::Idle;
                }
            }
        }
    }
}

/// Owner of the editable element set of one session
pub struct ElementReconciler {
    backend: Arc<dyn AnalysisBackend>,
    state: Mutex<Workspace>,
}

impl ElementReconciler {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(Workspace::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Workspace> {
        lock(&self.state)
    }

    // ========================
    // Dataset lifecycle
    // ========================

    /// Start working on a freshly uploaded dataset.
    ///
    /// Every row resets to idle, caches are dropped and the working
    /// reinforcement of each element is seeded from the upload summary.
    pub fn load_session(&self, upload: &UploadOutcome) {
        let mut ws = self.lock();
        ws.start_epoch();
        ws.session_id = Some(upload.session_id.clone());
        ws.results = AnalysisResultBatch::new();
        ws.elements = upload
            .summary
            .iter()
            .map(|(category, element)| {
                (element.key(), ElementSlot::new(category, element.reinforcement.clone()))
            })
            .collect();
        info!(
            "Loaded session {} with {} elements",
            upload.session_id,
            ws.elements.len()
        );
    }

    /// Install a full result batch, e.g. from a completed streaming analysis.
    ///
    /// Responses to single-element requests still in flight are discarded.
    pub fn apply_batch(&self, batch: AnalysisResultBatch) {
        let mut ws = self.lock();
        ws.start_epoch();

        for slot in ws.elements.values_mut() {
            slot.row = RowState::Idle;
        }
        for (category, result) in batch.iter() {
            let slot = ws
                .elements
                .entry(result.key())
                .or_insert_with(|| ElementSlot::new(category, ReinforcementConfig::default()));
            slot.category = category;
            slot.row = RowState::Idle;
            if !result.reinforcement.is_empty() {
                slot.config = result.reinforcement.clone();
            }
        }
        info!("Installed result batch with {} elements", batch.len());
        ws.results = batch;
    }

    /// End the session; later edits and re-analyses are no-ops
    pub fn reset(&self) {
        let mut ws = self.lock();
        ws.start_epoch();
        ws.session_id = None;
        ws.elements.clear();
        ws.results = AnalysisResultBatch::new();
    }

    pub fn set_analysis_options(&self, options: AnalysisOptions) {
        self.lock().options = options;
    }

    /// Request for a full-dataset analysis of the current session
    pub fn full_request(&self) -> Option<AnalysisRequest> {
        let ws = self.lock();
        let session_id = ws.session_id.clone()?;
        Some(
            AnalysisRequest::new(session_id)
                .with_plots(ws.options.generate_plots)
                .with_moment_axis(ws.options.moment_axis, ws.options.angle_deg),
        )
    }

    // ========================
    // Edits
    // ========================

    /// Merge `changes` into the element's working reinforcement and mark its
    /// row as updating. Returns `false` (and changes nothing) for an element
    /// outside the working set.
    pub fn apply_edit(&self, key: &ElementKey, changes: &ReinforcementConfig) -> bool {
        let mut ws = self.lock();
        let Some(slot) = ws.elements.get_mut(key) else {
            debug!("Ignoring edit for unknown element {}", key);
            return false;
        };
        slot.config.merge(changes);
        slot.edits += 1;
        slot.row = RowState::Updating;
        true
    }

    /// Re-run analysis for one element and merge the result back.
    ///
    /// On success the element's entry is replaced (by key) in every category
    /// list and its combination-detail cache entry is dropped. On failure the
    /// working reinforcement keeps the user's values, the displayed result
    /// stays at its last good value and the row is marked failed.
    pub async fn reanalyze(&self, key: &ElementKey) -> ClientResult<ReanalyzeOutcome> {
        let (request, epoch, seq, edits) = {
            let mut ws = self.lock();
            let Some(session_id) = ws.session_id.clone() else {
                debug!("No active session, skipping re-analysis of {}", key);
                return Ok(ReanalyzeOutcome::Skipped);
            };
            let epoch = ws.epoch;
            let options = ws.options.clone();
            let Some(slot) = ws.elements.get_mut(key) else {
                debug!("Element {} is not in the working set, skipping", key);
                return Ok(ReanalyzeOutcome::Skipped);
            };
            slot.last_issued += 1;
            slot.row = RowState::Updating;

            let request = AnalysisRequest::new(session_id)
                .with_update(ElementUpdate::new(key, slot.config.clone()))
                .with_plots(options.generate_plots)
                .with_moment_axis(options.moment_axis, options.angle_deg);
            (request, epoch, slot.last_issued, slot.edits)
        };

        let mut guard = UpdatingGuard {
            state: &self.state,
            key: key.clone(),
            epoch,
            seq,
            armed: true,
        };

        debug!("Re-analysing {} (request #{})", key, seq);
        let response = self.backend.analyze(&request).await;

        let mut ws = self.lock();
        if !ws.is_current(key, epoch, seq) {
            guard.disarm();
            debug!("Discarding stale response #{} for {}", seq, key);
            return Ok(ReanalyzeOutcome::Superseded);
        }

        let outcome = response.and_then(|batch| {
            batch.get(key).cloned().ok_or_else(|| {
                ClientError::Decode(format!("analysis response did not include {}", key))
            })
        });

        match outcome {
            Ok(result) => {
                if ws.results.replace(&result) == 0 {
                    let category = ws.elements.get(key).map(|s| s.category);
                    if let Some(category) = category {
                        ws.results.insert(category, result.clone());
                    }
                }
                ws.cache.invalidate(key);

                if let Some(slot) = ws.elements.get_mut(key) {
                    // The server echo is authoritative unless the user edited again meanwhile
                    if slot.edits == edits && !result.reinforcement.is_empty() {
                        slot.config = result.reinforcement.clone();
                    }
                    slot.row = RowState::Idle;
                }
                guard.disarm();
                info!(
                    "Updated {}: max DCR {}",
                    key,
                    result
                        .max_dcr()
                        .map(|d| format!("{:.3}", d))
                        .unwrap_or_else(|| "n/a".to_string())
                );
                Ok(ReanalyzeOutcome::Applied(result))
            }
            Err(e) => {
                warn!("Re-analysis of {} failed: {}", key, e);
                if let Some(slot) = ws.elements.get_mut(key) {
                    slot.row = RowState::Failed(e.user_message());
                }
                guard.disarm();
                Err(e)
            }
        }
    }

    /// `apply_edit` followed by `reanalyze`
    pub async fn edit_and_reanalyze(
        &self,
        key: &ElementKey,
        changes: &ReinforcementConfig,
    ) -> ClientResult<ReanalyzeOutcome> {
        if !self.apply_edit(key, changes) {
            return Ok(ReanalyzeOutcome::Skipped);
        }
        self.reanalyze(key).await
    }

    /// Apply a backend design suggestion through the normal edit path.
    ///
    /// A proposal from which nothing can be read is skipped, not an error.
    pub async fn apply_proposal(
        &self,
        key: &ElementKey,
        proposal: &DesignProposal,
    ) -> ClientResult<ReanalyzeOutcome> {
        let changes = proposal.extract();
        if changes.is_empty() {
            debug!("Proposal for {} has nothing to apply", key);
            return Ok(ReanalyzeOutcome::Skipped);
        }
        self.edit_and_reanalyze(key, &changes).await
    }

    // ========================
    // Combination details
    // ========================

    /// Load-combination rows of an element, fetched once and then cached
    /// until the element is re-analysed. `None` for an element outside the
    /// working set.
    pub async fn combinations(&self, key: &ElementKey) -> ClientResult<Option<Vec<CombinationRow>>> {
        let (session_id, ticket) = {
            let mut ws = self.lock();
            let Some(session_id) = ws.session_id.clone() else {
                return Ok(None);
            };
            if !ws.elements.contains_key(key) {
                return Ok(None);
            }
            if let Some(rows) = ws.cache.get(key) {
                return Ok(Some(rows));
            }
            (session_id, ws.cache.ticket(key))
        };

        let rows = self.backend.combinations(&session_id, key).await?;

        self.lock().cache.insert(key.clone(), ticket, rows.clone());
        Ok(Some(rows))
    }

    // ========================
    // Snapshots
    // ========================

    pub fn session_id(&self) -> Option<SessionId> {
        self.lock().session_id.clone()
    }

    pub fn contains(&self, key: &ElementKey) -> bool {
        self.lock().elements.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ElementKey> {
        let mut keys: Vec<_> = self.lock().elements.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn result(&self, key: &ElementKey) -> Option<ElementResult> {
        self.lock().results.get(key).cloned()
    }

    pub fn results(&self, category: ElementCategory) -> Vec<ElementResult> {
        self.lock().results.category(category).to_vec()
    }

    pub fn batch(&self) -> AnalysisResultBatch {
        self.lock().results.clone()
    }

    pub fn reinforcement(&self, key: &ElementKey) -> Option<ReinforcementConfig> {
        self.lock().elements.get(key).map(|s| s.config.clone())
    }

    pub fn row_state(&self, key: &ElementKey) -> Option<RowState> {
        self.lock().elements.get(key).map(|s| s.row.clone())
    }

    pub fn cached_combinations(&self, key: &ElementKey) -> Option<Vec<CombinationRow>> {
        self.lock().cache.peek(key).map(<[CombinationRow]>::to_vec)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.lock().cache.stats()
    }
}
