//! rcverify - client core for ACI 318 concrete element verification
//!
//! Talks to a verification backend that checks piers, columns, beams and
//! slabs from an ETABS spreadsheet export, and keeps a working copy of the
//! results that the user can edit inline:
//! - Upload a spreadsheet and get a session
//! - Run a full analysis with streamed progress ([`stream`])
//! - Edit one element's reinforcement and re-analyse just that element,
//!   merging the fresh result back without disturbing the others ([`reconciler`])
//! - Lazily fetch and cache per-load-combination breakdowns ([`cache`])
//! - Generate the PDF report
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use rcverify::prelude::*;
//!
//! # async fn run() -> ClientResult<()> {
//! let client = Arc::new(VerifyClient::new(ClientConfig::new("http://localhost:8000"))?);
//! let upload = client.upload("tower.xlsx".as_ref()).await?;
//!
//! let reconciler = ElementReconciler::new(client.clone());
//! reconciler.load_session(&upload);
//!
//! let request = AnalysisRequest::new(upload.session_id.clone());
//! reconciler.apply_batch(client.analyze(&request).await?);
//!
//! let key = ElementKey::new("L1", "P1");
//! let mut changes = ReinforcementConfig::default();
//! changes.stirrup_diameter_mm = Some(12.0);
//! reconciler.edit_and_reanalyze(&key, &changes).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod proposal;
pub mod reconciler;
pub mod stream;
pub mod types;

// Re-export common types
pub mod prelude {
    pub use crate::cache::{CacheStats, CombinationDetailCache};
    pub use crate::client::{AnalysisBackend, VerifyClient};
    pub use crate::config::{ClientConfig, Endpoints};
    pub use crate::error::{ClientError, ClientResult};
    pub use crate::proposal::DesignProposal;
    pub use crate::reconciler::{AnalysisOptions, ElementReconciler, ReanalyzeOutcome, RowState};
    pub use crate::stream::{
        handler_fn, AnalysisEvent, AnalysisHandler, AnalysisStream, CancelToken, EventDecoder,
        StreamOutcome,
    };
    pub use crate::types::{
        AnalysisRequest, AnalysisResultBatch, CapacityCheck, CombinationDetail, CombinationRow,
        ElementCategory, ElementKey, ElementResult, ElementSummary, ElementUpdate, HealthResponse,
        MomentAxis, ReinforcementConfig, ReportConfig, SectionGeometry, SessionId, UploadOutcome,
        UploadSummary,
    };
}
