//! HTTP client for the verification backend

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use reqwest::Response;
use serde::Deserialize;
use std::path::Path;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::stream::{AnalysisHandler, AnalysisStream, CancelToken, StreamOutcome};
use crate::types::*;

/// Spreadsheet extensions accepted by the upload endpoint
pub const UPLOAD_EXTENSIONS: [&str; 2] = ["xlsx", "xls"];

/// The two backend calls the reconciler depends on
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Single-shot analysis; `{success: false}` responses are `ClientError::Server`
    async fn analyze(&self, request: &AnalysisRequest) -> ClientResult<AnalysisResultBatch>;

    /// Per-load-combination rows of one element
    async fn combinations(
        &self,
        session_id: &SessionId,
        key: &ElementKey,
    ) -> ClientResult<Vec<CombinationRow>>;
}

/// Client for the verification service
pub struct VerifyClient {
    config: ClientConfig,
    client: reqwest::Client,
    // No total timeout: a full-dataset stream may run for minutes
    stream_client: reqwest::Client,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "detail", alias = "message")]
    error: String,
}

impl VerifyClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            stream_client,
        })
    }

    pub fn from_env() -> ClientResult<Self> {
        Self::new(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Check if the service is healthy
    pub async fn health_check(&self) -> ClientResult<HealthResponse> {
        let url = self.config.url(&self.config.endpoints.health);
        let response = self.client.get(&url).send().await?;
        Ok(check_status(response).await?.json().await?)
    }

    /// Upload an ETABS spreadsheet export from disk
    pub async fn upload(&self, path: &Path) -> ClientResult<UploadOutcome> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ClientError::InvalidInput(format!("not a file path: {}", path.display())))?
            .to_string();
        validate_upload_name(&file_name)?;

        let bytes = tokio::fs::read(path).await?;
        self.upload_bytes(&file_name, bytes).await
    }

    /// Upload an in-memory spreadsheet under `file_name`
    pub async fn upload_bytes(&self, file_name: &str, bytes: Vec<u8>) -> ClientResult<UploadOutcome> {
        validate_upload_name(file_name)?;

        let url = self.config.url(&self.config.endpoints.upload);
        tracing::info!("Uploading {} ({} bytes)", file_name, bytes.len());

        let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name.to_string()));
        let response = self.client.post(&url).multipart(form).send().await?;
        let body: UploadResponse = check_status(response).await?.json().await?;

        match body {
            UploadResponse {
                success: true,
                session_id: Some(session_id),
                summary,
                ..
            } => {
                let summary = summary.unwrap_or_default();
                tracing::info!(
                    "Upload accepted: session {}, {} elements",
                    session_id,
                    summary.len()
                );
                Ok(UploadOutcome { session_id, summary })
            }
            UploadResponse { success: true, .. } => Err(ClientError::Decode(
                "upload response is missing session_id".to_string(),
            )),
            UploadResponse { error, .. } => Err(server_error(error, "Upload failed")),
        }
    }

    /// Submit an analysis request and wait for the whole result batch
    pub async fn analyze(&self, request: &AnalysisRequest) -> ClientResult<AnalysisResultBatch> {
        let url = self.config.url(&self.config.endpoints.analyze);
        tracing::debug!(
            "Analyze session {} with {} element update(s)",
            request.session_id,
            request.element_updates.len()
        );

        let response = self.client.post(&url).json(request).send().await?;
        let body: AnalyzeResponse = check_status(response).await?.json().await?;

        if !body.success {
            return Err(server_error(body.error, "Analysis failed"));
        }
        tracing::debug!("Analyze returned {} element(s)", body.batch.len());
        Ok(body.batch)
    }

    /// Open the streaming analyze endpoint.
    ///
    /// Cancelling `cancel` aborts both the pending request and later reads.
    pub async fn analyze_stream(
        &self,
        request: &AnalysisRequest,
        cancel: CancelToken,
    ) -> ClientResult<AnalysisStream> {
        let url = self.config.url(&self.config.endpoints.analyze_stream);
        tracing::info!(
            "Starting streaming analysis for session {}",
            request.session_id
        );

        let send = self
            .stream_client
            .post(&url)
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            response = send => response?,
        };
        let response = check_status(response).await?;

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ClientError::from));
        Ok(AnalysisStream::from_chunks(chunks, cancel))
    }

    /// Run a full streaming analysis, reporting through `handler`.
    ///
    /// Failing to open the stream is reported through `on_error` like any
    /// other transport failure.
    pub async fn run_streaming_analysis<H>(
        &self,
        request: &AnalysisRequest,
        handler: &mut H,
        cancel: CancelToken,
    ) -> StreamOutcome
    where
        H: AnalysisHandler + ?Sized,
    {
        match self.analyze_stream(request, cancel).await {
            Ok(stream) => stream.dispatch(handler).await,
            Err(ClientError::Cancelled) => StreamOutcome::Cancelled,
            Err(e) => {
                tracing::warn!("Could not start streaming analysis: {}", e);
                handler.on_error(e);
                StreamOutcome::Failed
            }
        }
    }

    /// List per-load-combination results of one element
    pub async fn combinations(
        &self,
        session_id: &SessionId,
        key: &ElementKey,
    ) -> ClientResult<Vec<CombinationRow>> {
        let url = self.config.url(&self.config.endpoints.combinations);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("session_id", session_id.as_str()),
                ("story", key.story.as_str()),
                ("label", key.label.as_str()),
            ])
            .send()
            .await?;
        let body: CombinationsResponse = check_status(response).await?.json().await?;

        if !body.success {
            return Err(server_error(body.error, "Could not load combinations"));
        }
        tracing::debug!("{} combination(s) for {}", body.combinations.len(), key);
        Ok(body.combinations)
    }

    /// Full breakdown of one load combination of one element
    pub async fn combination_detail(
        &self,
        session_id: &SessionId,
        key: &ElementKey,
        index: usize,
    ) -> ClientResult<CombinationDetail> {
        let url = self.config.url(&self.config.endpoints.combination_detail);
        let index = index.to_string();
        let response = self
            .client
            .get(&url)
            .query(&[
                ("session_id", session_id.as_str()),
                ("story", key.story.as_str()),
                ("label", key.label.as_str()),
                ("index", index.as_str()),
            ])
            .send()
            .await?;
        let body: CombinationDetailResponse = check_status(response).await?.json().await?;

        match body {
            CombinationDetailResponse {
                success: true,
                detail: Some(detail),
                ..
            } => Ok(detail),
            CombinationDetailResponse { success: true, .. } => Err(ClientError::Decode(
                "combination detail response has no detail".to_string(),
            )),
            CombinationDetailResponse { error, .. } => {
                Err(server_error(error, "Could not load combination detail"))
            }
        }
    }

    /// Generate a PDF report; returns the raw document bytes
    pub async fn generate_report(&self, config: &ReportConfig) -> ClientResult<Vec<u8>> {
        let url = self.config.url(&self.config.endpoints.report);
        tracing::info!("Generating report for session {}", config.session_id);

        let response = self.client.post(&url).json(config).send().await?;
        let bytes = check_status(response).await?.bytes().await?;

        if !bytes.starts_with(b"%PDF") {
            return Err(ClientError::Decode(
                "report endpoint did not return a PDF document".to_string(),
            ));
        }
        Ok(bytes.to_vec())
    }

    /// Generate a PDF report and write it to `path`; returns its size in bytes
    pub async fn save_report(&self, config: &ReportConfig, path: &Path) -> ClientResult<usize> {
        let pdf = self.generate_report(config).await?;
        tokio::fs::write(path, &pdf).await?;
        tracing::info!("Saved report to {}", path.display());
        Ok(pdf.len())
    }
}

#[async_trait]
impl AnalysisBackend for VerifyClient {
    async fn analyze(&self, request: &AnalysisRequest) -> ClientResult<AnalysisResultBatch> {
        VerifyClient::analyze(self, request).await
    }

    async fn combinations(
        &self,
        session_id: &SessionId,
        key: &ElementKey,
    ) -> ClientResult<Vec<CombinationRow>> {
        VerifyClient::combinations(self, session_id, key).await
    }
}

fn validate_upload_name(file_name: &str) -> ClientResult<()> {
    let accepted = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            UPLOAD_EXTENSIONS
                .iter()
                .any(|allowed| ext.eq_ignore_ascii_case(allowed))
        });
    if accepted {
        Ok(())
    } else {
        Err(ClientError::InvalidInput(format!(
            "'{}' is not a spreadsheet export (expected .xlsx or .xls)",
            file_name
        )))
    }
}

fn server_error(message: Option<String>, fallback: &str) -> ClientError {
    ClientError::Server(
        message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string()),
    )
}

/// Non-2xx responses become `Server` when the body names an error, else `HttpStatus`
async fn check_status(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::warn!("Request failed with {}: {:.200}", status, body);

    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody { error }) if !error.trim().is_empty() => Err(ClientError::Server(error)),
        _ => Err(ClientError::HttpStatus {
            status: status.as_u16(),
            body,
        }),
    }
}
