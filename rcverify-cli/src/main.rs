//! rcverify CLI - check concrete elements of an ETABS export against ACI 318
//!
//! Usage:
//!   rcverify <FILE> [--api <url>] [--edit <STORY/LABEL> <FIELD=VALUE,...>]...
//!            [--proposal <STORY/LABEL> <TEXT>]... [--report <OUT.pdf>] [--no-stream] [-v]
//!
//! Example:
//!   rcverify tower.xlsx --edit L3/P1 stirrup_diameter_mm=12,stirrup_spacing_mm=100
//!   rcverify tower.xlsx --proposal L1/C4 "8Ø25; ties Ø10@100 (4 legs)" --report tower.pdf

use anyhow::{bail, Context, Result};
use colored::Colorize;
use rcverify::prelude::*;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn print_usage() {
    eprintln!(
        r#"
{} - Verify concrete piers, columns, beams and slabs from an ETABS export

{}
    rcverify <FILE> [OPTIONS]

{}
    <FILE>     ETABS spreadsheet export (.xlsx or .xls)

{}
    -u, --api <URL>                        Verification service URL (default: $RCVERIFY_API_URL
                                           or http://localhost:8000)
    -e, --edit <STORY/LABEL> <CHANGES>     Edit one element and re-analyse it; CHANGES is a
                                           comma-separated list of FIELD=VALUE
    -p, --proposal <STORY/LABEL> <TEXT>    Apply a design suggestion such as "Ø12@100 stirrups"
    -r, --report <OUT.pdf>                 Save the PDF report after all edits
    --no-stream                            Wait for the whole analysis instead of streaming progress
    -v, --verbose                          Debug logging
    -vv                                    Trace logging, including HTTP internals
    -h, --help                             Print this help message

{}
    {}

{}
    rcverify tower.xlsx
    rcverify tower.xlsx -e L3/P1 stirrup_diameter_mm=12,stirrup_spacing_mm=100
    rcverify tower.xlsx -p L1/C4 "8Ø25; ties Ø10@100 (4 legs)" -r tower.pdf
"#,
        "rcverify".bold(),
        "USAGE:".bold(),
        "ARGS:".bold(),
        "OPTIONS:".bold(),
        "EDITABLE FIELDS:".bold(),
        ReinforcementConfig::FIELDS.join(", "),
        "EXAMPLES:".bold(),
    );
}

struct ElementEdit {
    key: ElementKey,
    changes: ReinforcementConfig,
}

struct CliArgs {
    file: PathBuf,
    api_url: Option<String>,
    edits: Vec<ElementEdit>,
    proposals: Vec<(ElementKey, String)>,
    report: Option<PathBuf>,
    stream: bool,
    verbose: u8, // 0=info, 1=debug, 2=trace
}

/// `field=value[,field=value...]`
fn parse_changes(text: &str) -> Result<ReinforcementConfig> {
    let mut changes = ReinforcementConfig::default();
    for pair in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (field, value) = pair
            .split_once('=')
            .with_context(|| format!("Expected FIELD=VALUE, got '{}'", pair))?;
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("'{}' is not a number", value.trim()))?;
        changes.set(field.trim(), value)?;
    }
    if changes.is_empty() {
        bail!("No reinforcement changes given");
    }
    Ok(changes)
}

fn parse_args() -> Result<CliArgs> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        std::process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let file = PathBuf::from(&args[1]);
    let mut api_url = None;
    let mut edits = Vec::new();
    let mut proposals = Vec::new();
    let mut report = None;
    let mut stream = true;
    let mut verbose: u8 = 0;

    let value_at = |i: usize, flag: &str| -> Result<String> {
        args.get(i)
            .cloned()
            .with_context(|| format!("{} is missing a value", flag))
    };

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            flag @ ("--api" | "-u") => {
                api_url = Some(value_at(i + 1, flag)?);
                i += 1;
            }
            flag @ ("--edit" | "-e") => {
                let key = ElementKey::parse(&value_at(i + 1, flag)?)?;
                let changes = parse_changes(&value_at(i + 2, flag)?)
                    .with_context(|| format!("Invalid edit for {}", key))?;
                edits.push(ElementEdit { key, changes });
                i += 2;
            }
            flag @ ("--proposal" | "-p") => {
                let key = ElementKey::parse(&value_at(i + 1, flag)?)?;
                proposals.push((key, value_at(i + 2, flag)?));
                i += 2;
            }
            flag @ ("--report" | "-r") => {
                report = Some(PathBuf::from(value_at(i + 1, flag)?));
                i += 1;
            }
            "--no-stream" => stream = false,
            "--verbose" | "-v" => verbose = verbose.max(1),
            "-vv" => verbose = 2,
            other => bail!("Unknown argument '{}' (see --help)", other),
        }
        i += 1;
    }

    Ok(CliArgs {
        file,
        api_url,
        edits,
        proposals,
        report,
        stream,
        verbose,
    })
}

fn init_tracing(verbose: u8) {
    let default_filter = match verbose {
        0 => "rcverify=info",
        1 => "rcverify=debug",
        _ => "rcverify=trace,reqwest=debug,hyper_util=debug",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Progress line on stderr, result kept for the caller
#[derive(Default)]
struct TerminalProgress {
    batch: Option<AnalysisResultBatch>,
    error: Option<ClientError>,
}

impl AnalysisHandler for TerminalProgress {
    fn on_progress(&mut self, current: u32, total: u32, label: &str) {
        let pct = if total == 0 {
            0.0
        } else {
            current as f64 / total as f64 * 100.0
        };
        eprint!(
            "\r{} [{:>4}/{:<4}] {:>5.1}%  {:<32}",
            "Analysing".cyan(),
            current,
            total,
            pct,
            label
        );
        let _ = std::io::stderr().flush();
    }

    fn on_complete(&mut self, batch: AnalysisResultBatch) {
        self.batch = Some(batch);
    }

    fn on_error(&mut self, error: ClientError) {
        self.error = Some(error);
    }
}

async fn run_streaming(client: &VerifyClient, request: &AnalysisRequest) -> Result<AnalysisResultBatch> {
    let cancel = CancelToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling analysis");
                cancel.cancel();
            }
        })
    };

    let mut progress = TerminalProgress::default();
    let outcome = client
        .run_streaming_analysis(request, &mut progress, cancel)
        .await;
    ctrl_c.abort();
    eprintln!();

    match outcome {
        StreamOutcome::Completed => progress
            .batch
            .context("Analysis completed without a result batch"),
        StreamOutcome::Failed => match progress.error {
            Some(e) => Err(anyhow::Error::new(e).context("Streaming analysis failed")),
            None => bail!("Streaming analysis failed"),
        },
        StreamOutcome::Cancelled => bail!("Analysis cancelled"),
    }
}

fn format_dcr(result: &ElementResult) -> String {
    match result.governing_check() {
        Some(check) => {
            let text = format!("{:>6.3} ({})", check.dcr, check.mode);
            if check.dcr <= 1.0 {
                text.green().to_string()
            } else {
                text.red().bold().to_string()
            }
        }
        None => "   n/a".dimmed().to_string(),
    }
}

fn print_row(result: &ElementResult) {
    eprintln!(
        "    {:<20} {}  {}",
        result.key().to_string(),
        format_dcr(result),
        result.critical_combination.as_deref().unwrap_or("-").dimmed()
    );
}

fn print_summary(batch: &AnalysisResultBatch) {
    for category in ElementCategory::ALL {
        let results = batch.category(category);
        if results.is_empty() {
            continue;
        }
        let failing = results.iter().filter(|r| !r.is_compliant()).count();
        eprintln!();
        eprintln!(
            "  {} ({} elements, {} over capacity)",
            category.display_name().bold(),
            results.len(),
            failing
        );
        for result in results {
            print_row(result);
        }
    }
    eprintln!();
}

fn report_outcome(reconciler: &ElementReconciler, key: &ElementKey, outcome: ClientResult<ReanalyzeOutcome>) {
    match outcome {
        Ok(ReanalyzeOutcome::Applied(result)) => {
            eprintln!("  {} {}", "Updated".green().bold(), key);
            print_row(&result);
        }
        Ok(ReanalyzeOutcome::Skipped) if !reconciler.contains(key) => {
            eprintln!("  {} {}: not in this model", "Skipped".yellow().bold(), key);
        }
        Ok(ReanalyzeOutcome::Skipped) => {
            eprintln!("  {} {}: nothing to apply", "Skipped".yellow().bold(), key);
        }
        Ok(ReanalyzeOutcome::Superseded) => {
            eprintln!("  {} {}: superseded by a newer edit", "Skipped".yellow().bold(), key);
        }
        Err(e) => {
            eprintln!("  {} {}: {}", "Failed".red().bold(), key, e.user_message());
            if let Some(config) = reconciler.reinforcement(key) {
                eprintln!("    kept edited reinforcement: {:?}", config);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    init_tracing(args.verbose);

    let mut config = ClientConfig::from_env();
    if let Some(url) = &args.api_url {
        config.base_url = url.clone();
    }
    let client = Arc::new(VerifyClient::new(config).context("Failed to build HTTP client")?);

    match client.health_check().await {
        Ok(health) => tracing::debug!(
            "Service {} (version {})",
            health.status,
            health.version.as_deref().unwrap_or("unknown")
        ),
        Err(e) => tracing::warn!("Health check failed: {}", e),
    }

    let upload = client
        .upload(&args.file)
        .await
        .with_context(|| format!("Failed to upload {}", args.file.display()))?;
    eprintln!(
        "{} {} ({} piers, {} columns, {} beams, {} slabs)",
        "Session".bold(),
        upload.session_id,
        upload.summary.piers.len(),
        upload.summary.columns.len(),
        upload.summary.beams.len(),
        upload.summary.slabs.len()
    );

    let reconciler = ElementReconciler::new(client.clone());
    reconciler.load_session(&upload);
    let request = reconciler
        .full_request()
        .context("No active session after upload")?;

    let batch = if args.stream {
        run_streaming(&client, &request).await?
    } else {
        client.analyze(&request).await.context("Analysis failed")?
    };
    reconciler.apply_batch(batch);
    print_summary(&reconciler.batch());

    for edit in &args.edits {
        let outcome = reconciler.edit_and_reanalyze(&edit.key, &edit.changes).await;
        report_outcome(&reconciler, &edit.key, outcome);
    }
    for (key, text) in &args.proposals {
        let outcome = reconciler
            .apply_proposal(key, &DesignProposal::Text(text.clone()))
            .await;
        report_outcome(&reconciler, key, outcome);
    }

    if let Some(path) = &args.report {
        let mut report = ReportConfig::new(upload.session_id.clone());
        report.project_name = args
            .file
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
        let size = client
            .save_report(&report, path)
            .await
            .with_context(|| format!("Failed to save report to {}", path.display()))?;
        eprintln!("{} {} ({} KB)", "Report".bold(), path.display(), size / 1024);
    }

    Ok(())
}
