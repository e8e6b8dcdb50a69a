//! Command-line interface

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Local};
use clap::{Args, Parser, Subcommand};
use filing_dl::pacing::RequestPacer;
use filing_dl::{
    Config, DateRange, DedupOptions, DownloadExecutor, Error, Event, HttpFetcher, IndexBuilder,
    Result, SearchQuery, Source, cancel_on_signal, client_for, dedup, load_index, persist,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "filing-dl")]
#[command(about = "Build disclosure indexes and download the filings they list")]
#[command(version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "FILING_DL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Query a portal and write an index snapshot
    IndexBuild(IndexArgs),

    /// Download every entry of an index snapshot
    Download {
        /// Index file (.json or .csv)
        index: PathBuf,
        /// Number of download workers
        #[arg(short, long)]
        workers: Option<usize>,
        /// Output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Classify index entries against earlier downloads and flag identical files
    Dedup {
        /// Directory holding the download reports
        artifact_dir: PathBuf,
        /// Index file or download report to check
        input: PathBuf,
        /// Delete redundant copies of identical files
        #[arg(long)]
        remove_duplicates: bool,
    },

    /// Build an index, then download it
    Run {
        #[command(flatten)]
        index: IndexArgs,
        /// Number of download workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
}

#[derive(Args)]
struct IndexArgs {
    /// Search keyword (may be empty for a date-only query)
    keyword: String,
    /// Portal to query
    #[arg(long, default_value = "cninfo")]
    source: Source,
    /// First publication date (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<String>,
    /// Last publication date (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<String>,
    /// Records per page
    #[arg(long)]
    page_size: Option<u32>,
    /// Stop after this many pages (disables range splitting)
    #[arg(long)]
    max_pages: Option<u32>,
    /// Stop after this many entries (disables range splitting)
    #[arg(long)]
    max_results: Option<usize>,
    /// Portal-specific filter, repeatable (e.g. --filter column=sse)
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, String)>,
    /// Output directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

fn parse_filter(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty filter key in '{}'", raw));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

/// Parse arguments and run the selected command
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };

    let cancel = CancellationToken::new();
    let _signal_watch = SignalWatch(cancel_on_signal(cancel.clone()));
    match cli.command {
        Commands::IndexBuild(args) => index_build(&mut config, &args, &cancel).await.map(|_| ()),
        Commands::Download {
            index,
            workers,
            output_dir,
        } => {
            if let Some(dir) = output_dir {
                config.download.output_dir = dir;
            }
            download(&config, &index, workers, &cancel).await
        }
        Commands::Dedup {
            artifact_dir,
            input,
            remove_duplicates,
        } => run_dedup(&artifact_dir, &input, remove_duplicates),
        Commands::Run { index, workers } => {
            build_then_download(&mut config, &index, workers, &cancel).await
        }
    }
}

// Aborts the signal listener however the command returns
struct SignalWatch(JoinHandle<()>);

impl Drop for SignalWatch {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn build_then_download(
    config: &mut Config,
    args: &IndexArgs,
    workers: Option<usize>,
    cancel: &CancellationToken,
) -> Result<()> {
    let latest = index_build(config, args, cancel).await?;
    if cancel.is_cancelled() {
        return Err(Error::ShuttingDown);
    }
    download(config, &latest, workers, cancel).await
}

// Returns the path of the latest JSON snapshot
async fn index_build(
    config: &mut Config,
    args: &IndexArgs,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    if let Some(dir) = &args.output_dir {
        config.download.output_dir = dir.clone();
    }
    if args.page_size.is_some() {
        config.search.page_size = args.page_size;
    }
    if args.max_pages.is_some() {
        config.search.max_pages = args.max_pages;
    }
    if args.max_results.is_some() {
        config.search.max_results = args.max_results;
    }
    config.validate()?;

    let range = date_range(config, args)?;
    let mut query = SearchQuery::new(args.keyword.trim());
    for (key, value) in &args.filters {
        query = query.with_filter(key, value);
    }

    let client = client_for(args.source, &config.http)?;
    let outcome = IndexBuilder::new(client.as_ref(), &config.search, &config.retry)
        .with_cancel(cancel.clone())
        .build(&query, range)
        .await?;
    let paths = persist(
        &outcome.snapshot,
        &config.download.index_dir(),
        args.source.as_str(),
    )?;

    let snapshot = &outcome.snapshot;
    println!(
        "Indexed {} entries ({} reported) for {} over {}",
        snapshot.entries.len(),
        snapshot.total_observed,
        args.source,
        range
    );
    for warning in &snapshot.warnings {
        println!("  warning: {}", warning);
    }
    if snapshot.is_partial() {
        tracing::warn!(warnings = snapshot.warnings.len(), "index is partial");
    }
    println!("  {}", paths.json.display());
    println!("  {}", paths.csv.display());
    Ok(paths.latest_json)
}

fn date_range(config: &Config, args: &IndexArgs) -> Result<DateRange> {
    let today = Local::now().date_naive();
    let end = match &args.end_date {
        Some(raw) => raw.clone(),
        None => today.format("%Y-%m-%d").to_string(),
    };
    let start = match &args.start_date {
        Some(raw) => raw.clone(),
        None => (today - Duration::days(config.search.default_lookback_days))
            .format("%Y-%m-%d")
            .to_string(),
    };
    DateRange::parse(&start, &end)
}

async fn download(
    config: &Config,
    index: &Path,
    workers: Option<usize>,
    cancel: &CancellationToken,
) -> Result<()> {
    let snapshot = load_index(index)?;
    let workers = workers.unwrap_or(config.download.workers);
    let pacer = RequestPacer::new(config.download.min_request_interval);
    let fetcher = Arc::new(HttpFetcher::new(&config.http)?.with_pacer(pacer.clone()));
    let executor = DownloadExecutor::new(fetcher, &config.download, &config.retry)
        .with_pacer(pacer)
        .with_cancel(cancel.clone());

    let mut events = executor.subscribe();
    let printer = tokio::spawn(async move {
        let mut done = 0;
        let mut scheduled = 0;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                Event::Started {
                    total,
                    scheduled: n,
                    skipped,
                } => {
                    scheduled = n;
                    println!(
                        "{} entries: {} to fetch, {} already downloaded",
                        total, n, skipped
                    );
                }
                Event::EntryFinished { record } => {
                    done += 1;
                    println!(
                        "[{}/{}] {} {}",
                        done,
                        scheduled,
                        record.status.as_str(),
                        record.unique_key
                    );
                }
                Event::ReportWritten { is_final: true, .. } => break,
                _ => {}
            }
        }
    });

    let summary = executor.execute(&snapshot, workers).await?;
    printer.await.ok();

    println!(
        "Report: {} (success {}, failed {}, pending {}, skipped {})",
        summary.report_path.display(),
        summary.count(filing_dl::DownloadStatus::Success),
        summary.count(filing_dl::DownloadStatus::Failed),
        summary.count(filing_dl::DownloadStatus::Pending),
        summary.skipped,
    );
    if summary.interrupted {
        println!("Interrupted; rerun the same command to resume.");
    }
    Ok(())
}

fn run_dedup(artifact_dir: &Path, input: &Path, remove_duplicates: bool) -> Result<()> {
    let report = dedup(artifact_dir, input, DedupOptions { remove_duplicates })?;
    println!(
        "satisfied {}, missing {}, duplicate {}",
        report.count("satisfied"),
        report.count("missing"),
        report.count("duplicate_content")
    );
    if remove_duplicates {
        println!(
            "removed {} files, freed {} bytes",
            report.removed.len(),
            report.freed_bytes
        );
    }
    println!("Report: {}", report.report_path.display());
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[tokio::test]
    async fn signal_watch_stops_listener_on_early_return() {
        let cancel = CancellationToken::new();
        let held = Arc::new(());
        let in_task = Arc::clone(&held);
        let task_cancel = cancel.clone();
        let watch = SignalWatch(tokio::spawn(async move {
            let _held = in_task;
            task_cancel.cancelled().await;
        }));

        let early = async {
            let _watch = watch;
            Err::<(), _>(Error::ShuttingDown)?;
            Ok::<(), Error>(())
        };
        assert!(early.await.is_err());
        for _ in 0..50 {
            if Arc::strong_count(&held) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        assert_eq!(Arc::strong_count(&held), 1);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn filters_parse_as_pairs() {
        assert_eq!(
            parse_filter("column= sse ").unwrap(),
            ("column".to_string(), "sse".to_string())
        );
        assert_eq!(parse_filter("board=").unwrap().1, "");
        assert!(parse_filter("novalue").is_err());
        assert!(parse_filter("=x").is_err());
    }

    #[test]
    fn index_build_arguments() {
        let cli = Cli::try_parse_from([
            "filing-dl",
            "index-build",
            "问询函",
            "--source",
            "sse-inquiry",
            "--start-date",
            "2024-01-01",
            "--filter",
            "board=",
            "-o",
            "/tmp/out",
        ])
        .unwrap();
        let Commands::IndexBuild(args) = cli.command else {
            panic!("wrong subcommand");
        };
        assert_eq!(args.source, Source::SseInquiry);
        assert_eq!(args.filters, vec![("board".to_string(), String::new())]);
        assert_eq!(args.output_dir, Some(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn inverted_dates_are_rejected() {
        let cli = Cli::try_parse_from([
            "filing-dl",
            "index-build",
            "x",
            "--start-date",
            "2024-02-01",
            "--end-date",
            "2024-01-01",
        ])
        .unwrap();
        let Commands::IndexBuild(args) = cli.command else {
            panic!("wrong subcommand");
        };
        let err = date_range(&Config::default(), &args).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn default_range_ends_today() {
        let cli = Cli::try_parse_from(["filing-dl", "index-build", "x"]).unwrap();
        let Commands::IndexBuild(args) = cli.command else {
            panic!("wrong subcommand");
        };
        let range = date_range(&Config::default(), &args).unwrap();
        assert_eq!(range.end, Local::now().date_naive());
        assert_eq!(range.days(), 31);
    }
}
