mod config;

use std::{fs, path::Path, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use funnel_jobs::{
    DateRangeSelection, EnqueueOutcome, FunnelJobQueue, HttpReportFetcher, JobEvent, JobOutcome,
};
use futures::StreamExt;
use serde::Deserialize;
use shared::protocol::{DataEnvelope, DateRange, Funnel};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::config::{load_settings, DEFAULT_SETTINGS_FILE};

/// Fetches funnel reports for a list of funnels, one funnel at a time.
#[derive(Parser, Debug)]
struct Args {
    /// JSON file holding the funnels, either a bare array or a `{"data": [...]}` envelope.
    #[arg(long)]
    funnels: PathBuf,
    #[arg(long)]
    start_date: NaiveDate,
    #[arg(long)]
    end_date: NaiveDate,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FunnelListing {
    Envelope(DataEnvelope<Vec<Funnel>>),
    List(Vec<Funnel>),
}

fn read_funnels(path: &Path) -> Result<Vec<Funnel>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read funnels from {}", path.display()))?;
    let listing: FunnelListing = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a funnel list", path.display()))?;
    Ok(match listing {
        FunnelListing::Envelope(envelope) => envelope.data,
        FunnelListing::List(funnels) => funnels,
    })
}

async fn wait_for_reports(
    queue: &FunnelJobQueue,
    events: &mut BroadcastStream<JobEvent>,
    expected: usize,
) -> Result<()> {
    loop {
        let snapshot = queue.snapshot().await;
        if snapshot.active.is_none()
            && snapshot.pending.is_empty()
            && snapshot.completed.len() >= expected
        {
            return Ok(());
        }

        match events.next().await {
            Some(Ok(event)) => debug!(?event, "queue event"),
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                warn!(skipped, "missed queue events")
            }
            None => bail!("funnel report queue stopped before every report was fetched"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config);
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    let api_url = Url::parse(&settings.api_url)
        .with_context(|| format!("invalid api url {}", settings.api_url))?;
    let range = DateRange::new(args.start_date, args.end_date)?;
    let funnels = read_funnels(&args.funnels)?;

    info!(
        funnels = funnels.len(),
        %api_url,
        start_date = %range.start_date,
        end_date = %range.end_date,
        "starting funnel report run"
    );

    let queue = FunnelJobQueue::spawn(
        Arc::new(HttpReportFetcher::new(api_url)),
        DateRangeSelection::new(range),
        settings.queue_settings(),
    );
    let mut events = BroadcastStream::new(queue.subscribe_events());

    let mut expected = 0;
    for funnel in funnels {
        if queue.enqueue(funnel).await == EnqueueOutcome::Queued {
            expected += 1;
        }
    }

    wait_for_reports(&queue, &mut events, expected).await?;

    let snapshot = queue.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&queue.funnels().await)?);
    queue.shutdown().await;

    let failed: Vec<_> = snapshot
        .completed
        .iter()
        .filter(|record| matches!(record.outcome, JobOutcome::Failed { .. }))
        .map(|record| record.funnel_id.to_string())
        .collect();
    if !failed.is_empty() {
        bail!("reports failed for funnels {}", failed.join(", "));
    }

    info!(reports = snapshot.completed.len(), "funnel report run finished");
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
