//! Sends a run's reportable outcomes to the backend.
//!
//! Outside production nothing is sent; each result is logged with a mock
//! response instead. A failed report is logged and counted, never fatal.

use futures::stream::{self, StreamExt};
use vaxwatch_backend::BackendClient;
use vaxwatch_core::WorkResult;
use vaxwatch_scraper::RunSummary;

const MAX_CONCURRENT_REPORTS: usize = 4;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReportTotals {
    pub sent: usize,
    pub failed: usize,
    pub mocked: usize,
    pub suppressed: usize,
}

pub(crate) async fn report_outcomes(
    backend: &BackendClient,
    summary: &RunSummary,
    enabled: bool,
    pipeline: &str,
) -> ReportTotals {
    let mut totals = ReportTotals {
        suppressed: summary.outcomes.iter().filter(|o| !o.report).count(),
        ..ReportTotals::default()
    };

    if !enabled {
        for result in summary.reportable() {
            tracing::info!(
                pipeline,
                item = %result.key,
                status = %result.status,
                tags = ?result.tags,
                alarm = result.alarm,
                "reporting disabled, mock response: ok"
            );
            totals.mocked += 1;
        }
        return totals;
    }

    let sent: Vec<bool> = stream::iter(summary.reportable())
        .map(|result| send_one(backend, result, pipeline))
        .buffer_unordered(MAX_CONCURRENT_REPORTS)
        .collect()
        .await;
    for ok in sent {
        if ok {
            totals.sent += 1;
        } else {
            totals.failed += 1;
        }
    }

    if totals.failed > 0 {
        tracing::warn!(
            pipeline,
            failed = totals.failed,
            sent = totals.sent,
            "some results could not be reported"
        );
    }
    totals
}

async fn send_one(backend: &BackendClient, result: &WorkResult, pipeline: &str) -> bool {
    match backend.report(result).await {
        Ok(body) => {
            tracing::debug!(pipeline, item = %result.key, response = %body, "reported");
            true
        }
        Err(e) => {
            tracing::error!(pipeline, item = %result.key, error = %e, "failed to report result");
            false
        }
    }
}

#[cfg(test)]
#[path = "report_test.rs"]
mod tests;
