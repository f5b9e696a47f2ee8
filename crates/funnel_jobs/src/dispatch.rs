use std::{sync::Arc, time::Duration};

use shared::{
    domain::{ConnectionId, FunnelId, StepId},
    protocol::{FunnelReportRequest, Report},
};
use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};
use tracing::{error, info, warn};

use crate::{
    conversion::calculate_conversions,
    debounce::Debouncer,
    queue::{
        Activation, DateRangeSelection, JobEvent, JobOutcome, JobRecord, QueueSettings,
        QueueShared,
    },
    step_filter::remove_disabled_steps,
    ReportFetchError, ReportFetcher,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("funnel {funnel_id} is not the active report job (active: {active:?})")]
    NotActive {
        funnel_id: FunnelId,
        active: Option<FunnelId>,
    },
    #[error("funnel {funnel_id} is not loaded")]
    UnknownFunnel { funnel_id: FunnelId },
    #[error("failed to fetch report for funnel {funnel_id}: {source}")]
    Fetch {
        funnel_id: FunnelId,
        #[source]
        source: ReportFetchError,
    },
    #[error("report fetch for funnel {funnel_id} timed out after {after:?}")]
    TimedOut { funnel_id: FunnelId, after: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub funnel_id: FunnelId,
    /// Steps left after disabled ones were removed.
    pub steps: usize,
    /// Error the backend embedded in an otherwise successful response.
    pub report_error: Option<String>,
}

/// Runs the fetch, filter and conversion sequence for the active funnel.
pub(crate) struct ReportDispatcher {
    shared: Arc<QueueShared>,
    fetcher: Arc<dyn ReportFetcher>,
    date_range: DateRangeSelection,
    settings: QueueSettings,
}

struct ActiveJob {
    request: FunnelReportRequest,
    connection_id: ConnectionId,
    disabled_steps: Option<Vec<StepId>>,
}

impl ReportDispatcher {
    pub(crate) fn new(
        shared: Arc<QueueShared>,
        fetcher: Arc<dyn ReportFetcher>,
        date_range: DateRangeSelection,
        settings: QueueSettings,
    ) -> Self {
        Self {
            shared,
            fetcher,
            date_range,
            settings,
        }
    }

    /// Fetches and post-processes the report for `funnel_id`, which must be the
    /// active funnel. Whatever the result, the active slot is released and the
    /// job recorded as completed or failed.
    pub(crate) async fn dispatch(&self, funnel_id: FunnelId) -> Result<DispatchReport, DispatchError> {
        let job = self.begin(funnel_id).await?;

        info!(
            %funnel_id,
            connection_id = %job.connection_id,
            start_date = %job.request.start_date,
            end_date = %job.request.end_date,
            "fetching funnel report"
        );

        let fetched = match timeout(
            self.settings.fetch_timeout,
            self.fetcher.fetch(job.connection_id, &job.request),
        )
        .await
        {
            Ok(Ok(report)) => Ok(report),
            Ok(Err(source)) => Err(DispatchError::Fetch { funnel_id, source }),
            Err(_) => Err(DispatchError::TimedOut {
                funnel_id,
                after: self.settings.fetch_timeout,
            }),
        };

        match fetched {
            Ok(report) => {
                let report =
                    self.process_report(funnel_id, report, job.disabled_steps.as_deref());
                let dispatched = DispatchReport {
                    funnel_id,
                    steps: report.steps.len(),
                    report_error: report.error.clone(),
                };
                self.settle(
                    funnel_id,
                    Some(report),
                    JobOutcome::ReportReady {
                        steps: dispatched.steps,
                        report_error: dispatched.report_error.clone(),
                    },
                )
                .await;
                Ok(dispatched)
            }
            Err(err) => {
                self.settle(
                    funnel_id,
                    None,
                    JobOutcome::Failed {
                        reason: err.to_string(),
                    },
                )
                .await;
                Err(err)
            }
        }
    }

    async fn begin(&self, funnel_id: FunnelId) -> Result<ActiveJob, DispatchError> {
        let mut state = self.shared.state.lock().await;
        if state.active != Some(funnel_id) {
            return Err(DispatchError::NotActive {
                funnel_id,
                active: state.active,
            });
        }

        // The date range is read now, when the fetch actually starts.
        let job = state.funnel(funnel_id).map(|funnel| ActiveJob {
            request: FunnelReportRequest::new(self.date_range.current(), funnel.steps.clone()),
            connection_id: funnel.connection_id,
            disabled_steps: funnel.disabled_steps().map(<[StepId]>::to_vec),
        });
        let Some(job) = job else {
            drop(state);
            let err = DispatchError::UnknownFunnel { funnel_id };
            self.settle(
                funnel_id,
                None,
                JobOutcome::Failed {
                    reason: err.to_string(),
                },
            )
            .await;
            return Err(err);
        };

        state.is_loading = true;
        Ok(job)
    }

    fn process_report(
        &self,
        funnel_id: FunnelId,
        mut report: Report,
        disabled_steps: Option<&[StepId]>,
    ) -> Report {
        if let Some(report_error) = &report.error {
            warn!(%funnel_id, %report_error, "funnel report came back with an error");
        }

        report.steps = remove_disabled_steps(std::mem::take(&mut report.steps), disabled_steps);
        calculate_conversions(&mut report.steps, self.settings.rate_format);
        report
    }

    async fn settle(&self, funnel_id: FunnelId, report: Option<Report>, outcome: JobOutcome) {
        let mut state = self.shared.state.lock().await;
        if let Some(report) = report {
            if let Some(funnel) = state.funnel_mut(funnel_id) {
                funnel.report = Some(report);
            }
        }
        if state.active == Some(funnel_id) {
            state.active = None;
        }
        state.is_loading = false;
        state.completed.push(JobRecord {
            funnel_id,
            outcome: outcome.clone(),
        });

        self.shared.emit(match outcome {
            JobOutcome::ReportReady { .. } => JobEvent::ReportReady { funnel_id },
            JobOutcome::Failed { reason } => JobEvent::Failed { funnel_id, reason },
        });
    }

    pub(crate) async fn activate_next(&self) -> Activation {
        let mut state = self.shared.state.lock().await;
        self.shared.activate_next_locked(&mut state)
    }

    /// Arms `debouncer` with `funnel_id`. A different funnel it displaces goes back
    /// to the head of the pending queue.
    pub(crate) async fn arm(&self, debouncer: &mut Debouncer<FunnelId>, funnel_id: FunnelId) {
        let Some(displaced) = debouncer.call(funnel_id) else {
            return;
        };
        if displaced != funnel_id {
            let mut state = self.shared.state.lock().await;
            self.shared.requeue_locked(&mut state, displaced);
        }
    }
}

/// Drives dispatches: activation triggers arrive from the queue handle, each one
/// waits out the debounce window, and the next funnel is activated as soon as
/// the current dispatch settles.
pub(crate) async fn run_dispatch_worker(
    dispatcher: ReportDispatcher,
    mut triggers: mpsc::UnboundedReceiver<FunnelId>,
    debounce_window: Duration,
) {
    info!("funnel report dispatch worker started");
    let mut debouncer = Debouncer::new(debounce_window);

    loop {
        tokio::select! {
            trigger = triggers.recv() => match trigger {
                Some(funnel_id) => dispatcher.arm(&mut debouncer, funnel_id).await,
                None => {
                    if let Some(funnel_id) = debouncer.cancel() {
                        info!(%funnel_id, "queue closed before funnel report was dispatched");
                    }
                    info!("funnel report dispatch worker shutting down");
                    return;
                }
            },
            funnel_id = debouncer.expired(), if debouncer.is_armed() => {
                match dispatcher.dispatch(funnel_id).await {
                    Ok(report) => info!(
                        %funnel_id,
                        steps = report.steps,
                        report_error = ?report.report_error,
                        "funnel report ready"
                    ),
                    Err(err) => error!(%funnel_id, error = %err, "funnel report job failed"),
                }

                match dispatcher.activate_next().await {
                    Activation::Activated(next) => dispatcher.arm(&mut debouncer, next).await,
                    Activation::Busy(_) => {}
                    Activation::Idle => dispatcher.shared.emit(JobEvent::Idle),
                }
            }
        }
    }
}
