//! Funnel report job queue.
//!
//! Funnels are queued FIFO and reported one at a time. Only one funnel is ever
//! active; the next one is activated when the active job settles, whether its
//! fetch succeeded, failed or timed out. Each activation reaches the dispatch
//! worker through a debounce window, and because a trigger is only issued when
//! the active slot was empty, no activated funnel is ever superseded.

use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use serde::Serialize;
use shared::{
    domain::FunnelId,
    protocol::{DateRange, Funnel},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    conversion::RateFormat,
    debounce::DEFAULT_DEBOUNCE_WINDOW,
    dispatch::{run_dispatch_worker, ReportDispatcher},
    ReportFetcher,
};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub debounce_window: Duration,
    /// Upper bound on a single report fetch; the active slot is released when it elapses.
    pub fetch_timeout: Duration,
    pub rate_format: RateFormat,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            rate_format: RateFormat::default(),
        }
    }
}

/// Date range picked in the dashboard, shared with the dispatch worker.
///
/// Reports use the range current when their fetch starts, not when the funnel was queued.
#[derive(Debug, Clone)]
pub struct DateRangeSelection(Arc<RwLock<DateRange>>);

impl DateRangeSelection {
    pub fn new(range: DateRange) -> Self {
        Self(Arc::new(RwLock::new(range)))
    }

    pub fn current(&self) -> DateRange {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, range: DateRange) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = range;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    ReportReady {
        steps: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        report_error: Option<String>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub funnel_id: FunnelId,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The funnel has no steps, so there is nothing to report on.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Queued { funnel_id: FunnelId },
    Skipped { funnel_id: FunnelId },
    Activated { funnel_id: FunnelId },
    Requeued { funnel_id: FunnelId },
    ReportReady { funnel_id: FunnelId },
    Failed { funnel_id: FunnelId, reason: String },
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub pending: Vec<FunnelId>,
    pub active: Option<FunnelId>,
    pub completed: Vec<JobRecord>,
    pub is_loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activation {
    Busy(FunnelId),
    Activated(FunnelId),
    Idle,
}

#[derive(Debug, Default)]
pub(crate) struct QueueState {
    pub(crate) funnels: Vec<Funnel>,
    pub(crate) pending: VecDeque<FunnelId>,
    pub(crate) active: Option<FunnelId>,
    pub(crate) completed: Vec<JobRecord>,
    pub(crate) is_loading: bool,
}

impl QueueState {
    pub(crate) fn funnel(&self, funnel_id: FunnelId) -> Option<&Funnel> {
        self.funnels.iter().find(|funnel| funnel.id == funnel_id)
    }

    pub(crate) fn funnel_mut(&mut self, funnel_id: FunnelId) -> Option<&mut Funnel> {
        self.funnels.iter_mut().find(|funnel| funnel.id == funnel_id)
    }

    fn upsert_funnel(&mut self, funnel: Funnel) {
        match self.funnel_mut(funnel.id) {
            Some(existing) => *existing = funnel,
            None => self.funnels.push(funnel),
        }
    }

    pub(crate) fn activate_next(&mut self) -> Activation {
        if let Some(active) = self.active {
            return Activation::Busy(active);
        }

        match self.pending.pop_front() {
            Some(funnel_id) => {
                self.active = Some(funnel_id);
                Activation::Activated(funnel_id)
            }
            None => {
                self.active = None;
                Activation::Idle
            }
        }
    }

    fn job_state(&self, funnel_id: FunnelId) -> Option<JobState> {
        if self.active == Some(funnel_id) {
            return Some(JobState::Active);
        }
        if self.pending.contains(&funnel_id) {
            return Some(JobState::Pending);
        }
        self.completed
            .iter()
            .rev()
            .find(|record| record.funnel_id == funnel_id)
            .map(|record| match record.outcome {
                JobOutcome::ReportReady { .. } => JobState::Completed,
                JobOutcome::Failed { .. } => JobState::Failed,
            })
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.pending.iter().copied().collect(),
            active: self.active,
            completed: self.completed.clone(),
            is_loading: self.is_loading,
        }
    }
}

/// State owned by the queue and mutated only through it and its dispatch worker.
pub(crate) struct QueueShared {
    pub(crate) state: Mutex<QueueState>,
    events: broadcast::Sender<JobEvent>,
}

impl QueueShared {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(QueueState::default()),
            events,
        }
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // No subscribers is fine; observers are optional.
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub(crate) fn activate_next_locked(&self, state: &mut QueueState) -> Activation {
        let activation = state.activate_next();
        if let Activation::Activated(funnel_id) = activation {
            info!(%funnel_id, pending = state.pending.len(), "activated funnel report job");
            self.emit(JobEvent::Activated { funnel_id });
        }
        activation
    }

    /// Puts a funnel that lost its dispatch back at the head of the queue.
    pub(crate) fn requeue_locked(&self, state: &mut QueueState, funnel_id: FunnelId) {
        if state.active == Some(funnel_id) {
            state.active = None;
        }
        state.pending.push_front(funnel_id);
        warn!(%funnel_id, "funnel report job lost its dispatch and was requeued");
        self.emit(JobEvent::Requeued { funnel_id });
    }
}

/// Handle to a running funnel report queue.
///
/// Dropping the handle (or calling [`FunnelJobQueue::shutdown`]) stops the
/// dispatch worker; funnels still pending at that point are not reported.
pub struct FunnelJobQueue {
    shared: Arc<QueueShared>,
    triggers: mpsc::UnboundedSender<FunnelId>,
    date_range: DateRangeSelection,
    worker: JoinHandle<()>,
}

impl FunnelJobQueue {
    pub fn spawn(
        fetcher: Arc<dyn ReportFetcher>,
        date_range: DateRangeSelection,
        settings: QueueSettings,
    ) -> Self {
        let shared = Arc::new(QueueShared::new());
        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        let debounce_window = settings.debounce_window;
        let dispatcher =
            ReportDispatcher::new(shared.clone(), fetcher, date_range.clone(), settings);
        let worker = tokio::spawn(run_dispatch_worker(dispatcher, trigger_rx, debounce_window));

        Self {
            shared,
            triggers,
            date_range,
            worker,
        }
    }

    /// Records the funnel and, when it has steps, queues a report job for it.
    pub async fn enqueue(&self, funnel: Funnel) -> EnqueueOutcome {
        let funnel_id = funnel.id;
        let has_steps = !funnel.steps.is_empty();

        let mut state = self.shared.state.lock().await;
        state.upsert_funnel(funnel);

        let outcome = if has_steps {
            state.pending.push_back(funnel_id);
            debug!(%funnel_id, pending = state.pending.len(), "queued funnel report job");
            self.shared.emit(JobEvent::Queued { funnel_id });
            EnqueueOutcome::Queued
        } else {
            debug!(%funnel_id, "funnel has no steps; no report job queued");
            self.shared.emit(JobEvent::Skipped { funnel_id });
            EnqueueOutcome::Skipped
        };

        let activation = self.shared.activate_next_locked(&mut state);
        self.trigger(&mut state, activation);
        outcome
    }

    /// Activates the head of the pending queue unless a funnel is already active.
    ///
    /// Returns the funnel activated by this call.
    pub async fn activate_next(&self) -> Option<FunnelId> {
        let mut state = self.shared.state.lock().await;
        let activation = self.shared.activate_next_locked(&mut state);
        self.trigger(&mut state, activation)
    }

    fn trigger(&self, state: &mut QueueState, activation: Activation) -> Option<FunnelId> {
        let Activation::Activated(funnel_id) = activation else {
            return None;
        };

        if self.triggers.send(funnel_id).is_err() {
            warn!(%funnel_id, "dispatch worker is gone; funnel report job not started");
            self.shared.requeue_locked(state, funnel_id);
            return None;
        }
        Some(funnel_id)
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        self.shared.state.lock().await.snapshot()
    }

    pub async fn job_state(&self, funnel_id: FunnelId) -> Option<JobState> {
        self.shared.state.lock().await.job_state(funnel_id)
    }

    /// Every funnel seen so far, in load order, with reports attached once fetched.
    pub async fn funnels(&self) -> Vec<Funnel> {
        self.shared.state.lock().await.funnels.clone()
    }

    pub async fn funnel(&self, funnel_id: FunnelId) -> Option<Funnel> {
        self.shared.state.lock().await.funnel(funnel_id).cloned()
    }

    pub fn date_range(&self) -> &DateRangeSelection {
        &self.date_range
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.subscribe()
    }

    /// Stops accepting work and waits for the dispatch worker to finish its current job.
    pub async fn shutdown(self) {
        let Self {
            triggers, worker, ..
        } = self;
        drop(triggers);
        if let Err(error) = worker.await {
            warn!(%error, "funnel report dispatch worker ended abnormally");
        }
    }
}
