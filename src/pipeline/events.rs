//! Run event multiplexer.
//!
//! Progress notices, committed patches and state snapshots all travel on one
//! bounded channel so a consumer sees them in the order the run produced them.
//! A full buffer blocks the run until the consumer catches up or the run is
//! cancelled; a dropped consumer cancels the run. Terminal events (the final
//! snapshot or a failure) ignore cancellation but give up after
//! [`TERMINAL_SEND_GRACE`] so a stalled consumer cannot park the run task.

use super::state::{PipelinePatch, PipelineState};
use super::{PipelineError, PipelineErrorKind, Stage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub const TERMINAL_SEND_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ProgressEvent {
    ParseUserRequest,
    GenerateSearchQueries,
    SearchForListings {
        search_query: String,
        remaining_queries: usize,
    },
    FilterListings {
        listings_count: usize,
    },
    ScoreListings {
        listings_count: usize,
    },
    ScoreListingsProgress {
        scored_listings_count: usize,
        total_listings_count: usize,
    },
    GenerateResponse,
}

impl ProgressEvent {
    pub fn description(&self) -> String {
        match self {
            ProgressEvent::ParseUserRequest => "Planning search parameters".into(),
            ProgressEvent::GenerateSearchQueries => "Generating search queries".into(),
            ProgressEvent::SearchForListings { search_query, .. } => {
                format!("Searching for {search_query}")
            }
            ProgressEvent::FilterListings { listings_count } => {
                format!("Filtering {listings_count} listings")
            }
            ProgressEvent::ScoreListings { listings_count } => {
                format!("Scoring {listings_count} listings")
            }
            ProgressEvent::ScoreListingsProgress {
                scored_listings_count,
                total_listings_count,
            } => format!("Scoring {scored_listings_count} of {total_listings_count} listings"),
            ProgressEvent::GenerateResponse => "Generating response".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Progress {
        progress: ProgressEvent,
        description: String,
    },
    Update {
        stage: Stage,
        patch: PipelinePatch,
    },
    Snapshot {
        stage: Stage,
        terminal: bool,
        state: Box<PipelineState>,
    },
    Failed {
        stage: String,
        kind: PipelineErrorKind,
        message: String,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::Failed { .. } | RunEvent::Snapshot { terminal: true, .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EventEnvelope {
    pub seq: u64,
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

/// Which event kinds a stream consumer wants. Terminal events are always delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamModes {
    pub progress: bool,
    pub updates: bool,
    pub values: bool,
}

impl StreamModes {
    pub fn all() -> Self {
        Self {
            progress: true,
            updates: true,
            values: true,
        }
    }

    pub fn values() -> Self {
        Self {
            progress: false,
            updates: false,
            values: true,
        }
    }

    pub fn progress_and_updates() -> Self {
        Self {
            progress: true,
            updates: true,
            values: false,
        }
    }
}

pub struct EventMultiplexer {
    run_id: Uuid,
    tx: Option<mpsc::Sender<EventEnvelope>>,
    modes: StreamModes,
    seq: AtomicU64,
    cancel: CancellationToken,
}

impl EventMultiplexer {
    pub fn new(
        run_id: Uuid,
        tx: mpsc::Sender<EventEnvelope>,
        modes: StreamModes,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            tx: Some(tx),
            modes,
            seq: AtomicU64::new(0),
            cancel,
        }
    }

    /// Sink for invoke mode: events are traced, never delivered.
    pub fn detached(run_id: Uuid, cancel: CancellationToken) -> Self {
        Self {
            run_id,
            tx: None,
            modes: StreamModes::all(),
            seq: AtomicU64::new(0),
            cancel,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn progress(&self, progress: ProgressEvent) {
        debug!(
            target = "deal_finder.pipeline",
            run_id = %self.run_id,
            description = %progress.description(),
            "progress"
        );
        if self.modes.progress {
            let description = progress.description();
            self.deliver(RunEvent::Progress {
                progress,
                description,
            })
            .await;
        }
    }

    pub async fn update(&self, stage: Stage, patch: &PipelinePatch) {
        if self.modes.updates && self.tx.is_some() {
            self.deliver(RunEvent::Update {
                stage,
                patch: patch.clone(),
            })
            .await;
        }
    }

    pub async fn snapshot(&self, stage: Stage, terminal: bool, state: &PipelineState) {
        if self.tx.is_none() {
            return;
        }
        let event = RunEvent::Snapshot {
            stage,
            terminal,
            state: Box::new(state.clone()),
        };
        if terminal {
            self.deliver_terminal(event).await;
        } else if self.modes.values {
            self.deliver(event).await;
        }
    }

    pub async fn failed(&self, err: &PipelineError) {
        self.deliver_terminal(RunEvent::Failed {
            stage: err.stage().to_string(),
            kind: err.kind(),
            message: err.detail().to_string(),
        })
        .await;
    }

    async fn deliver_terminal(&self, event: RunEvent) {
        let Some(tx) = &self.tx else { return };
        let envelope = self.envelope(event);
        match tokio::time::timeout(TERMINAL_SEND_GRACE, tx.send(envelope)).await {
            Ok(Ok(())) => {}
            // Consumer gone.
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    target = "deal_finder.pipeline",
                    run_id = %self.run_id,
                    "terminal_event_dropped"
                );
            }
        }
    }

    async fn deliver(&self, event: RunEvent) {
        let Some(tx) = &self.tx else { return };
        if self.cancel.is_cancelled() {
            return;
        }
        let envelope = self.envelope(event);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            sent = tx.send(envelope) => {
                if sent.is_err() {
                    debug!(target = "deal_finder.pipeline", run_id = %self.run_id, "consumer_dropped");
                    self.cancel.cancel();
                }
            }
        }
    }

    fn envelope(&self, event: RunEvent) -> EventEnvelope {
        EventEnvelope {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            run_id: self.run_id,
            at: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_carry_counters() {
        let ev = ProgressEvent::ScoreListingsProgress {
            scored_listings_count: 3,
            total_listings_count: 10,
        };
        assert_eq!(ev.description(), "Scoring 3 of 10 listings");
        let search = ProgressEvent::SearchForListings {
            search_query: "iphone 14 128gb".into(),
            remaining_queries: 2,
        };
        assert_eq!(search.description(), "Searching for iphone 14 128gb");
    }

    #[test]
    fn progress_serializes_with_stage_tag() {
        let envelope = EventEnvelope {
            seq: 4,
            run_id: Uuid::nil(),
            at: Utc::now(),
            event: RunEvent::Progress {
                progress: ProgressEvent::FilterListings { listings_count: 80 },
                description: "Filtering 80 listings".into(),
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "progress");
        assert_eq!(value["seq"], 4);
        assert_eq!(value["progress"]["stage"], "filter_listings");
        assert_eq!(value["progress"]["listings_count"], 80);
    }

    #[tokio::test]
    async fn modes_filter_but_terminal_snapshot_always_arrives() {
        let (tx, mut rx) = mpsc::channel(8);
        let mux = EventMultiplexer::new(
            Uuid::new_v4(),
            tx,
            StreamModes::progress_and_updates(),
            CancellationToken::new(),
        );
        let state = PipelineState::default();
        mux.snapshot(Stage::ParseUserRequest, false, &state).await;
        mux.progress(ProgressEvent::GenerateResponse).await;
        mux.snapshot(Stage::GenerateResponse, true, &state).await;
        drop(mux);

        let mut seen = Vec::new();
        while let Some(env) = rx.recv().await {
            seen.push(env);
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].seq, 0);
        assert!(matches!(seen[0].event, RunEvent::Progress { .. }));
        assert!(seen[1].event.is_terminal());
        assert_eq!(seen[1].seq, 1);
    }

    #[tokio::test]
    async fn dropped_consumer_cancels_the_run() {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mux = EventMultiplexer::new(Uuid::new_v4(), tx, StreamModes::all(), cancel.clone());
        drop(rx);
        mux.progress(ProgressEvent::ParseUserRequest).await;
        assert!(cancel.is_cancelled());
        assert!(mux.is_cancelled());
    }

    #[tokio::test]
    async fn terminal_events_survive_cancellation() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let mux = EventMultiplexer::new(Uuid::new_v4(), tx, StreamModes::all(), cancel.clone());
        cancel.cancel();
        mux.progress(ProgressEvent::GenerateResponse).await;
        mux.snapshot(Stage::GenerateResponse, true, &PipelineState::default())
            .await;
        drop(mux);

        let only = rx.recv().await.expect("terminal snapshot");
        assert!(only.event.is_terminal());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_send_gives_up_on_a_stalled_consumer() {
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mux = EventMultiplexer::new(Uuid::new_v4(), tx, StreamModes::all(), cancel.clone());
        mux.progress(ProgressEvent::ParseUserRequest).await;
        cancel.cancel();

        let started = tokio::time::Instant::now();
        mux.failed(&PipelineError::aborted("parse_user_request")).await;
        assert!(started.elapsed() >= TERMINAL_SEND_GRACE);

        // The buffered progress notice is still there; the failure was dropped.
        let first = rx.recv().await.expect("buffered event");
        assert!(matches!(first.event, RunEvent::Progress { .. }));
        drop(mux);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_buffer_unblocks_on_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mux = EventMultiplexer::new(Uuid::new_v4(), tx, StreamModes::all(), cancel.clone());
        mux.progress(ProgressEvent::ParseUserRequest).await;

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        // Buffer is full and nobody reads; this returns only because of the cancel.
        mux.progress(ProgressEvent::GenerateSearchQueries).await;
        assert!(cancel.is_cancelled());
    }
}
