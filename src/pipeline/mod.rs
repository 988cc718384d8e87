//! Deal-finder pipeline engine.
//!
//! A run threads one [`PipelineState`] through a fixed stage graph:
//!
//! ```text
//! parse_user_request -> generate_search_queries -> search_for_listings -+-> filter_listings
//!                                                     ^                 |
//!                                                     +-- pending ------+
//! filter_listings -> score_listings -> generate_response -> END
//! ```
//!
//! Each stage returns a [`PipelinePatch`]; the engine merges it, picks the next
//! stage and reports the commit on the run's [`EventMultiplexer`].

pub mod events;
pub mod prompts;
pub mod scoring;
pub mod stages;
pub mod state;

use crate::config::PipelineConfig;
use crate::llm::LanguageModel;
use crate::models::Message;
use crate::source::ListingSource;
use events::{EventEnvelope, EventMultiplexer, StreamModes};
use serde::Serialize;
use stages::StageContext;
use state::{PipelinePatch, PipelineState, has_pending_queries};
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ParseUserRequest,
    GenerateSearchQueries,
    SearchForListings,
    FilterListings,
    ScoreListings,
    GenerateResponse,
}

impl Stage {
    pub const START: Stage = Stage::ParseUserRequest;

    pub fn name(self) -> &'static str {
        match self {
            Stage::ParseUserRequest => "parse_user_request",
            Stage::GenerateSearchQueries => "generate_search_queries",
            Stage::SearchForListings => "search_for_listings",
            Stage::FilterListings => "filter_listings",
            Stage::ScoreListings => "score_listings",
            Stage::GenerateResponse => "generate_response",
        }
    }
}

/// Transition table. `None` ends the run.
pub fn next_stage(stage: Stage, state: &PipelineState) -> Option<Stage> {
    match stage {
        Stage::ParseUserRequest => Some(Stage::GenerateSearchQueries),
        Stage::GenerateSearchQueries | Stage::SearchForListings => {
            if has_pending_queries(state) {
                Some(Stage::SearchForListings)
            } else {
                Some(Stage::FilterListings)
            }
        }
        Stage::FilterListings => Some(Stage::ScoreListings),
        Stage::ScoreListings => Some(Stage::GenerateResponse),
        Stage::GenerateResponse => None,
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineErrorKind {
    /// A model or listing source call failed.
    Adapter,
    /// A stage was entered without the input it needs.
    Validation,
    /// The run was cancelled.
    Aborted,
}

impl PipelineError {
    pub fn adapter(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Adapter,
        }
    }

    pub fn validation(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Validation,
        }
    }

    pub fn aborted(stage: &'static str) -> Self {
        Self {
            stage,
            message: "run cancelled".into(),
            kind: PipelineErrorKind::Aborted,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    llm: Arc<dyn LanguageModel>,
    source: Arc<dyn ListingSource>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        llm: Arc<dyn LanguageModel>,
        source: Arc<dyn ListingSource>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            llm,
            source,
        }
    }

    /// Runs to completion and returns the final state.
    pub async fn invoke(&self, conversation: Vec<Message>) -> Result<PipelineState, PipelineError> {
        self.invoke_with_cancel(conversation, CancellationToken::new())
            .await
    }

    /// Like [`Pipeline::invoke`], checking `cancel` at every stage boundary.
    pub async fn invoke_with_cancel(
        &self,
        conversation: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<PipelineState, PipelineError> {
        let events = EventMultiplexer::detached(Uuid::new_v4(), cancel);
        self.run(conversation, &events).await
    }

    /// Spawns the run and returns its event stream. The stream ends after a
    /// terminal snapshot or a `failed` event. Dropping it cancels the run.
    pub fn stream(&self, conversation: Vec<Message>, modes: StreamModes) -> RunStream {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let cancel = CancellationToken::new();
        let run_id = Uuid::new_v4();
        let events = EventMultiplexer::new(run_id, tx, modes, cancel.clone());
        let pipeline = self.clone();
        tokio::spawn(async move {
            let _ = pipeline.run(conversation, &events).await;
        });
        RunStream {
            run_id,
            inner: ReceiverStream::new(rx),
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
        }
    }

    async fn run(
        &self,
        conversation: Vec<Message>,
        events: &EventMultiplexer,
    ) -> Result<PipelineState, PipelineError> {
        let span = info_span!("pipeline_run", run_id = %events.run_id());
        async {
            info!(target = "deal_finder.pipeline", turns = conversation.len(), "run_started");
            let started = Instant::now();
            match self.execute(PipelineState::seeded(conversation), events).await {
                Ok(state) => {
                    info!(
                        target = "deal_finder.pipeline",
                        scored = state.scored_listings.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "run_completed"
                    );
                    Ok(state)
                }
                Err(err) => {
                    warn!(
                        target = "deal_finder.pipeline",
                        stage = err.stage(),
                        kind = ?err.kind(),
                        error = %err,
                        "run_failed"
                    );
                    events.failed(&err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        mut state: PipelineState,
        events: &EventMultiplexer,
    ) -> Result<PipelineState, PipelineError> {
        let ctx = StageContext {
            config: &self.config,
            llm: self.llm.as_ref(),
            source: self.source.as_ref(),
            events,
        };

        let mut current = Some(Stage::START);
        while let Some(stage) = current {
            if events.is_cancelled() {
                return Err(PipelineError::aborted(stage.name()));
            }
            let started = Instant::now();
            let patch = run_stage(stage, &ctx, &state).await?;
            crate::metrics::stage_elapsed(stage.name(), started.elapsed().as_millis());

            events.update(stage, &patch).await;
            state = state.merge(patch);
            current = next_stage(stage, &state);
            // The end of the last stage is a boundary too.
            if current.is_none() && events.is_cancelled() {
                return Err(PipelineError::aborted(stage.name()));
            }
            events.snapshot(stage, current.is_none(), &state).await;
        }
        Ok(state)
    }
}

async fn run_stage(
    stage: Stage,
    ctx: &StageContext<'_>,
    state: &PipelineState,
) -> Result<PipelinePatch, PipelineError> {
    match stage {
        Stage::ParseUserRequest => stages::parse_user_request(ctx, state).await,
        Stage::GenerateSearchQueries => stages::generate_search_queries(ctx, state).await,
        Stage::SearchForListings => stages::search_for_listings(ctx, state).await,
        Stage::FilterListings => stages::filter_listings(ctx, state).await,
        Stage::ScoreListings => stages::score_listings(ctx, state).await,
        Stage::GenerateResponse => stages::generate_response(ctx, state).await,
    }
}

/// Event stream of one spawned run.
pub struct RunStream {
    run_id: Uuid,
    inner: ReceiverStream<EventEnvelope>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl RunStream {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Requests cancellation; the run stops at the next stage boundary and
    /// reports an `aborted` failure.
    #[allow(dead_code)]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for RunStream {
    type Item = EventEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::source::SearchPage;
    use crate::testing::{ScriptedModel, StaticSource, listing, listings};
    use events::RunEvent;
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn pipeline(llm: ScriptedModel, source: StaticSource) -> Pipeline {
        Pipeline::new(PipelineConfig::default(), Arc::new(llm), Arc::new(source))
    }

    fn seed() -> Vec<Message> {
        vec![Message::user("cheap pixel 9, show me 5")]
    }

    fn happy_source() -> StaticSource {
        StaticSource::serving(
            listings(0..6, |n| Some(100.0 + n as f64 * 10.0)),
            &["pixel 9", "pixel 9 used"],
        )
    }

    async fn collect(stream: RunStream) -> Vec<EventEnvelope> {
        stream.collect().await
    }

    #[test]
    fn search_loops_until_queue_is_empty() {
        let mut state = PipelineState {
            pending_queries: vec!["a".into()],
            ..Default::default()
        };
        assert_eq!(
            next_stage(Stage::GenerateSearchQueries, &state),
            Some(Stage::SearchForListings)
        );
        assert_eq!(
            next_stage(Stage::SearchForListings, &state),
            Some(Stage::SearchForListings)
        );
        state.pending_queries.clear();
        assert_eq!(
            next_stage(Stage::SearchForListings, &state),
            Some(Stage::FilterListings)
        );
        assert_eq!(
            next_stage(Stage::GenerateSearchQueries, &state),
            Some(Stage::FilterListings)
        );
        assert_eq!(next_stage(Stage::GenerateResponse, &state), None);
    }

    #[tokio::test]
    async fn full_run_ranks_and_replies() {
        let pipeline = pipeline(ScriptedModel::happy(&["pixel 9"]), happy_source());
        let state = pipeline.invoke(seed()).await.expect("run");

        assert_eq!(state.desired_products, vec!["pixel 9"]);
        assert_eq!(state.max_results_count, 5);
        assert!(state.pending_queries.is_empty());
        assert_eq!(state.candidate_listings.len(), 6);
        assert_eq!(state.filtered_listings.len(), 6);
        assert_eq!(state.scored_listings.len(), 6);
        assert_eq!(state.median_price, Some(130.0));

        let reply = state.last_assistant_message().expect("reply");
        assert_eq!(reply.role, Role::Assistant);
        assert!(reply.content.starts_with("Here is what I found.\n\n"));
        assert_eq!(reply.content.lines().filter(|l| l.starts_with("- [")).count(), 5);
        // Cheapest listing has the best price score at equal relevancy.
        assert!(reply.content.contains("- [Listing 0 (100 BGN)]"));
        assert!(!reply.content.contains("Listing 5 "));
    }

    #[tokio::test]
    async fn two_pages_accumulate_eighty_candidates() {
        let source = StaticSource::default().with_pages(
            "phone",
            vec![
                SearchPage {
                    listings: listings(0..40, |_| Some(200.0)),
                    has_more_pages: true,
                },
                SearchPage {
                    listings: listings(40..80, |_| Some(250.0)),
                    has_more_pages: false,
                },
            ],
        );
        let llm = ScriptedModel::default()
            .answer("UserRequest", json!({"products": ["phone"]}))
            .answer("SearchQueries", json!({"search_queries": ["phone"]}))
            .keep_all()
            .answer("ListingScore", json!({"score": 5}));
        let llm = Arc::new(llm);
        let source = Arc::new(source);
        let pipeline = Pipeline::new(PipelineConfig::default(), llm.clone(), source.clone());

        let state = pipeline.invoke(seed()).await.expect("run");
        assert_eq!(state.candidate_listings.len(), 80);
        assert!(state.pending_queries.is_empty());
        assert_eq!(source.calls().len(), 2);
        assert_eq!(llm.calls_for("FilterListings").len(), 4);
        assert_eq!(state.max_results_count, stages::DEFAULT_MAX_RESULTS);
    }

    #[tokio::test]
    async fn score_failure_aborts_without_committing_scores() {
        let failing = || {
            let source = StaticSource::serving(listings(0..10, |_| Some(10.0)), &["pixel 9"]);
            let llm = ScriptedModel::default()
                .answer("UserRequest", json!({"products": ["pixel 9"]}))
                .answer("SearchQueries", json!({"search_queries": ["pixel 9"]}))
                .keep_all()
                .answer("ListingScore", json!({"score": 6}))
                .failing_on("ListingScore", 3);
            pipeline(llm, source)
        };

        let err = failing().invoke(seed()).await.unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Adapter);
        assert_eq!(err.stage(), "score_listings");

        let events = collect(failing().stream(seed(), StreamModes::all())).await;
        let last = events.last().expect("events");
        match &last.event {
            RunEvent::Failed { stage, kind, .. } => {
                assert_eq!(stage, "score_listings");
                assert_eq!(*kind, PipelineErrorKind::Adapter);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(events.iter().all(|e| match &e.event {
            RunEvent::Update { stage, .. } => *stage != Stage::ScoreListings,
            RunEvent::Snapshot { state, terminal, .. } =>
                state.scored_listings.is_empty() && !terminal,
            _ => true,
        }));
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.event {
                RunEvent::Progress {
                    progress: events::ProgressEvent::ScoreListingsProgress { .. },
                    ..
                } => Some(e.seq),
                _ => None,
            })
            .collect();
        assert_eq!(progress.len(), 2);
    }

    #[tokio::test]
    async fn identical_inputs_give_identical_state_in_both_modes() {
        let pipeline = pipeline(ScriptedModel::happy(&["pixel 9"]), happy_source());
        let first = pipeline.invoke(seed()).await.expect("first");
        let second = pipeline.invoke(seed()).await.expect("second");
        assert_eq!(first, second);

        let events = collect(pipeline.stream(seed(), StreamModes::values())).await;
        let snapshots: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.event {
                RunEvent::Snapshot {
                    stage,
                    terminal,
                    state,
                } => Some((*stage, *terminal, state.as_ref().clone())),
                _ => None,
            })
            .collect();
        assert_eq!(snapshots.len(), events.len());
        // parse, queries, two searches, filter, score, respond
        assert_eq!(snapshots.len(), 7);
        let (stage, terminal, state) = snapshots.last().expect("terminal").clone();
        assert_eq!(stage, Stage::GenerateResponse);
        assert!(terminal);
        assert_eq!(state, first);
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn progress_mode_reports_stage_counters() {
        let pipeline = pipeline(ScriptedModel::happy(&["pixel 9"]), happy_source());
        let events = collect(pipeline.stream(seed(), StreamModes::progress_and_updates())).await;

        let descriptions: Vec<String> = events
            .iter()
            .filter_map(|e| match &e.event {
                RunEvent::Progress { description, .. } => Some(description.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(descriptions[0], "Planning search parameters");
        assert!(descriptions.contains(&"Searching for pixel 9 used".to_string()));
        assert!(descriptions.contains(&"Filtering 6 listings".to_string()));
        assert!(descriptions.contains(&"Scoring 6 of 6 listings".to_string()));

        let updates = events
            .iter()
            .filter(|e| matches!(e.event, RunEvent::Update { .. }))
            .count();
        assert_eq!(updates, 7);
        assert!(events.last().expect("terminal").event.is_terminal());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_at_first_boundary() {
        let llm = Arc::new(ScriptedModel::happy(&["pixel 9"]));
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            llm.clone(),
            Arc::new(happy_source()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline
            .invoke_with_cancel(seed(), cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Aborted);
        assert_eq!(err.stage(), "parse_user_request");
        assert!(llm.calls_for("UserRequest").is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_stream_ends_with_an_aborted_event() {
        let config = PipelineConfig {
            stream_buffer: 1,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(
            config,
            Arc::new(ScriptedModel::happy(&["pixel 9"])),
            Arc::new(happy_source()),
        );
        let mut stream = pipeline.stream(seed(), StreamModes::all());
        let first = stream.next().await.expect("first event");
        assert_eq!(first.seq, 0);
        stream.cancel();

        let rest: Vec<EventEnvelope> = stream.collect().await;
        let last = rest.last().expect("terminal event");
        match &last.event {
            RunEvent::Failed { kind, .. } => assert_eq!(*kind, PipelineErrorKind::Aborted),
            other => panic!("expected abort, got {other:?}"),
        }
        assert!(
            !rest
                .iter()
                .any(|e| matches!(e.event, RunEvent::Snapshot { terminal: true, .. }))
        );
    }

    #[tokio::test]
    async fn cancelling_during_the_last_stage_still_ends_with_a_terminal_event() {
        let config = PipelineConfig {
            stream_buffer: 1,
            ..PipelineConfig::default()
        };
        let pipeline = Pipeline::new(
            config,
            Arc::new(ScriptedModel::happy(&["pixel 9"])),
            Arc::new(happy_source()),
        );
        let mut stream = pipeline.stream(seed(), StreamModes::all());
        loop {
            let envelope = stream.next().await.expect("run ended before responding");
            if matches!(
                envelope.event,
                RunEvent::Progress {
                    progress: events::ProgressEvent::GenerateResponse,
                    ..
                }
            ) {
                break;
            }
        }
        stream.cancel();

        let rest: Vec<EventEnvelope> = stream.collect().await;
        let last = rest.last().expect("terminal event after cancel");
        assert!(last.event.is_terminal());
        match &last.event {
            RunEvent::Failed { stage, kind, .. } => {
                assert_eq!(*kind, PipelineErrorKind::Aborted);
                assert_eq!(stage, "generate_response");
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_invoke_after_last_stage_is_aborted() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let llm = ScriptedModel::happy(&["pixel 9"]);
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            Arc::new(CancelOnComplete { inner: llm, trigger }),
            Arc::new(happy_source()),
        );
        let err = pipeline
            .invoke_with_cancel(seed(), cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PipelineErrorKind::Aborted);
        assert_eq!(err.stage(), "generate_response");
    }

    /// Cancels the run while the response stage is talking to the model.
    struct CancelOnComplete {
        inner: ScriptedModel,
        trigger: CancellationToken,
    }

    #[async_trait::async_trait]
    impl LanguageModel for CancelOnComplete {
        async fn extract(
            &self,
            request: &crate::llm::ExtractionRequest,
        ) -> Result<serde_json::Value, crate::llm::LlmError> {
            self.inner.extract(request).await
        }

        async fn complete(&self, prompt: &str) -> Result<String, crate::llm::LlmError> {
            self.trigger.cancel();
            self.inner.complete(prompt).await
        }
    }

    #[tokio::test]
    async fn no_products_yields_empty_results() {
        let llm = Arc::new(
            ScriptedModel::default()
                .answer("UserRequest", json!({"products": []}))
                .completion("I could not tell what you are looking for."),
        );
        let source = Arc::new(StaticSource::default());
        let pipeline = Pipeline::new(PipelineConfig::default(), llm.clone(), source.clone());

        let state = pipeline.invoke(seed()).await.expect("run");
        assert!(state.candidate_listings.is_empty());
        assert!(state.scored_listings.is_empty());
        assert_eq!(state.median_price, None);
        assert!(source.calls().is_empty());
        assert!(llm.calls_for("SearchQueries").is_empty());
        assert!(llm.calls_for("FilterListings").is_empty());
        assert_eq!(
            state.last_assistant_message().expect("reply").content,
            "I could not tell what you are looking for."
        );
    }

    #[tokio::test]
    async fn listing_source_failure_degrades_to_fewer_results() {
        let source = StaticSource::serving(listings(0..3, |_| Some(50.0)), &["pixel 9"])
            .failing_page("pixel 9 used", 1);
        let pipeline = pipeline(ScriptedModel::happy(&["pixel 9"]), source);
        let state = pipeline.invoke(seed()).await.expect("run");
        assert_eq!(state.candidate_listings.len(), 3);
        assert_eq!(state.scored_listings.len(), 3);
    }

    #[tokio::test]
    async fn priceless_listing_is_kept_but_not_averaged() {
        let source = StaticSource::serving(
            vec![listing(1, Some(100.0)), listing(2, None), listing(3, Some(300.0))],
            &["pixel 9"],
        );
        let llm = ScriptedModel::happy(&["pixel 9"])
            .answer("SearchQueries", json!({"search_queries": ["pixel 9"]}));
        let state = pipeline(llm, source).invoke(seed()).await.expect("run");
        assert_eq!(state.filtered_listings.len(), 3);
        assert_eq!(state.average_price, 200.0);
        // [100, 300, null] -> index 1
        assert_eq!(state.median_price, Some(300.0));
        let unpriced = state
            .scored_listings
            .iter()
            .find(|s| s.listing.price.is_none())
            .expect("unpriced listing scored");
        assert_eq!(unpriced.price_score, 10.0);
    }
}
