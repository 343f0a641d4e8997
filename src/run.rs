//! The run loop: snapshot, classify, plan, execute, detect, repeat until a
//! terminal state, the iteration cap, a CAPTCHA timeout or cancellation.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::{ActionRecord, ArtifactSink, IterationRecord, RunStart};
use crate::brain::{DecisionService, SnapshotSummary};
use crate::classify::{classify, Classification};
use crate::config::AutomationConfig;
use crate::detect;
use crate::dom::SnapshotBuilder;
use crate::error::AgentError;
use crate::executor::Executor;
use crate::page::{NetworkBuffer, PageHandle};
use crate::planner::Planner;
use crate::profile::{Masker, ProfileProvider};
use crate::types::{
    Candidate, CandidateOutcome, ExecutionResult, FlaggedField, FlowState, ProgressEvent, RunResult, RunStatus,
    Snapshot,
};

/// What a caller asks for. `None` fields fall back to configuration.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub url: String,
    pub profile_ref: Option<PathBuf>,
    pub max_iterations: Option<usize>,
    /// Per-action timeout.
    pub timeout_ms: Option<u64>,
}

impl RunRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            url: url.into(),
            profile_ref: None,
            max_iterations: None,
            timeout_ms: None,
        }
    }
}

/// External handles on a running loop: cancellation and the CAPTCHA resume signal.
#[derive(Clone, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    resume: Arc<Notify>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tells a loop waiting on a CAPTCHA that a human finished it.
    pub fn resume(&self) {
        self.resume.notify_one();
    }
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub iteration: usize,
    pub state: FlowState,
    pub action: Option<String>,
    pub success: bool,
}

/// Candidates already tried on the current, unchanged page.
#[derive(Debug, Default)]
struct NoProgressMemo {
    fingerprint: Option<u64>,
    tried: HashSet<u64>,
}

impl NoProgressMemo {
    /// Returns true when the page is unchanged since the last observation.
    fn observe(&mut self, fingerprint: u64) -> bool {
        if self.fingerprint == Some(fingerprint) {
            return true;
        }
        self.fingerprint = Some(fingerprint);
        self.tried.clear();
        false
    }

    fn mark(&mut self, candidate: &Candidate) {
        self.tried.insert(candidate.key());
    }

    /// Drops candidates already tried here. When nothing new is left the
    /// memo starts over so the loop keeps making attempts.
    fn filter(&mut self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let fresh: Vec<Candidate> = candidates
            .iter()
            .filter(|c| !self.tried.contains(&c.key()))
            .cloned()
            .collect();
        if fresh.is_empty() && !candidates.is_empty() {
            debug!("every candidate was already tried on this page, starting over");
            self.tried.clear();
            return candidates;
        }
        fresh
    }
}

/// Per-run state. Owned by a single [`RunLoop::run`] call.
pub struct RunContext {
    pub run_id: String,
    pub iteration: usize,
    pub state: FlowState,
    pub history: Vec<HistoryEntry>,
    pub started_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    flagged: Vec<FlaggedField>,
    last_error: Option<String>,
    memo: NoProgressMemo,
    /// Set when a CAPTCHA first shows up; cleared once the page moves past it.
    captcha_deadline: Option<Instant>,
}

impl RunContext {
    fn new(run_id: &str) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.to_string(),
            iteration: 0,
            state: FlowState::Initial,
            history: Vec::new(),
            started_at: now,
            last_progress_at: now,
            flagged: Vec::new(),
            last_error: None,
            memo: NoProgressMemo::default(),
            captcha_deadline: None,
        }
    }

    fn flag(&mut self, fields: Vec<FlaggedField>) {
        for field in fields {
            if !self.flagged.iter().any(|f| f.field == field.field) {
                self.flagged.push(field);
            }
        }
    }
}

enum CaptchaOutcome {
    Cleared,
    TimedOut,
    Cancelled,
    Fatal(String),
}

enum Step {
    Continue,
    Finish(RunStatus, String),
}

pub struct RunLoop {
    settings: AutomationConfig,
    planner: Planner,
    masker: Masker,
    decider: Option<Arc<dyn DecisionService>>,
    sink: Option<Arc<dyn ArtifactSink>>,
    events: Option<broadcast::Sender<ProgressEvent>>,
}

impl RunLoop {
    pub fn new(settings: AutomationConfig, profile: Arc<dyn ProfileProvider>, masker: Masker) -> Self {
        let planner = Planner::new(profile, settings.fallback_text.clone());
        Self {
            settings,
            planner,
            masker,
            decider: None,
            sink: None,
            events: None,
        }
    }

    pub fn with_decider(mut self, decider: Arc<dyn DecisionService>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<ProgressEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub async fn run<P>(&self, page: &P, network: &NetworkBuffer, request: &RunRequest, control: &RunControl) -> RunResult
    where
        P: PageHandle + ?Sized,
    {
        let max_iterations = request.max_iterations.unwrap_or(self.settings.max_iterations);
        let timeout = Duration::from_millis(request.timeout_ms.unwrap_or(self.settings.action_timeout_ms));
        let executor = Executor::new(timeout);
        let snapshots = SnapshotBuilder::new(self.settings.max_scroll_steps);
        let mut ctx = RunContext::new(&request.run_id);

        if let Some(sink) = &self.sink {
            let start = RunStart {
                run_id: request.run_id.clone(),
                url: request.url.clone(),
                started_at: ctx.started_at,
            };
            if let Err(err) = sink.start_run(&start, &self.masker) {
                warn!(run_id = %ctx.run_id, error = %err, "could not create run artifacts");
            }
        }
        info!(run_id = %ctx.run_id, url = %request.url, max_iterations, "run started");

        if control.is_cancelled() {
            return self.finish(&ctx, RunStatus::Cancelled, "cancelled before start".into());
        }
        if let Err(err) = page.goto(&request.url).await {
            if err.is_fatal() {
                return self.finish(&ctx, RunStatus::Blocked, format!("fatal: {err}"));
            }
            warn!(url = %request.url, error = %err, "initial navigation reported an error, continuing");
        }

        loop {
            if control.is_cancelled() {
                return self.finish(&ctx, RunStatus::Cancelled, "cancelled".into());
            }
            if ctx.iteration >= max_iterations {
                let reason = format!("no terminal state after {max_iterations} iterations");
                return self.finish(&ctx, RunStatus::MaxIterations, reason);
            }
            match self.iterate(page, network, &snapshots, &executor, &mut ctx, control).await {
                Ok(Step::Continue) => ctx.iteration += 1,
                Ok(Step::Finish(status, reason)) => {
                    ctx.iteration += 1;
                    return self.finish(&ctx, status, reason);
                }
                Err(err) => {
                    ctx.iteration += 1;
                    return self.finish(&ctx, RunStatus::Blocked, format!("fatal: {err}"));
                }
            }
        }
    }

    async fn iterate<P>(
        &self,
        page: &P,
        network: &NetworkBuffer,
        snapshots: &SnapshotBuilder,
        executor: &Executor,
        ctx: &mut RunContext,
        control: &RunControl,
    ) -> Result<Step, AgentError>
    where
        P: PageHandle + ?Sized,
    {
        let snapshot = snapshots.build(page, network).await?;
        let unchanged = ctx.memo.observe(snapshot.fingerprint());
        let previous = ctx.state;
        let classification = classify(&snapshot, previous);
        if classification.state != previous {
            info!(
                run_id = %ctx.run_id,
                iteration = ctx.iteration,
                from = %previous,
                to = %classification.state,
                evidence = %self.masker.mask(&classification.evidence),
                "state changed"
            );
        } else if unchanged {
            debug!(iteration = ctx.iteration, state = %previous, "page unchanged since last iteration");
        }
        ctx.state = classification.state;
        if classification.state != FlowState::Captcha {
            ctx.captcha_deadline = None;
        }

        match classification.state {
            FlowState::Confirmation => {
                self.record(ctx, &snapshot, &classification, &[]);
                return Ok(Step::Finish(RunStatus::Success, classification.evidence));
            }
            FlowState::Blocked => {
                self.record(ctx, &snapshot, &classification, &[]);
                return Ok(Step::Finish(RunStatus::Blocked, classification.evidence));
            }
            FlowState::Captcha => {
                self.record(ctx, &snapshot, &classification, &[]);
                warn!(run_id = %ctx.run_id, evidence = %classification.evidence, "CAPTCHA detected, waiting for a human");
                return match self.wait_for_captcha(page, ctx, control, &classification.evidence).await {
                    CaptchaOutcome::Cleared => {
                        info!(run_id = %ctx.run_id, "CAPTCHA cleared, resuming");
                        ctx.state = previous;
                        ctx.last_progress_at = Utc::now();
                        Ok(Step::Continue)
                    }
                    CaptchaOutcome::TimedOut => Ok(Step::Finish(
                        RunStatus::CaptchaTimeout,
                        format!("CAPTCHA not solved within {} s", self.settings.captcha_wait_secs),
                    )),
                    CaptchaOutcome::Cancelled => Ok(Step::Finish(RunStatus::Cancelled, "cancelled".into())),
                    CaptchaOutcome::Fatal(message) => Err(AgentError::FatalIo(message)),
                };
            }
            _ => {}
        }

        let plan = self.planner.plan(classification.state, &snapshot);
        ctx.flag(plan.flagged.clone());
        let mut candidates = plan.candidates;
        if plan.needs_escalation || classification.retained {
            if let Some(candidate) = self.escalate(&snapshot, classification.state, ctx).await {
                let at = candidates.iter().position(|c| c.fallback).unwrap_or(candidates.len());
                candidates.insert(at, candidate);
            }
        }
        let candidates = ctx.memo.filter(candidates);
        if candidates.is_empty() {
            warn!(run_id = %ctx.run_id, state = %classification.state, "nothing to try on this page");
        }

        let mut executed: Vec<(Candidate, CandidateOutcome)> = Vec::new();
        let mut applied_fields = 0;
        for candidate in candidates {
            if control.is_cancelled() {
                break;
            }
            if applied_fields > 0 && !candidate.is_field_step() {
                break;
            }
            debug!(candidate = %candidate.describe(), reason = %candidate.reason, "trying candidate");
            let outcome = executor.execute_candidate(page, &candidate).await;
            ctx.memo.mark(&candidate);
            if outcome.is_fatal() {
                let message = outcome
                    .last_error()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "page lost".into());
                executed.push((candidate, outcome));
                self.record(ctx, &snapshot, &classification, &executed);
                return Err(AgentError::FatalIo(message));
            }
            let success = outcome.success();
            if let Some(err) = outcome.last_error() {
                ctx.last_error = Some(err.message.clone());
            }
            let field_step = candidate.is_field_step();
            executed.push((candidate, outcome));
            if !success {
                continue;
            }
            ctx.last_progress_at = Utc::now();
            self.pause().await;
            if field_step {
                applied_fields += 1;
                if applied_fields < self.settings.actions_per_iteration {
                    continue;
                }
            }
            break;
        }

        self.record(ctx, &snapshot, &classification, &executed);
        Ok(Step::Continue)
    }

    async fn escalate(&self, snapshot: &Snapshot, state: FlowState, ctx: &RunContext) -> Option<Candidate> {
        let decider = self.decider.as_ref()?;
        let summary = SnapshotSummary::new(snapshot, state, ctx.last_error.as_deref(), &self.masker);
        match decider.decide(&summary).await {
            Ok(Some(action)) => {
                info!(run_id = %ctx.run_id, action = %self.masker.mask(&action.to_string()), "escalation proposed an action");
                Some(Candidate::single(action, "escalation"))
            }
            Ok(None) => {
                debug!(run_id = %ctx.run_id, "escalation had no suggestion");
                None
            }
            Err(err) => {
                warn!(run_id = %ctx.run_id, error = %err, "escalation failed");
                None
            }
        }
    }

    /// Waits for a human to solve the challenge. The deadline spans every
    /// wait on the same challenge, so a premature resume does not restart it.
    /// Polling captures use a scratch network buffer; the run's records stay
    /// queued for the next iteration's detector.
    async fn wait_for_captcha<P>(
        &self,
        page: &P,
        ctx: &mut RunContext,
        control: &RunControl,
        evidence: &str,
    ) -> CaptchaOutcome
    where
        P: PageHandle + ?Sized,
    {
        let deadline = *ctx
            .captcha_deadline
            .get_or_insert_with(|| Instant::now() + Duration::from_secs(self.settings.captcha_wait_secs));
        let poll = Duration::from_millis(self.settings.captcha_poll_ms.max(1));
        let poller = SnapshotBuilder::default();
        let scratch = NetworkBuffer::default();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return CaptchaOutcome::TimedOut;
            }
            self.emit(ProgressEvent::CaptchaWait {
                run_id: ctx.run_id.clone(),
                iteration: ctx.iteration,
                evidence: evidence.to_string(),
                remaining_secs: remaining.as_secs(),
            });
            tokio::select! {
                _ = control.cancel.cancelled() => return CaptchaOutcome::Cancelled,
                _ = control.resume.notified() => {
                    info!(run_id = %ctx.run_id, "resume signal received");
                    return CaptchaOutcome::Cleared;
                }
                _ = tokio::time::sleep(poll.min(remaining)) => {}
            }
            match poller.build(page, &scratch).await {
                Ok(snapshot) if detect::captcha_evidence(&snapshot).is_none() => {
                    ctx.captcha_deadline = None;
                    return CaptchaOutcome::Cleared;
                }
                Ok(_) => {}
                Err(err) => return CaptchaOutcome::Fatal(err.to_string()),
            }
        }
    }

    /// Delay after a successful candidate, jittered by up to a third.
    async fn pause(&self) {
        if self.settings.action_delay_ms == 0 {
            return;
        }
        let base = self.settings.action_delay_ms as f32;
        let millis = base + rand::random::<f32>() * base / 3.0;
        tokio::time::sleep(Duration::from_millis(millis as u64)).await;
    }

    fn masked_result(&self, result: &ExecutionResult) -> ExecutionResult {
        let mut result = result.clone();
        if let Some(err) = result.error.as_mut() {
            err.message = self.masker.mask(&err.message);
        }
        result
    }

    /// Logs and persists one iteration: a history entry and a progress event
    /// per executed candidate, and a single artifact record listing them all.
    fn record(
        &self,
        ctx: &mut RunContext,
        snapshot: &Snapshot,
        classification: &Classification,
        executed: &[(Candidate, CandidateOutcome)],
    ) {
        let actions: Vec<ActionRecord> = executed
            .iter()
            .map(|(candidate, outcome)| ActionRecord {
                action: self.masker.mask(&candidate.describe()),
                outcome: CandidateOutcome {
                    results: outcome.results.iter().map(|r| self.masked_result(r)).collect(),
                    completed: outcome.completed,
                    total: outcome.total,
                },
            })
            .collect();

        if actions.is_empty() {
            info!(run_id = %ctx.run_id, iteration = ctx.iteration, state = %classification.state, action = "-", "iteration");
            ctx.history.push(HistoryEntry {
                iteration: ctx.iteration,
                state: classification.state,
                action: None,
                success: false,
            });
            self.emit(ProgressEvent::Iteration {
                run_id: ctx.run_id.clone(),
                iteration: ctx.iteration,
                state: classification.state,
                action: None,
                result: None,
                flagged: ctx.flagged.clone(),
            });
        }
        for step in &actions {
            let success = step.outcome.success();
            info!(
                run_id = %ctx.run_id,
                iteration = ctx.iteration,
                state = %classification.state,
                action = %step.action,
                success,
                "iteration"
            );
            ctx.history.push(HistoryEntry {
                iteration: ctx.iteration,
                state: classification.state,
                action: Some(step.action.clone()),
                success,
            });
            self.emit(ProgressEvent::Iteration {
                run_id: ctx.run_id.clone(),
                iteration: ctx.iteration,
                state: classification.state,
                action: Some(step.action.clone()),
                result: step.outcome.results.last().cloned(),
                flagged: ctx.flagged.clone(),
            });
        }

        if let Some(sink) = &self.sink {
            let record = IterationRecord {
                iteration: ctx.iteration,
                at: Utc::now(),
                url: snapshot.url.clone(),
                state: classification.state,
                evidence: self.masker.mask(&classification.evidence),
                actions,
                flagged: ctx.flagged.clone(),
            };
            if let Err(err) = sink.record_iteration(&ctx.run_id, &record, snapshot) {
                warn!(run_id = %ctx.run_id, error = %err, "could not persist iteration");
            }
        }
    }

    fn finish(&self, ctx: &RunContext, status: RunStatus, reason: String) -> RunResult {
        let result = RunResult {
            run_id: ctx.run_id.clone(),
            status,
            iterations_used: ctx.iteration,
            reason: self.masker.mask(&reason),
            flagged: ctx.flagged.clone(),
            finished_at: Utc::now(),
        };
        info!(
            run_id = %result.run_id,
            status = ?result.status,
            iterations = result.iterations_used,
            reason = %result.reason,
            flagged = result.flagged.len(),
            "run finished"
        );
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.finish_run(&result) {
                warn!(run_id = %result.run_id, error = %err, "could not persist run status");
            }
        }
        self.emit(ProgressEvent::Finished(result.clone()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, Target};

    fn click(purpose: &str) -> Candidate {
        Candidate::single(
            Action::ClickButton {
                target: Target::control(purpose, None),
            },
            purpose,
        )
    }

    #[test]
    fn memo_skips_candidates_tried_on_an_unchanged_page() {
        let mut memo = NoProgressMemo::default();
        assert!(!memo.observe(1));
        memo.mark(&click("next"));
        assert!(memo.observe(1));
        let left = memo.filter(vec![click("next"), click("submit")]);
        assert_eq!(left, vec![click("submit")]);
    }

    #[test]
    fn memo_resets_when_the_page_changes() {
        let mut memo = NoProgressMemo::default();
        memo.observe(1);
        memo.mark(&click("next"));
        assert!(!memo.observe(2));
        assert_eq!(memo.filter(vec![click("next")]).len(), 1);
    }

    #[test]
    fn memo_starts_over_when_everything_was_tried() {
        let mut memo = NoProgressMemo::default();
        memo.observe(7);
        memo.mark(&click("next"));
        assert_eq!(memo.filter(vec![click("next")]), vec![click("next")]);
        assert!(memo.tried.is_empty());
    }

    #[test]
    fn control_is_shared_between_clones() {
        let control = RunControl::new();
        let clone = control.clone();
        clone.cancel();
        assert!(control.is_cancelled());
    }

    #[test]
    fn requests_get_unique_ids() {
        assert_ne!(RunRequest::new("https://a").run_id, RunRequest::new("https://a").run_id);
    }
}
