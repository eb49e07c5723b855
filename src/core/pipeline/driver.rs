use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::core::delivery::{self, BuildAnnotator, ChangeRequestApi, Notifier};
use crate::core::diagnose::{self, Diagnosis, ReasoningService};
use crate::core::error::{RetryClass, StageError};
use crate::core::event::CiEvent;
use crate::core::extract::{self, LogSource};
use crate::core::limiter::RateLimiter;
use crate::core::patch::{self, RepoSnapshot};
use crate::core::pipeline::{PipelineRun, RunState, Stage};
use crate::core::store::Store;

/// Everything a run driver needs: the store, the tunables, and the
/// external collaborators behind their trait seams. Shared by all
/// concurrent runs; the rate limiter is the only cross-run mutable state.
pub struct PipelineContext {
    pub store: Store,
    pub config: PipelineConfig,
    pub limiter: RateLimiter,
    pub log_source: Arc<dyn LogSource>,
    pub reasoner: Arc<dyn ReasoningService>,
    pub repo: Arc<dyn RepoSnapshot>,
    pub vcs: Option<Arc<dyn ChangeRequestApi>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub annotator: Option<Arc<dyn BuildAnnotator>>,
}

/// Drive one run from its current persisted state to a terminal state.
/// Spawned per event; safe to re-enter after a crash or duplicate spawn
/// because every transition is a compare-and-swap and every stage starts
/// from persisted inputs.
pub async fn run_pipeline(ctx: Arc<PipelineContext>, event_id: String) {
    if let Err(e) = drive(&ctx, &event_id).await {
        error!(event_id = %event_id, error = %e, "pipeline driver aborted");
    }
}

async fn drive(ctx: &PipelineContext, event_id: &str) -> Result<()> {
    let Some(event) = ctx.store.get_event(event_id).await? else {
        warn!(event_id = %event_id, "no event record, nothing to drive");
        return Ok(());
    };

    loop {
        let Some(run) = ctx.store.get_run(event_id).await? else {
            return Ok(());
        };
        if run.state.is_terminal() {
            info!(event_id = %event_id, state = run.state.as_str(), "run is terminal");
            return Ok(());
        }

        // Write-ahead discipline: the transition into a stage state is
        // committed first, then the stage executes while the run sits in
        // that state.
        match run.state {
            RunState::Received => {
                ctx.store
                    .transition(event_id, RunState::Received, RunState::Extracting)
                    .await?;
            }
            RunState::Extracting => step_extract(ctx, &event, &run).await?,
            RunState::Diagnosing => step_diagnose(ctx, &event, &run).await?,
            RunState::Patching => step_patch(ctx, &event, &run).await?,
            RunState::SkippedLowConfidence => {
                ctx.store
                    .transition(
                        event_id,
                        RunState::SkippedLowConfidence,
                        RunState::Delivering,
                    )
                    .await?;
            }
            RunState::Delivering => step_deliver(ctx, &event, &run).await?,
            _ => return Ok(()),
        }
    }
}

async fn step_extract(ctx: &PipelineContext, event: &CiEvent, run: &PipelineRun) -> Result<()> {
    if run.extracted_summary.is_some() {
        ctx.store
            .transition(&event.event_id, RunState::Extracting, RunState::Diagnosing)
            .await?;
        return Ok(());
    }

    let fetched = tokio::time::timeout(
        ctx.config.extract_timeout,
        ctx.log_source.fetch(&event.raw_log_ref),
    )
    .await
    .map_err(|_| StageError::Timeout(ctx.config.extract_timeout))
    .and_then(|r| r);

    match fetched {
        Ok(raw) => {
            let summary = extract::extract_summary(&raw, event.source, &ctx.config.extract);
            info!(
                event_id = %event.event_id,
                bytes = summary.text.len(),
                low_confidence = summary.low_confidence,
                "log summary extracted"
            );
            ctx.store
                .set_extracted_summary(&event.event_id, &summary)
                .await?;
            ctx.store
                .transition(&event.event_id, RunState::Extracting, RunState::Diagnosing)
                .await?;
            Ok(())
        }
        Err(err) => handle_stage_failure(ctx, &event.event_id, Stage::Extracting, err).await,
    }
}

async fn step_diagnose(ctx: &PipelineContext, event: &CiEvent, run: &PipelineRun) -> Result<()> {
    if let Some(diagnosis) = &run.diagnosis {
        return route_diagnosis(ctx, &event.event_id, diagnosis).await;
    }

    let Some(summary) = &run.extracted_summary else {
        // Should not happen with write-ahead transitions; treat as fatal.
        return handle_stage_failure(
            ctx,
            &event.event_id,
            Stage::Diagnosing,
            StageError::Fatal("diagnosing without an extracted summary".into()),
        )
        .await;
    };

    let cfg = diagnose::DiagnoseConfig {
        call_timeout: ctx.config.diagnosis_timeout,
        rate_limit_max_wait: ctx.config.rate_limit_max_wait,
        max_fixes: ctx.config.max_fixes,
    };
    match diagnose::diagnose_once(ctx.reasoner.as_ref(), &ctx.limiter, event, summary, &cfg).await {
        Ok(diagnosis) => {
            info!(
                event_id = %event.event_id,
                category = diagnosis.root_cause_category.as_str(),
                confidence = diagnosis.confidence,
                fixes = diagnosis.suggested_fixes.len(),
                "diagnosis produced"
            );
            ctx.store.set_diagnosis(&event.event_id, &diagnosis).await?;
            if let Some(annotator) = &ctx.annotator {
                if let Err(e) = annotator.annotate(event, &diagnosis).await {
                    warn!(event_id = %event.event_id, error = %e, "build annotation failed");
                }
            }
            route_diagnosis(ctx, &event.event_id, &diagnosis).await
        }
        Err(err) => handle_stage_failure(ctx, &event.event_id, Stage::Diagnosing, err).await,
    }
}

/// Confidence gate: below the threshold (or with nothing to patch) the run
/// routes straight to a diagnosis-only delivery instead of synthesis.
async fn route_diagnosis(
    ctx: &PipelineContext,
    event_id: &str,
    diagnosis: &Diagnosis,
) -> Result<()> {
    let to = if diagnosis.confidence < ctx.config.confidence_threshold
        || diagnosis.suggested_fixes.is_empty()
    {
        let decision = StageError::PolicyReject(format!(
            "confidence {} below threshold {}",
            diagnosis.confidence, ctx.config.confidence_threshold
        ));
        info!(event_id = %event_id, kind = decision.kind(), reason = %decision, "skipping patch synthesis");
        RunState::SkippedLowConfidence
    } else {
        RunState::Patching
    };
    ctx.store
        .transition(event_id, RunState::Diagnosing, to)
        .await?;
    Ok(())
}

async fn step_patch(ctx: &PipelineContext, event: &CiEvent, run: &PipelineRun) -> Result<()> {
    if run.patch_proposal.is_some() {
        ctx.store
            .transition(&event.event_id, RunState::Patching, RunState::Delivering)
            .await?;
        return Ok(());
    }

    let Some(diagnosis) = &run.diagnosis else {
        return handle_stage_failure(
            ctx,
            &event.event_id,
            Stage::Patching,
            StageError::Fatal("patching without a diagnosis".into()),
        )
        .await;
    };

    match patch::synthesize(ctx.repo.as_ref(), event, diagnosis).await {
        Ok(proposal) => {
            info!(
                event_id = %event.event_id,
                changes = proposal.file_changes.len(),
                dropped = proposal.dropped.len(),
                status = ?proposal.validation_status,
                "patch proposal synthesized"
            );
            ctx.store
                .set_patch_proposal(&event.event_id, &proposal)
                .await?;
            // Rejected proposals still deliver, as diagnosis-only.
            if proposal.validation_status == patch::ValidationStatus::Rejected {
                let decision =
                    StageError::PolicyReject("patch proposal failed structural validation".into());
                warn!(event_id = %event.event_id, kind = decision.kind(), reason = %decision, "delivering without a change request");
            }
            ctx.store
                .transition(&event.event_id, RunState::Patching, RunState::Delivering)
                .await?;
            Ok(())
        }
        Err(err) => handle_stage_failure(ctx, &event.event_id, Stage::Patching, err).await,
    }
}

async fn step_deliver(ctx: &PipelineContext, event: &CiEvent, run: &PipelineRun) -> Result<()> {
    let Some(diagnosis) = &run.diagnosis else {
        return handle_stage_failure(
            ctx,
            &event.event_id,
            Stage::Delivering,
            StageError::Fatal("delivering without a diagnosis".into()),
        )
        .await;
    };

    let receipt = run.delivery_receipt.clone().unwrap_or_default();
    let outcome = delivery::deliver(
        &ctx.store,
        ctx.vcs.as_deref(),
        ctx.notifier.as_deref(),
        event,
        diagnosis,
        run.patch_proposal.as_ref(),
        receipt,
        ctx.config.delivery_call_timeout,
    )
    .await;

    match outcome {
        Ok(_) => {
            ctx.store
                .transition(&event.event_id, RunState::Delivering, RunState::Done)
                .await?;
            Ok(())
        }
        Err(err) => handle_stage_failure(ctx, &event.event_id, Stage::Delivering, err).await,
    }
}

/// Record the failure, then either retry after backoff or commit the
/// stage's failed state once the budget is spent. Delivery is the
/// exception: its external actions are idempotent, so it retries without a
/// budget and only a non-retryable error can fail it.
async fn handle_stage_failure(
    ctx: &PipelineContext,
    event_id: &str,
    stage: Stage,
    error: StageError,
) -> Result<()> {
    warn!(
        event_id = %event_id,
        stage = stage.as_str(),
        kind = error.kind(),
        error = %error,
        "stage failed"
    );
    let attempts = ctx.store.record_stage_failure(event_id, stage, &error).await?;

    let budget = match error.retry_class() {
        RetryClass::None => {
            fail_stage(ctx, event_id, stage).await?;
            return Ok(());
        }
        RetryClass::Schema => Some((attempts.schema, ctx.config.schema_budget)),
        RetryClass::Transient if stage == Stage::Delivering => None,
        RetryClass::Transient => Some((attempts.transient, ctx.config.transient_budget)),
    };

    if let Some((count, budget)) = budget {
        if count >= budget {
            fail_stage(ctx, event_id, stage).await?;
            return Ok(());
        }
    }

    let delay = backoff_delay(
        attempts.total(),
        ctx.config.backoff_base,
        ctx.config.backoff_cap,
    );
    info!(event_id = %event_id, stage = stage.as_str(), delay_ms = delay.as_millis() as u64, "retrying after backoff");
    tokio::time::sleep(delay).await;
    Ok(())
}

async fn fail_stage(ctx: &PipelineContext, event_id: &str, stage: Stage) -> Result<()> {
    let from = match stage {
        Stage::Extracting => RunState::Extracting,
        Stage::Diagnosing => RunState::Diagnosing,
        Stage::Patching => RunState::Patching,
        Stage::Delivering => RunState::Delivering,
    };
    ctx.store
        .transition(event_id, from, stage.failed_state())
        .await?;
    Ok(())
}

/// Exponential backoff with jitter, capped. `attempt` is 1-based.
fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exp).min(cap);
    let jitter_ms = if raw.as_millis() > 1 {
        rand::thread_rng().gen_range(0..=(raw.as_millis() as u64 / 2))
    } else {
        0
    };
    (raw + Duration::from_millis(jitter_ms)).min(cap)
}

#[cfg(test)]
mod backoff_tests {
    use super::*;

    #[test]
    fn backoff_grows_and_respects_cap() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(60);
        let mut prev_floor = Duration::ZERO;
        for attempt in 1..=10 {
            let d = backoff_delay(attempt, base, cap);
            let floor = base.saturating_mul(1u32 << (attempt - 1).min(16)).min(cap);
            assert!(d >= floor.min(cap), "attempt {} below floor", attempt);
            assert!(d <= cap);
            assert!(floor >= prev_floor);
            prev_floor = floor;
        }
    }
}
