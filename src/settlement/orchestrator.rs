//! Per-deal settlement state machine

use super::executor::{ChainExecutor, ExecutorProvider, Observation, NOT_YET_OBSERVED};
use super::timeline::{StepId, StepStatus, Timeline, TimelineStep};
use super::{
    CheckoutMode, LogLevel, LogLine, Mode, Narration, RunFailure, RunState, RunSummary,
    SettlementEvent, SettlementRequest,
};
use crate::config::Settings;
use crate::deal::{create_deal, encode_deal_payload, format_price, hash_to_hex, Deal};
use crate::error::{SettlementError, SettlementResult};
use crate::session::{ConfirmationGate, WaitOutcome};

use chrono::Utc;
use ethers::types::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

/// Starts settlement runs; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    settings: Arc<Settings>,
    gate: Arc<ConfirmationGate>,
    executors: Arc<dyn ExecutorProvider>,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        gate: Arc<ConfirmationGate>,
        executors: Arc<dyn ExecutorProvider>,
    ) -> Self {
        Self {
            settings,
            gate,
            executors,
        }
    }

    /// Start a run in its own task and return its event stream
    ///
    /// The stream ends with exactly one `done` or `error`, unless `cancel`
    /// fires first, in which case it ends without a terminal event.
    pub fn spawn(
        &self,
        request: SettlementRequest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<SettlementEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = self.clone();

        tokio::spawn(async move {
            let mode = request.mode;
            let mut emitter = RunEmitter::new(tx, cancel.clone());
            crate::metrics::record_run_started(mode.as_str());
            info!("Settlement run started ({} mode)", mode);

            let outcome = match this.run(request, &mut emitter, &cancel).await {
                Ok(()) => "done",
                Err(e) if e.is_abort() => {
                    info!("Settlement run aborted by client");
                    "aborted"
                }
                Err(e) => {
                    error!("Settlement run failed: {}", e);
                    emitter.fail(&e).await;
                    "error"
                }
            };

            crate::metrics::record_run_finished(mode.as_str(), outcome);
        });

        rx
    }

    async fn run(
        &self,
        request: SettlementRequest,
        emitter: &mut RunEmitter,
        cancel: &CancellationToken,
    ) -> SettlementResult<()> {
        let mode = request.mode;
        emitter.state(run_state(mode, true, false, None)).await?;

        let missing = self.settings.missing_keys(mode);
        if !missing.is_empty() {
            return Err(SettlementError::Configuration { missing });
        }

        let deal = self.resolve_deal(&request, emitter).await?;
        let deal_hex = hash_to_hex(&deal.deal_id);
        let payload = encode_deal_payload(&deal);

        let executor = self.executors.executor_for(mode)?;
        executor.preflight(&deal, cancel).await?;

        emitter
            .message(format!(
                "Settling deal {} for {} in {} mode",
                deal.short_id(),
                format_price(deal.price),
                mode
            ))
            .await?;

        if request.checkout == CheckoutMode::Confirm {
            self.await_confirmation(mode, &deal_hex, emitter, cancel)
                .await?;
        }

        emitter
            .state(run_state(mode, true, true, Some(deal_hex.clone())))
            .await?;
        for id in StepId::CHAIN {
            emitter.step(TimelineStep::idle(id)).await?;
        }

        self.execute_chain_steps(executor.as_ref(), &deal, payload, emitter, cancel)
            .await?;

        emitter
            .state(run_state(mode, false, false, Some(deal_hex.clone())))
            .await?;
        let summary = RunSummary {
            deal_id: deal_hex,
            mode,
            elapsed_ms: emitter.elapsed_ms(),
            steps: emitter.timeline.steps().to_vec(),
        };
        emitter.emit(SettlementEvent::Done(summary)).await?;

        info!("Deal {} settled", deal.short_id());
        Ok(())
    }

    /// Take the request's deal as-is, or prepare one from its terms
    async fn resolve_deal(
        &self,
        request: &SettlementRequest,
        emitter: &mut RunEmitter,
    ) -> SettlementResult<Deal> {
        if let Some(wire) = &request.deal {
            if request.terms.is_some() {
                warn!("Request carries both a deal and terms, settling the deal");
            }
            let deal = Deal::try_from(wire.clone())?;
            deal.verify()?;
            return Ok(deal);
        }

        let terms = request.terms.as_ref().ok_or_else(|| {
            SettlementError::invalid_field("deal", "request carries neither a deal nor terms")
        })?;

        emitter
            .step(TimelineStep::running(StepId::Prepare, "Preparing deal from agreed terms"))
            .await?;
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        let fields = terms.to_fields(now + self.settings.settlement.deal_ttl_secs)?;
        let deal = create_deal(fields);
        emitter
            .step(TimelineStep::done(
                StepId::Prepare,
                format!("Deal {} at {}", deal.short_id(), format_price(deal.price)),
            ))
            .await?;

        Ok(deal)
    }

    async fn await_confirmation(
        &self,
        mode: Mode,
        deal_hex: &str,
        emitter: &mut RunEmitter,
        cancel: &CancellationToken,
    ) -> SettlementResult<()> {
        let session_id = Uuid::new_v4().to_string();
        self.gate.register(&session_id);

        let outcome = async {
            emitter
                .step(TimelineStep::running(
                    StepId::Confirm,
                    "Waiting for checkout confirmation",
                ))
                .await?;
            let mut state = run_state(mode, true, false, Some(deal_hex.to_string()));
            state.awaiting_confirm = true;
            state.session_id = Some(session_id.clone());
            emitter.state(state).await?;

            self.gate.wait(&session_id, cancel).await
        }
        .await;
        self.gate.cleanup(&session_id);

        match outcome? {
            WaitOutcome::Confirmed => {
                emitter
                    .step(TimelineStep::done(StepId::Confirm, "Checkout confirmed"))
                    .await
            }
            WaitOutcome::Aborted => Err(SettlementError::StreamAbort),
        }
    }

    async fn execute_chain_steps(
        &self,
        executor: &dyn ChainExecutor,
        deal: &Deal,
        payload: Bytes,
        emitter: &mut RunEmitter,
        cancel: &CancellationToken,
    ) -> SettlementResult<()> {
        emitter
            .step(TimelineStep::running(
                StepId::Approve,
                format!("Approving {} for the origin gateway", format_price(deal.price)),
            ))
            .await?;
        let tx_hash = executor.approve(deal, cancel).await?;
        emitter
            .step(
                TimelineStep::done(StepId::Approve, "Allowance granted")
                    .with_tx(hash_to_hex(&tx_hash)),
            )
            .await?;

        emitter
            .step(TimelineStep::running(
                StepId::Deposit,
                "Depositing payment with the deal payload",
            ))
            .await?;
        let tx_hash = executor.deposit(deal, payload, cancel).await?;
        emitter
            .step(
                TimelineStep::done(StepId::Deposit, "Deposit accepted")
                    .with_tx(hash_to_hex(&tx_hash)),
            )
            .await?;

        emitter
            .step(TimelineStep::running(
                StepId::Orchestrate,
                "Waiting for the router to process the deal",
            ))
            .await?;
        let observed = executor.observe_orchestration(deal, cancel).await;
        emitter
            .observation(StepId::Orchestrate, "DealProcessed observed", observed)
            .await?;

        emitter
            .step(TimelineStep::running(
                StepId::Deliver,
                "Waiting for the escrow to release the asset",
            ))
            .await?;
        let observed = executor.observe_delivery(deal, cancel).await;
        emitter
            .observation(StepId::Deliver, "Released to buyer", observed)
            .await
    }
}

fn run_state(mode: Mode, running: bool, settling: bool, deal_id: Option<String>) -> RunState {
    RunState {
        mode,
        running,
        settling,
        awaiting_confirm: false,
        session_id: None,
        deal_id,
    }
}

/// Sends a run's events, tracking its timeline
///
/// Nothing is sent once the run is cancelled.
struct RunEmitter {
    tx: mpsc::Sender<SettlementEvent>,
    cancel: CancellationToken,
    timeline: Timeline,
    running_since: HashMap<StepId, Instant>,
    started: Instant,
}

impl RunEmitter {
    fn new(tx: mpsc::Sender<SettlementEvent>, cancel: CancellationToken) -> Self {
        Self {
            tx,
            cancel,
            timeline: Timeline::new(),
            running_since: HashMap::new(),
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    async fn emit(&mut self, event: SettlementEvent) -> SettlementResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SettlementError::StreamAbort);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SettlementError::StreamAbort),
            sent = self.tx.send(event) => sent.map_err(|_| {
                // Receiver dropped means the client is gone
                self.cancel.cancel();
                SettlementError::StreamAbort
            }),
        }
    }

    async fn state(&mut self, state: RunState) -> SettlementResult<()> {
        self.emit(SettlementEvent::State(state)).await
    }

    async fn message(&mut self, text: String) -> SettlementResult<()> {
        self.emit(SettlementEvent::Message(Narration { text })).await
    }

    async fn log(&mut self, level: LogLevel, text: String) -> SettlementResult<()> {
        self.emit(SettlementEvent::Log(LogLine { level, text })).await
    }

    async fn step(&mut self, update: TimelineStep) -> SettlementResult<()> {
        if !self.timeline.apply(update.clone()) {
            warn!("Dropped regressing update for step {}", update.id);
            return Ok(());
        }

        if update.status.is_terminal() {
            if let Some(since) = self.running_since.remove(&update.id) {
                crate::metrics::record_step_latency(
                    update.id.as_str(),
                    since.elapsed().as_secs_f64(),
                );
            }
        } else if update.status == StepStatus::Running {
            self.running_since.insert(update.id, Instant::now());
        }

        self.emit(SettlementEvent::TimelineStep(update)).await
    }

    /// Close an observing step; a missed window still completes the step
    async fn observation(
        &mut self,
        id: StepId,
        observed_detail: &str,
        result: SettlementResult<Observation>,
    ) -> SettlementResult<()> {
        let pending = match result {
            Ok(Observation::Observed {
                tx_hash,
                block_number,
            }) => {
                let detail = match block_number {
                    Some(block) => format!("{} in block {}", observed_detail, block),
                    None => observed_detail.to_string(),
                };
                return self
                    .step(TimelineStep::done(id, detail).with_tx(hash_to_hex(&tx_hash)))
                    .await;
            }
            Ok(Observation::Pending { detail }) => detail,
            Err(e) if e.is_abort() || e.is_fatal() => return Err(e),
            Err(e) => {
                self.log(LogLevel::Warn, format!("{}: {}", id, e)).await?;
                NOT_YET_OBSERVED.to_string()
            }
        };

        crate::metrics::record_observation_timeout(id.as_str());
        warn!("Step {} closed without observation: {}", id, pending);
        self.step(TimelineStep::done(id, pending)).await
    }

    /// Mark the active step failed and send the terminal error
    async fn fail(&mut self, error: &SettlementError) {
        let active = self.timeline.active();
        if let Some(id) = active {
            if self
                .step(TimelineStep::error(id, error.to_string()))
                .await
                .is_err()
            {
                return;
            }
        }

        let failure = RunFailure {
            message: error.to_string(),
            kind: error.kind().to_string(),
            step: active,
        };
        if self.emit(SettlementEvent::Error(failure)).await.is_err() {
            warn!("Client left before the error could be reported");
        }
    }
}
