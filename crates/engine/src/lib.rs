//! # Engine Crate
//!
//! The signal-to-settlement pipeline. A signal is checked for freshness, turned
//! into a decision by the oracle, admitted per user, dispatched tier by tier,
//! executed on each user's exchanges, registered with the lifecycle manager and,
//! on close, settled across its contributors.

use chrono::Utc;
use configuration::{Config, TierConfig};
use core_types::{
    Contributor, Decision, ExitReason, Position, PositionSide, PositionStatus, Signal,
    SignalOutcome, SignalSummary, TradeReport, UserProfile,
};
use database::TradingStore;
use events::{EngineEvent, ExecutionFailed, Notifier, SignalProcessed, UserSuspended};
use executor::{ExecutionOrchestrator, LegOutcome, OpenRequest};
use risk::{AdmissionController, AdmissionRejection, AdmissionState, Approval, Candidate, RiskProfile, UserLocks};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;

pub mod error;
pub mod lifecycle;
pub mod oracle;
pub mod scheduler;
pub mod settlement;

pub use error::EngineError;
pub use lifecycle::{CloseOutcome, LifecycleManager};
pub use oracle::{
    DecisionOracle, HttpDecisionOracle, MarketAnalysis, MarketAnalysisProvider, SignalFollowingOracle,
    SignalOnlyAnalysis,
};
pub use scheduler::{PriorityScheduler, TierBatch};

/// The collaborators a `TradingEngine` is built from.
pub struct EngineParts {
    pub config: Arc<Config>,
    pub store: Arc<dyn TradingStore>,
    pub factory: Arc<dyn api_client::ConnectorFactory>,
    pub oracle: Arc<dyn DecisionOracle>,
    pub analysis: Arc<dyn MarketAnalysisProvider>,
    pub notifier: Arc<dyn Notifier>,
}

/// One open signal, resolved and ready to be applied to users.
struct OpenPlan<'a> {
    signal: &'a Signal,
    decision: &'a Decision,
    side: PositionSide,
    quote_currency: &'a str,
}

/// The central orchestrator of the signal pipeline.
pub struct TradingEngine {
    config: Arc<Config>,
    store: Arc<dyn TradingStore>,
    oracle: Arc<dyn DecisionOracle>,
    analysis: Arc<dyn MarketAnalysisProvider>,
    notifier: Arc<dyn Notifier>,
    orchestrator: Arc<ExecutionOrchestrator>,
    admission: AdmissionController,
    locks: Arc<UserLocks>,
    scheduler: PriorityScheduler,
    lifecycle: Arc<LifecycleManager>,
}

impl TradingEngine {
    pub fn new(parts: EngineParts) -> Self {
        let EngineParts {
            config,
            store,
            factory,
            oracle,
            analysis,
            notifier,
        } = parts;

        let orchestrator = Arc::new(ExecutionOrchestrator::new(
            factory,
            &config.execution,
            config.admission.min_notional,
        ));
        let locks = Arc::new(UserLocks::new());
        let lifecycle = Arc::new(LifecycleManager::new(
            config.clone(),
            store.clone(),
            orchestrator.clone(),
            locks.clone(),
            notifier.clone(),
        ));

        Self {
            admission: AdmissionController::new(&config.admission, config.engine.signal_validity()),
            scheduler: PriorityScheduler::new(config.engine.max_concurrent_users_per_tier),
            config,
            store,
            oracle,
            analysis,
            notifier,
            orchestrator,
            locks,
            lifecycle,
        }
    }

    /// The lifecycle manager, for running the monitor alongside signal processing.
    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        Arc::clone(&self.lifecycle)
    }

    pub fn locks(&self) -> Arc<UserLocks> {
        Arc::clone(&self.locks)
    }

    /// Runs one signal through the whole pipeline and reports per-user results.
    ///
    /// Admission and execution failures are reported in the summary. Only
    /// failures that stop the signal as a whole (invalid symbol, oracle or store
    /// unavailable) are returned as errors.
    pub async fn process_signal(&self, signal: Signal) -> Result<SignalSummary, EngineError> {
        let now = Utc::now();
        tracing::info!(
            signal_id = %signal.id,
            symbol = %signal.symbol,
            operation = ?signal.operation,
            price = %signal.price,
            "signal received"
        );

        if let Err(rejection) = self.admission.check_freshness(&signal, now) {
            tracing::warn!(signal_id = %signal.id, category = rejection.category(), reason = %rejection, "signal abandoned");
            return Ok(self.finish(&signal, SignalOutcome::Expired, None, 0, Vec::new()));
        }
        let quote_currency = signal.quote_currency(&self.config.engine.quote_currencies)?;

        if !signal.operation.is_open() {
            return self.process_close_signal(&signal).await;
        }

        let analysis = self.analysis.analyze(&signal).await?;
        let timeout = self.config.engine.oracle_timeout();
        let decision = tokio::time::timeout(timeout, self.oracle.make_decision(&signal, &analysis))
            .await
            .map_err(|_| EngineError::OracleTimeout(timeout.as_millis()))??;

        let side = match decision.action.position_side() {
            Some(side) if decision.confidence >= self.config.engine.min_confidence => side,
            _ => {
                tracing::info!(
                    signal_id = %signal.id,
                    action = ?decision.action,
                    confidence = %decision.confidence,
                    "decision is HOLD, nothing to execute"
                );
                return Ok(self.finish(&signal, SignalOutcome::Held, Some(decision), 0, Vec::new()));
            }
        };
        if side != signal.operation.position_side() {
            tracing::info!(signal_id = %signal.id, %side, "decision overrides the signal's direction");
        }

        let users = self.store.load_trading_users().await?;
        let eligible = users.len();
        let batches = PriorityScheduler::group(&self.config, users);
        let plan = OpenPlan {
            signal: &signal,
            decision: &decision,
            side,
            quote_currency: &quote_currency,
        };
        let reports = self
            .scheduler
            .run(batches, |user, tier| self.open_for_user(&plan, user, tier))
            .await;

        Ok(self.finish(&signal, SignalOutcome::Processed, Some(decision), eligible, reports))
    }

    /// CLOSE_LONG / CLOSE_SHORT: close every open position on the symbol with
    /// that side, whoever holds it. Owners are found from the positions, so a
    /// user who has since disabled trading is still closed out.
    async fn process_close_signal(&self, signal: &Signal) -> Result<SignalSummary, EngineError> {
        let side = signal.operation.position_side();
        let owners: BTreeSet<uuid::Uuid> = self
            .store
            .open_positions_for_symbol(&signal.symbol)
            .await?
            .into_iter()
            .filter(|p| p.side == side)
            .map(|p| p.user_id)
            .collect();
        let eligible = owners.len();

        let mut users = Vec::with_capacity(owners.len());
        let mut reports = Vec::new();
        for user_id in owners {
            match self.store.load_user(user_id).await {
                Ok(user) => users.push(user),
                Err(e) => {
                    let e = EngineError::from(e);
                    tracing::error!(%user_id, error = %e, "could not load position owner");
                    reports.push(TradeReport::rejected(user_id, e.code(), e.to_string()));
                }
            }
        }

        let batches = PriorityScheduler::group(&self.config, users);
        let closed = self
            .scheduler
            .run(batches, |user, _tier| async move {
                let _guard = self.locks.lock(user.id).await;
                match self
                    .lifecycle
                    .close_matching(&user, &signal.symbol, side, ExitReason::Signal, signal.price)
                    .await
                {
                    Ok(reports) => reports,
                    Err(e) => vec![TradeReport::rejected(user.id, e.code(), e.to_string())],
                }
            })
            .await;
        reports.extend(closed);

        Ok(self.finish(signal, SignalOutcome::Processed, None, eligible, reports))
    }

    fn finish(
        &self,
        signal: &Signal,
        outcome: SignalOutcome,
        decision: Option<Decision>,
        total_eligible_users: usize,
        executed_trades: Vec<TradeReport>,
    ) -> SignalSummary {
        let succeeded = executed_trades.iter().filter(|t| t.success).count();
        let failed = executed_trades.len() - succeeded;
        tracing::info!(
            signal_id = %signal.id,
            outcome = ?outcome,
            users = total_eligible_users,
            succeeded,
            failed,
            "signal processed"
        );
        self.notifier.publish(EngineEvent::SignalProcessed(SignalProcessed {
            signal_id: signal.id,
            symbol: signal.symbol.clone(),
            outcome,
            succeeded,
            failed,
        }));
        SignalSummary {
            signal_id: signal.id,
            outcome,
            decision,
            total_eligible_users,
            executed_trades,
        }
    }

    /// The per-user job: admission, optional reversal, then execution. Runs under
    /// the user's lock with admission state read fresh from the store.
    async fn open_for_user(
        &self,
        plan: &OpenPlan<'_>,
        user: UserProfile,
        tier: TierConfig,
    ) -> Vec<TradeReport> {
        let user_id = user.id;
        let _guard = self.locks.lock(user_id).await;
        match self.admit_and_open(plan, user, &tier).await {
            Ok(reports) => reports,
            Err(e) => {
                tracing::error!(%user_id, code = e.code(), error = %e, "user job failed");
                vec![TradeReport::rejected(user_id, e.code(), e.to_string())]
            }
        }
    }

    async fn admit_and_open(
        &self,
        plan: &OpenPlan<'_>,
        user: UserProfile,
        tier: &TierConfig,
    ) -> Result<Vec<TradeReport>, EngineError> {
        let signal = plan.signal;
        let now = Utc::now();
        let user = self.store.load_user(user.id).await?;
        let state = AdmissionState {
            open_positions: self.store.open_positions_for_user(user.id).await?,
            last_execution_at: self.store.last_successful_execution(user.id, &signal.symbol).await?,
            daily_volume: self
                .store
                .daily_volume(user.id, now - chrono::Duration::hours(24))
                .await?,
        };
        let profile = RiskProfile::derive(tier, user.risk_tolerance);
        let candidate = Candidate {
            signal,
            decision: plan.decision,
            side: plan.side,
            user: &user,
            profile: &profile,
            quote_currency: plan.quote_currency,
            now,
        };

        let approval = match self.admission.evaluate(&candidate, &state) {
            Ok(approval) => approval,
            Err(rejection) => return Ok(vec![self.reject(&user, rejection).await]),
        };

        let mut reports = Vec::new();
        for opposite in &approval.reversals {
            let report = self
                .lifecycle
                .close_and_report(&user, opposite, ExitReason::Reversal, signal.price)
                .await;
            let closed = report.success;
            reports.push(report);
            if !closed {
                tracing::warn!(user_id = %user.id, position_id = %opposite.id, "reversal close failed, not opening");
                return Ok(reports);
            }
        }

        reports.extend(self.open(plan, &user, &profile, &approval).await?);
        Ok(reports)
    }

    /// Reports a rejection and counts it against the user when it is a violation.
    async fn reject(&self, user: &UserProfile, rejection: AdmissionRejection) -> TradeReport {
        tracing::info!(user_id = %user.id, category = rejection.category(), reason = %rejection, "admission rejected");
        if rejection.is_violation() {
            let warnings = self.locks.record_violation(user.id).await;
            if warnings >= self.config.admission.warning_threshold {
                self.suspend(user, warnings).await;
            }
        }
        TradeReport::rejected(user.id, rejection.category(), rejection.to_string())
    }

    async fn suspend(&self, user: &UserProfile, warnings: u32) {
        let reason = format!("{warnings} risk violations, pending manual review");
        match self.store.suspend_user(user.id, &reason).await {
            Ok(()) => {
                tracing::warn!(user_id = %user.id, warnings, "user suspended");
                self.locks.reset_warnings(user.id).await;
                self.notifier.publish(EngineEvent::UserSuspended(UserSuspended {
                    user_id: user.id,
                    warnings,
                    reason,
                }));
            }
            Err(e) => tracing::error!(user_id = %user.id, error = %e, "failed to persist suspension"),
        }
    }

    /// Places the opening legs and registers a position for each filled one.
    async fn open(
        &self,
        plan: &OpenPlan<'_>,
        user: &UserProfile,
        profile: &RiskProfile,
        approval: &Approval,
    ) -> Result<Vec<TradeReport>, EngineError> {
        let request = OpenRequest {
            user,
            signal: plan.signal,
            side: plan.side,
            quote_currency: plan.quote_currency,
            max_notional: profile.max_position_notional,
        };
        let legs = match self.orchestrator.open(request).await {
            Ok(legs) => legs,
            Err(e) => return Ok(vec![TradeReport::rejected(user.id, e.code(), e.to_string())]),
        };

        let mut reports = Vec::with_capacity(legs.len());
        for mut leg in legs {
            let report = match self.position_from_leg(plan, user, approval, &leg) {
                Some(position) => {
                    leg.attempt.position_id = Some(position.id);
                    self.store.record_execution_attempt(&leg.attempt).await?;
                    let contributor = Contributor {
                        user_id: user.id,
                        contributed: position.notional,
                        commission_rate: profile.commission_rate,
                    };
                    match self.lifecycle.register(&position, &[contributor]).await {
                        Ok(()) => leg.to_report(),
                        Err(e) => {
                            tracing::error!(
                                user_id = %user.id,
                                exchange = %leg.exchange,
                                error = %e,
                                "CRITICAL: order filled but the position could not be stored"
                            );
                            TradeReport::rejected(user.id, e.code(), e.to_string())
                        }
                    }
                }
                None => {
                    self.store.record_execution_attempt(&leg.attempt).await?;
                    self.publish_leg_failure(plan, &leg);
                    leg.to_report()
                }
            };
            if let Some(unwind) = leg.unwind.as_mut() {
                unwind.position_id = leg.attempt.position_id;
                self.store.record_execution_attempt(unwind).await?;
            }
            reports.push(report);
        }
        Ok(reports)
    }

    fn position_from_leg(
        &self,
        plan: &OpenPlan<'_>,
        user: &UserProfile,
        approval: &Approval,
        leg: &LegOutcome,
    ) -> Option<Position> {
        let filled = leg.result.as_ref().ok()?;
        let entry = filled.fill.avg_price;
        Some(Position {
            id: uuid::Uuid::new_v4(),
            user_id: user.id,
            symbol: plan.signal.symbol.clone(),
            side: plan.side,
            exchange: leg.exchange,
            entry_price: entry,
            quantity: filled.fill.filled_qty,
            notional: filled.notional,
            leverage: user.trading.leverage,
            status: PositionStatus::Open,
            stop_loss: Some(approval.levels.stop_loss),
            take_profit: Some(approval.levels.take_profit),
            entry_time: leg.attempt.created_at,
            current_price: entry,
            unrealized_pnl: Decimal::ZERO,
            max_profit_pct: Decimal::ZERO,
            max_drawdown_pct: Decimal::ZERO,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            realized_pnl: None,
            commission: None,
        })
    }

    fn publish_leg_failure(&self, plan: &OpenPlan<'_>, leg: &LegOutcome) {
        if let Err(e) = &leg.result {
            self.notifier.publish(EngineEvent::ExecutionFailed(ExecutionFailed {
                user_id: leg.attempt.user_id,
                exchange: leg.exchange,
                symbol: plan.signal.symbol.clone(),
                code: e.code().to_string(),
                message: e.to_string(),
            }));
        }
    }
}
