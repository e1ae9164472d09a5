use std::sync::Arc;

use tracing::{error, info, warn};

use crate::adaptor::FeaturePricing;
use crate::error::{PricingError, SettlementError, SettlementResult};
use crate::ledger::{self, QuotaLedger};
use crate::pricing::{
    billing_model_name, FeatureRequest, Metering, ModelPriceCalculator, PriceRequest,
    PricingConfig, TaskAction,
};
use crate::status;
use crate::store::TaskStore;
use crate::task::{Task, TaskInfo, TaskStatus, UsageSignal};

/// What a single reconciliation did to the user's balance.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// Task is still running; record updated, balance untouched.
    Pending,
    Refunded { quota: i64 },
    /// Failure observed but nothing to return.
    RefundSkipped,
    ToppedUp { delta: i64, actual: i64 },
    Credited { amount: i64, actual: i64 },
    Exact { actual: i64 },
    /// Success without reported usage keeps the pre-deduction as final.
    Unmetered,
    /// Success observed for a task that had already reached a terminal state.
    AlreadySettled,
}

#[derive(Debug)]
enum LedgerAction {
    Refund { quota: i64, content: String },
    TopUp { delta: i64, content: String },
    Credit { amount: i64, content: String },
}

/// key: settlement -> fold one provider observation into a task and its ledger.
///
/// The task record is persisted before any balance mutation. A failed write
/// leaves the balance untouched so the next poll retries from the same state.
pub struct TaskSettlementReconciler<'a> {
    store: &'a dyn TaskStore,
    ledger: &'a dyn QuotaLedger,
    pricing: Arc<PricingConfig>,
}

impl<'a> TaskSettlementReconciler<'a> {
    pub fn new(
        store: &'a dyn TaskStore,
        ledger: &'a dyn QuotaLedger,
        pricing: Arc<PricingConfig>,
    ) -> Self {
        Self {
            store,
            ledger,
            pricing,
        }
    }

    pub async fn reconcile(
        &self,
        task: &mut Task,
        info: &TaskInfo,
        feature_pricing: Option<&dyn FeaturePricing>,
        now: i64,
    ) -> SettlementResult<SettlementOutcome> {
        let previous = task.status;
        let pre_deducted = task.quota;
        let mut next = task.clone();
        let transition = status::apply_observation(&mut next, info, now);

        let (outcome, action) = match transition.current {
            TaskStatus::Failure if previous == TaskStatus::Failure => {
                warn!(
                    task_id = %task.task_id,
                    "task already failed, skip refund"
                );
                (SettlementOutcome::RefundSkipped, None)
            }
            TaskStatus::Failure if pre_deducted > 0 => {
                let content = format!(
                    "async task {} failed: {}, refunded {} quota",
                    next.task_id, next.fail_reason, pre_deducted
                );
                (
                    SettlementOutcome::Refunded {
                        quota: pre_deducted,
                    },
                    Some(LedgerAction::Refund {
                        quota: pre_deducted,
                        content,
                    }),
                )
            }
            TaskStatus::Failure => (SettlementOutcome::RefundSkipped, None),
            TaskStatus::Success if previous.is_terminal() => {
                (SettlementOutcome::AlreadySettled, None)
            }
            TaskStatus::Success => match transition.usage {
                Some(usage) => self.settle(&mut next, usage, feature_pricing).await?,
                None => (SettlementOutcome::Unmetered, None),
            },
            TaskStatus::Submitted | TaskStatus::Queued | TaskStatus::InProgress => {
                (SettlementOutcome::Pending, None)
            }
        };

        self.store
            .update_task(&next)
            .await
            .map_err(|source| SettlementError::Persist {
                task_id: next.task_id.clone(),
                source,
            })?;
        *task = next;

        if let Some(action) = action {
            self.apply(task, action, pre_deducted).await?;
        }
        Ok(outcome)
    }

    async fn billing_group(&self, task: &Task) -> SettlementResult<String> {
        if !task.group.is_empty() {
            return Ok(task.group.clone());
        }
        self.store
            .user_group(task.user_id)
            .await?
            .ok_or_else(|| PricingError::GroupUnresolved(task.user_id).into())
    }

    /// Prices the reported usage and sets `task.quota` to the settled amount.
    async fn settle(
        &self,
        task: &mut Task,
        usage: UsageSignal,
        feature_pricing: Option<&dyn FeaturePricing>,
    ) -> SettlementResult<(SettlementOutcome, Option<LedgerAction>)> {
        let group = self.billing_group(task).await?;
        let action = TaskAction::parse(&task.action);
        let model = billing_model_name(&task.platform, &action, task.origin_model());

        let feature_scale = match feature_pricing {
            Some(pricing) => {
                Some(pricing.unit_price_scale(&self.pricing, &FeatureRequest::from_task(task))?)
            }
            None => None,
        };
        let mut request = PriceRequest::new(&model, &group, Metering::Units(usage.units()));
        if let Some(scale) = feature_scale {
            request = request.with_feature_scale(scale);
        }
        let breakdown = ModelPriceCalculator::new(&self.pricing).quota(&request)?;

        let actual = breakdown.quota;
        let delta = actual - task.quota;
        let content = format!(
            "async task {} settled: action {}, usage {:.2}, model ratio {:.4}, feature scale {:.4}, group ratio {:.4}, pre-deducted {}, actual {}",
            task.task_id,
            action,
            usage.units(),
            breakdown.model_ratio,
            breakdown.feature_scale,
            breakdown.group_ratio,
            task.quota,
            actual
        );

        if delta == 0 {
            info!(
                task_id = %task.task_id,
                quota = actual,
                "settled quota matches pre-deduction"
            );
            return Ok((SettlementOutcome::Exact { actual }, None));
        }

        task.quota = actual;
        if delta > 0 {
            Ok((
                SettlementOutcome::ToppedUp { delta, actual },
                Some(LedgerAction::TopUp { delta, content }),
            ))
        } else {
            Ok((
                SettlementOutcome::Credited {
                    amount: -delta,
                    actual,
                },
                Some(LedgerAction::Credit {
                    amount: -delta,
                    content,
                }),
            ))
        }
    }

    async fn apply(
        &self,
        task: &mut Task,
        action: LedgerAction,
        pre_deducted: i64,
    ) -> SettlementResult<()> {
        let (kind, amount, result) = match action {
            LedgerAction::Refund { quota, content } => (
                "refund",
                quota,
                ledger::refund(self.ledger, task, quota, content).await,
            ),
            LedgerAction::TopUp { delta, content } => (
                "top_up",
                delta,
                ledger::top_up(self.ledger, task, delta, content).await,
            ),
            LedgerAction::Credit { amount, content } => (
                "credit",
                amount,
                ledger::credit(self.ledger, task, amount, content).await,
            ),
        };

        match result {
            Ok(()) => {
                info!(
                    task_id = %task.task_id,
                    user_id = task.user_id,
                    kind,
                    amount,
                    quota = task.quota,
                    "task settlement applied"
                );
                Ok(())
            }
            Err(source) => {
                error!(
                    ?source,
                    task_id = %task.task_id,
                    user_id = task.user_id,
                    kind,
                    amount,
                    "ledger mutation failed after task was persisted"
                );
                // Keep the stored quota equal to what the user was actually charged.
                if kind != "refund" && task.quota != pre_deducted {
                    task.quota = pre_deducted;
                    if let Err(err) = self.store.update_task(task).await {
                        error!(?err, task_id = %task.task_id, "failed to restore pre-deducted quota");
                    }
                }
                Err(SettlementError::Ledger {
                    task_id: task.task_id.clone(),
                    source,
                })
            }
        }
    }
}
