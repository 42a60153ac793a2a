use configuration::{Config, TierConfig};
use core_types::UserProfile;
use futures::stream::{self, StreamExt};
use std::future::Future;

/// The users of one tier, in the order they were loaded.
#[derive(Debug, Clone)]
pub struct TierBatch {
    pub tier: TierConfig,
    pub users: Vec<UserProfile>,
}

/// Runs tiers strictly by priority, waiting each tier's delay before it starts.
/// Users within a tier run concurrently up to `max_concurrent` at a time, in no
/// particular order.
#[derive(Debug, Clone)]
pub struct PriorityScheduler {
    max_concurrent: usize,
}

impl PriorityScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Groups users by tier, highest priority (lowest number) first. Users whose
    /// tier is unknown join the lowest priority tier.
    pub fn group(config: &Config, users: Vec<UserProfile>) -> Vec<TierBatch> {
        let mut batches: Vec<TierBatch> = Vec::new();
        for user in users {
            let Some(tier) = config.tier_or_fallback(&user.tier) else {
                continue;
            };
            if config.tier(&user.tier).is_none() {
                tracing::warn!(user_id = %user.id, tier = %user.tier, fallback = %tier.name, "unknown tier, using fallback");
            }
            match batches.iter_mut().find(|b| b.tier.name == tier.name) {
                Some(batch) => batch.users.push(user),
                None => batches.push(TierBatch {
                    tier: tier.clone(),
                    users: vec![user],
                }),
            }
        }
        batches.sort_by_key(|b| b.tier.priority);
        batches
    }

    /// Runs `job` for every user, tier by tier, and flattens the results.
    pub async fn run<F, Fut, R>(&self, batches: Vec<TierBatch>, job: F) -> Vec<R>
    where
        F: Fn(UserProfile, TierConfig) -> Fut,
        Fut: Future<Output = Vec<R>>,
    {
        let mut results = Vec::new();
        for batch in batches {
            let delay = batch.tier.delay();
            if !delay.is_zero() {
                tracing::debug!(tier = %batch.tier.name, delay_ms = batch.tier.delay_ms, "waiting before tier");
                tokio::time::sleep(delay).await;
            }
            tracing::info!(tier = %batch.tier.name, users = batch.users.len(), "dispatching tier");

            let tier = batch.tier;
            let per_user: Vec<Vec<R>> = stream::iter(batch.users)
                .map(|user| job(user, tier.clone()))
                .buffer_unordered(self.max_concurrent)
                .collect()
                .await;
            results.extend(per_user.into_iter().flatten());
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{RiskTolerance, UserTradingConfig};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;
    use uuid::Uuid;

    fn user(tier: &str) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            tier: tier.into(),
            risk_tolerance: RiskTolerance::Moderate,
            subscription_active: true,
            subscription_expires_at: None,
            trading_enabled: true,
            trading_suspended: false,
            credentials: vec![],
            balances: vec![],
            trading: UserTradingConfig::default(),
        }
    }

    #[test]
    fn groups_by_priority_with_fallback() {
        let config = Config::default();
        let batches = PriorityScheduler::group(
            &config,
            vec![user("trial"), user("premium"), user("gold"), user("standard")],
        );
        let names: Vec<_> = batches.iter().map(|b| b.tier.name.as_str()).collect();
        assert_eq!(names, ["premium", "standard", "trial"]);
        // "gold" is unknown and lands in trial.
        assert_eq!(batches[2].users.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tiers_run_in_order_after_their_delay() {
        let config = Config::default();
        let batches = PriorityScheduler::group(
            &config,
            vec![user("trial"), user("standard"), user("premium"), user("premium")],
        );
        let started = Instant::now();
        let log = Arc::new(Mutex::new(Vec::new()));

        let results = PriorityScheduler::new(4)
            .run(batches, |u, tier| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push((tier.name.clone(), started.elapsed()));
                    vec![u.id]
                }
            })
            .await;

        assert_eq!(results.len(), 4);
        let log = log.lock().unwrap();
        let order: Vec<_> = log.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(order, ["premium", "premium", "standard", "trial"]);
        assert_eq!(log[0].1, Duration::ZERO);
        assert_eq!(log[2].1, Duration::from_millis(1_000));
        assert_eq!(log[3].1, Duration::from_millis(4_000));
    }
}
