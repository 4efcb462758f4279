use chrono::{NaiveDate, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::warn;
use uuid::Uuid;

use crate::models::Platform;

const SAFETY_FACTOR: f64 = 0.8;

/// `per_tenant = floor((platform_daily_quota / max(active_tenants, 1)) * safety_factor)`.
/// Exposed standalone so the formula itself is testable independent of the
/// hardcoded per-platform quotas below.
pub fn per_tenant_share(platform_daily_quota: i64, active_tenants: i64, safety_factor: f64) -> i64 {
    let active = active_tenants.max(1) as f64;
    ((platform_daily_quota as f64 / active) * safety_factor).floor() as i64
}

/// Shared per-platform daily quota (commerce-A enforces one quota per API key across
/// all tenants; commerce-B's is per-shop and generous enough to treat identically).
fn platform_daily_quota(platform: Platform) -> i64 {
    match platform {
        Platform::CommerceA => 10_000,
        Platform::CommerceB => 80,
        Platform::FulfillmentF => 600,
        Platform::NewsletterN => 1_000,
    }
}

#[derive(Debug, Error)]
pub enum BudgeterError {
    #[error("row-store error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub platform_daily_quota: i64,
    pub global_used: i64,
    pub per_tenant_budget: i64,
    pub active_tenants: i64,
}

struct BudgeterState {
    day: NaiveDate,
    global_used: HashMap<Platform, i64>,
    tenant_used: HashMap<(Uuid, Platform), i64>,
    active_tenants: HashMap<Platform, i64>,
    dirty: bool,
}

impl BudgeterState {
    fn new() -> Self {
        Self {
            day: Utc::now().date_naive(),
            global_used: HashMap::new(),
            tenant_used: HashMap::new(),
            active_tenants: HashMap::new(),
            dirty: false,
        }
    }

    fn reset_if_new_day(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.day {
            self.day = today;
            self.global_used.clear();
            self.tenant_used.clear();
        }
    }

    fn per_tenant_budget(&self, platform: Platform) -> i64 {
        let active = *self.active_tenants.get(&platform).unwrap_or(&0);
        per_tenant_share(platform_daily_quota(platform), active, SAFETY_FACTOR)
    }
}

/// Maintains per-platform daily counters and computes each tenant's fair share of a
/// shared external quota. Strictly advisory: the real limit is enforced upstream via
/// 429s, which the retrying HTTP client already handles.
pub struct Budgeter {
    pool: PgPool,
    state: Mutex<BudgeterState>,
}

impl Budgeter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            state: Mutex::new(BudgeterState::new()),
        }
    }

    pub async fn can_request(&self, tenant_id: Uuid, platform: Platform) -> bool {
        let mut state = self.state.lock().await;
        state.reset_if_new_day();
        let global_used = *state.global_used.get(&platform).unwrap_or(&0);
        if global_used >= platform_daily_quota(platform) {
            return false;
        }
        let per_tenant = state.per_tenant_budget(platform);
        let tenant_used = *state.tenant_used.get(&(tenant_id, platform)).unwrap_or(&0);
        tenant_used < per_tenant
    }

    pub async fn record(&self, tenant_id: Uuid, platform: Platform, n: i64) {
        let mut state = self.state.lock().await;
        state.reset_if_new_day();
        *state.global_used.entry(platform).or_insert(0) += n;
        *state.tenant_used.entry((tenant_id, platform)).or_insert(0) += n;
        state.dirty = true;
    }

    pub async fn remaining(&self, tenant_id: Uuid, platform: Platform) -> i64 {
        let mut state = self.state.lock().await;
        state.reset_if_new_day();
        let per_tenant = state.per_tenant_budget(platform);
        let tenant_used = *state.tenant_used.get(&(tenant_id, platform)).unwrap_or(&0);
        (per_tenant - tenant_used).max(0)
    }

    pub async fn snapshot(&self, platform: Platform) -> Snapshot {
        let mut state = self.state.lock().await;
        state.reset_if_new_day();
        Snapshot {
            platform_daily_quota: platform_daily_quota(platform),
            global_used: *state.global_used.get(&platform).unwrap_or(&0),
            per_tenant_budget: state.per_tenant_budget(platform),
            active_tenants: *state.active_tenants.get(&platform).unwrap_or(&0),
        }
    }

    /// Recomputes active-tenant counts from ConnectedAccount rows. Failures are
    /// non-fatal; the last-known counts are retained.
    pub async fn refresh_active_tenants(&self) {
        let rows: Result<Vec<(Platform, i64)>, sqlx::Error> = sqlx::query_as(
            "SELECT platform, COUNT(DISTINCT tenant_id) FROM connected_accounts GROUP BY platform",
        )
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => {
                let mut state = self.state.lock().await;
                for (platform, count) in rows {
                    state.active_tenants.insert(platform, count);
                }
            }
            Err(err) => {
                warn!(?err, "Failed to refresh active tenant counts; keeping last-known values");
            }
        }
    }

    /// Upserts the in-memory ledger into `rate_limit_ledger`. Call on an interval;
    /// `force` bypasses the dirty check used by the background ticker.
    pub async fn flush(&self, force: bool) -> Result<(), BudgeterError> {
        let (day, global, tenant) = {
            let mut state = self.state.lock().await;
            if !force && !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            (
                state.day,
                state.global_used.clone(),
                state.tenant_used.clone(),
            )
        };

        for (platform, used) in global {
            sqlx::query(
                "INSERT INTO rate_limit_ledger (utc_date, platform, tenant_id, request_count)
                 VALUES ($1, $2, NULL, $3)
                 ON CONFLICT (utc_date, platform, tenant_id) DO UPDATE SET
                    request_count = GREATEST(rate_limit_ledger.request_count, EXCLUDED.request_count)",
            )
            .bind(day)
            .bind(platform)
            .bind(used)
            .execute(&self.pool)
            .await?;
        }

        for ((tenant_id, platform), used) in tenant {
            sqlx::query(
                "INSERT INTO rate_limit_ledger (utc_date, platform, tenant_id, request_count)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (utc_date, platform, tenant_id) DO UPDATE SET
                    request_count = GREATEST(rate_limit_ledger.request_count, EXCLUDED.request_count)",
            )
            .bind(day)
            .bind(platform)
            .bind(tenant_id)
            .bind(used)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Loads today's ledger rows into memory on worker start so restarts don't re-use
    /// quota already spent today.
    pub async fn seed(&self) -> Result<(), BudgeterError> {
        let today = Utc::now().date_naive();
        let rows: Vec<(Platform, Option<Uuid>, i64)> = sqlx::query_as(
            "SELECT platform, tenant_id, request_count FROM rate_limit_ledger WHERE utc_date = $1",
        )
        .bind(today)
        .fetch_all(&self.pool)
        .await?;

        let mut state = self.state.lock().await;
        state.day = today;
        for (platform, tenant_id, count) in rows {
            match tenant_id {
                None => {
                    state.global_used.insert(platform, count);
                }
                Some(tenant_id) => {
                    state.tenant_used.insert((tenant_id, platform), count);
                }
            }
        }
        Ok(())
    }

    /// Spawns the periodic flush + active-tenant refresh loops, mirroring the
    /// interval-ticker shape used for usage tracking elsewhere in the workspace.
    pub fn spawn_background_tasks(self: std::sync::Arc<Self>, flush_secs: u64) {
        let flush_self = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(flush_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = flush_self.flush(false).await {
                    warn!(?err, "Failed to flush rate limit ledger");
                }
            }
        });

        let refresh_self = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(300));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                refresh_self.refresh_active_tenants().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_active(platform: Platform, active: i64) -> BudgeterState {
        let mut state = BudgeterState::new();
        state.active_tenants.insert(platform, active);
        state
    }

    #[test]
    fn per_tenant_share_matches_scenario_s4() {
        // S4: quota 100, active tenants 2, safety 0.8 -> per-tenant budget 40.
        assert_eq!(per_tenant_share(100, 2, SAFETY_FACTOR), 40);
    }

    #[test]
    fn per_tenant_budget_reads_active_tenant_count_from_state() {
        let state = state_with_active(Platform::CommerceB, 2);
        let expected = per_tenant_share(platform_daily_quota(Platform::CommerceB), 2, SAFETY_FACTOR);
        assert_eq!(state.per_tenant_budget(Platform::CommerceB), expected);
    }

    #[test]
    fn per_tenant_budget_floors_active_tenants_at_one() {
        let state = state_with_active(Platform::CommerceA, 0);
        let expected = ((platform_daily_quota(Platform::CommerceA) as f64) * SAFETY_FACTOR).floor() as i64;
        assert_eq!(state.per_tenant_budget(Platform::CommerceA), expected);
    }

    /// Invariant 5: after any sequence of recorded requests, the sum of every
    /// tenant's counter for a platform equals that platform's global counter.
    #[test]
    fn tenant_counters_sum_to_global_counter() {
        let mut state = BudgeterState::new();
        let platform = Platform::CommerceA;
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();

        for (tenant, n) in [(tenant_a, 3), (tenant_b, 5), (tenant_a, 2)] {
            *state.global_used.entry(platform).or_insert(0) += n;
            *state.tenant_used.entry((tenant, platform)).or_insert(0) += n;
        }

        let global = *state.global_used.get(&platform).unwrap();
        let tenant_sum: i64 = state
            .tenant_used
            .iter()
            .filter(|((_, p), _)| *p == platform)
            .map(|(_, used)| used)
            .sum();
        assert_eq!(global, tenant_sum);
        assert_eq!(global, 10);
    }

    /// Invariant 6: on a UTC day rollover, the next `reset_if_new_day` zeroes every
    /// tenant and global counter rather than carrying them into the new day.
    #[test]
    fn reset_if_new_day_clears_counters_on_rollover() {
        let mut state = BudgeterState::new();
        let platform = Platform::CommerceB;
        let tenant = Uuid::new_v4();
        state.global_used.insert(platform, 42);
        state.tenant_used.insert((tenant, platform), 42);
        // Force `day` into the past so reset_if_new_day sees today as a rollover.
        state.day = state.day - chrono::Duration::days(1);

        state.reset_if_new_day();

        assert_eq!(state.global_used.get(&platform), None);
        assert_eq!(state.tenant_used.get(&(tenant, platform)), None);
        assert_eq!(state.day, Utc::now().date_naive());
    }
}
