use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{Plan, PlanStatus, Platform, SyncJob};
use crate::queue::Queue;
use crate::ratelimit::Budgeter;
use crate::worker::WorkerRuntime;

/// Stream family used to look up cadence minutes; everything that isn't explicitly
/// listings/products/customers or payments/fees falls back to the `orders` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFamily {
    Orders,
    Catalog,
    Ledger,
}

impl StreamFamily {
    pub fn from_job_type(job_type: &str) -> Self {
        if job_type.ends_with("_payments") || job_type.ends_with("_fees") {
            StreamFamily::Ledger
        } else if job_type.ends_with("_listings")
            || job_type.ends_with("_products")
            || job_type.ends_with("_customers")
        {
            StreamFamily::Catalog
        } else {
            StreamFamily::Orders
        }
    }
}

/// Minutes between successive runs of the same stream for one tenant (§4.6 table).
pub fn cadence_minutes(plan: Plan, family: StreamFamily) -> i64 {
    match (family, plan) {
        (StreamFamily::Orders, Plan::Free) => 30,
        (StreamFamily::Orders, Plan::Starter) => 15,
        (StreamFamily::Orders, Plan::Growth) => 5,
        (StreamFamily::Orders, Plan::Pro) => 2,
        (StreamFamily::Catalog, Plan::Free) => 60,
        (StreamFamily::Catalog, Plan::Starter) => 30,
        (StreamFamily::Catalog, Plan::Growth) => 30,
        (StreamFamily::Catalog, Plan::Pro) => 15,
        (StreamFamily::Ledger, Plan::Free) => 60,
        (StreamFamily::Ledger, Plan::Starter) => 30,
        (StreamFamily::Ledger, Plan::Growth) => 15,
        (StreamFamily::Ledger, Plan::Pro) => 10,
    }
}

/// 1 for `pro`, else 0.
pub fn recurring_priority(plan: Plan) -> i32 {
    if matches!(plan, Plan::Pro) {
        1
    } else {
        0
    }
}

pub const BACKFILL_PRIORITY: i32 = 5;
pub const INITIAL_SYNC_PRIORITY: i32 = 10;

pub struct Scheduler {
    pool: PgPool,
    queue: Arc<Queue>,
    budgeter: Arc<Budgeter>,
    worker: Arc<WorkerRuntime>,
    stale_minutes: i64,
    batch_size: i64,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        queue: Arc<Queue>,
        budgeter: Arc<Budgeter>,
        worker: Arc<WorkerRuntime>,
        stale_minutes: i64,
        batch_size: i64,
    ) -> Self {
        Self {
            pool,
            queue,
            budgeter,
            worker,
            stale_minutes,
            batch_size,
        }
    }

    pub fn spawn(self: Arc<Self>, tick_secs: u64) {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(tick_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.tick().await {
                    warn!(?err, "scheduler tick failed");
                }
            }
        });
    }

    pub async fn tick(&self) -> anyhow::Result<()> {
        let reaped = self.queue.reap_stale(self.stale_minutes).await?;
        if reaped > 0 {
            info!(reaped, "reaped stale running jobs");
        }

        let now = Utc::now();
        let claimed = self.queue.claim_batch(self.batch_size, now).await?;

        for job in claimed {
            self.admit_and_dispatch(job).await?;
        }

        Ok(())
    }

    async fn admit_and_dispatch(&self, job: SyncJob) -> anyhow::Result<()> {
        let platform_key = job.platform_key().to_string();

        let plan_status = self.lookup_plan_status(job.tenant_id).await?;
        if plan_status != PlanStatus::Active {
            self.queue
                .transition_failed(job.id, "User plan inactive or past_due")
                .await?;
            return Ok(());
        }

        if let Some(platform) = Platform::from_job_prefix(&platform_key) {
            if !self.budgeter.can_request(job.tenant_id, platform).await {
                let remaining = self.budgeter.remaining(job.tenant_id, platform).await;
                let snapshot = self.budgeter.snapshot(platform).await;
                warn!(
                    tenant_id = %job.tenant_id,
                    platform = platform.as_job_prefix(),
                    remaining,
                    global_used = snapshot.global_used,
                    quota = snapshot.platform_daily_quota,
                    "rate gate denied admission; deferring job"
                );
                self.queue.requeue_later(job.id, 5).await?;
                return Ok(());
            }
        }
        // Backfill pseudo-platform: no rate gate here; the backfill worker itself
        // rate-checks against each real upstream per §4.6.

        let worker = self.worker.clone();
        let job_id = job.id;
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(err) = worker.run(job).await {
                warn!(?err, job_id = %job_id, "worker run failed to dispatch");
                let _ = queue.transition_failed(job_id, &err.to_string()).await;
            }
        });

        Ok(())
    }

    async fn lookup_plan_status(&self, tenant_id: Uuid) -> anyhow::Result<PlanStatus> {
        let status: PlanStatus =
            sqlx::query_scalar("SELECT plan_status FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cadence_table_matches_spec() {
        assert_eq!(cadence_minutes(Plan::Free, StreamFamily::Orders), 30);
        assert_eq!(cadence_minutes(Plan::Starter, StreamFamily::Orders), 15);
        assert_eq!(cadence_minutes(Plan::Growth, StreamFamily::Orders), 5);
        assert_eq!(cadence_minutes(Plan::Pro, StreamFamily::Orders), 2);
        assert_eq!(cadence_minutes(Plan::Free, StreamFamily::Catalog), 60);
        assert_eq!(cadence_minutes(Plan::Pro, StreamFamily::Catalog), 15);
        assert_eq!(cadence_minutes(Plan::Growth, StreamFamily::Ledger), 15);
        assert_eq!(cadence_minutes(Plan::Pro, StreamFamily::Ledger), 10);
    }

    #[test]
    fn recurring_priority_is_one_for_pro_else_zero() {
        assert_eq!(recurring_priority(Plan::Pro), 1);
        assert_eq!(recurring_priority(Plan::Free), 0);
        assert_eq!(recurring_priority(Plan::Starter), 0);
        assert_eq!(recurring_priority(Plan::Growth), 0);
    }

    #[test]
    fn stream_family_classifies_job_type_suffix() {
        assert_eq!(
            StreamFamily::from_job_type("commerce-A_orders"),
            StreamFamily::Orders
        );
        assert_eq!(
            StreamFamily::from_job_type("commerce-B_products"),
            StreamFamily::Catalog
        );
        assert_eq!(
            StreamFamily::from_job_type("commerce-A_payments"),
            StreamFamily::Ledger
        );
        assert_eq!(
            StreamFamily::from_job_type("backfill_commerce-A"),
            StreamFamily::Orders
        );
    }

    #[test]
    fn platform_key_is_first_underscore_token() {
        let job = SyncJob {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            job_type: "commerce-A_orders".to_string(),
            status: crate::models::JobStatus::Queued,
            priority: 0,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            records_processed: None,
            metadata: serde_json::json!({}),
        };
        assert_eq!(job.platform_key(), "commerce-A");

        let backfill = SyncJob {
            job_type: "backfill_commerce-A".to_string(),
            ..job
        };
        assert_eq!(backfill.platform_key(), "backfill");
    }
}
