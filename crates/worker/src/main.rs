#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Eventpass Background Worker
//!
//! Runs the reconciliation loops against the ticket store:
//! - Fast poll of fresh pending tickets (every 5 seconds)
//! - Regular poll of older pending tickets (every 30 seconds)
//! - Grace poll of tickets awaiting cancellation (every 10 seconds)
//! - Stale pending sweep (every 5 minutes)
//! - Grace period finalization (every minute)
//! - Invariant check (daily at 4:00 AM UTC)
//!
//! A job whose previous run is still going skips its tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use eventpass_billing::{InvariantChecker, PollTier, PollingReconciler, TicketingService};
use eventpass_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const FAST_POLL_SCHEDULE: &str = "*/5 * * * * *";
const REGULAR_POLL_SCHEDULE: &str = "*/30 * * * * *";
const GRACE_POLL_SCHEDULE: &str = "*/10 * * * * *";
const STALE_SWEEP_SCHEDULE: &str = "0 */5 * * * *";
const GRACE_FINALIZE_SCHEDULE: &str = "0 * * * * *";
const INVARIANT_CHECK_SCHEDULE: &str = "0 0 4 * * *";

fn tier_schedule(tier: PollTier) -> &'static str {
    match tier {
        PollTier::Fast => FAST_POLL_SCHEDULE,
        PollTier::Regular => REGULAR_POLL_SCHEDULE,
        PollTier::Grace => GRACE_POLL_SCHEDULE,
    }
}

/// At most one run of a job at a time
#[derive(Clone)]
struct RunGuard {
    job: &'static str,
    running: Arc<Mutex<()>>,
}

impl RunGuard {
    fn new(job: &'static str) -> Self {
        Self {
            job,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Run `work` unless a previous run holds the guard; returns whether it ran
    async fn run<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()>,
    {
        let Ok(_running) = self.running.try_lock() else {
            debug!(job = self.job, "Previous run still in progress, skipping tick");
            return false;
        };
        work.await;
        true
    }
}

fn poll_job(polling: Arc<PollingReconciler>, tier: PollTier) -> anyhow::Result<Job> {
    let guard = RunGuard::new(tier.as_str());
    let job = Job::new_async(tier_schedule(tier), move |_uuid, _l| {
        let polling = polling.clone();
        let guard = guard.clone();
        Box::pin(async move {
            guard
                .run(async {
                    match polling.run_tier(tier, OffsetDateTime::now_utc()).await {
                        Ok(summary) if summary.checked > 0 => info!(
                            tier = %tier,
                            checked = summary.checked,
                            confirmed = summary.confirmed,
                            still_pending = summary.still_pending,
                            failed = summary.failed,
                            errors = summary.errors,
                            "Poll tier complete"
                        ),
                        Ok(_) => {}
                        Err(e) => error!(tier = %tier, error = %e, "Poll tier failed"),
                    }
                })
                .await;
        })
    })?;
    Ok(job)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,eventpass_billing=debug")),
        )
        .init();

    info!("Starting Eventpass Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let tickets = TicketingService::from_env(pool.clone())?;
    let scheduler = JobScheduler::new().await?;

    for tier in PollTier::ALL {
        scheduler
            .add(poll_job(tickets.polling.clone(), tier)?)
            .await?;
        info!(tier = %tier, schedule = tier_schedule(tier), "Scheduled: poll tier");
    }

    // Abandoned checkouts release their seat
    let stale_polling = tickets.polling.clone();
    let stale_guard = RunGuard::new("stale_sweep");
    scheduler
        .add(Job::new_async(STALE_SWEEP_SCHEDULE, move |_uuid, _l| {
            let polling = stale_polling.clone();
            let guard = stale_guard.clone();
            Box::pin(async move {
                guard
                    .run(async {
                        match polling.sweep_stale_pending(OffsetDateTime::now_utc()).await {
                            Ok(summary) => info!(
                                examined = summary.examined,
                                cancelled = summary.cancelled,
                                confirmed = summary.confirmed,
                                skipped = summary.skipped,
                                errors = summary.errors,
                                "Stale pending sweep complete"
                            ),
                            Err(e) => error!(error = %e, "Stale pending sweep failed"),
                        }
                    })
                    .await;
            })
        })?)
        .await?;
    info!("Scheduled: Stale pending sweep (every 5 minutes)");

    let grace_polling = tickets.polling.clone();
    let grace_guard = RunGuard::new("grace_finalize");
    scheduler
        .add(Job::new_async(GRACE_FINALIZE_SCHEDULE, move |_uuid, _l| {
            let polling = grace_polling.clone();
            let guard = grace_guard.clone();
            Box::pin(async move {
                guard
                    .run(async {
                        match polling.finalize_grace_periods(OffsetDateTime::now_utc()).await {
                            Ok(summary) if summary.examined > 0 => info!(
                                examined = summary.examined,
                                cancelled = summary.cancelled,
                                skipped = summary.skipped,
                                errors = summary.errors,
                                "Grace period finalization complete"
                            ),
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "Grace period finalization failed"),
                        }
                    })
                    .await;
            })
        })?)
        .await?;
    info!("Scheduled: Grace period finalization (every minute)");

    let checker = Arc::new(InvariantChecker::new(pool));
    scheduler
        .add(Job::new_async(INVARIANT_CHECK_SCHEDULE, move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running ticket invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => info!(
                        checks_run = summary.checks_run,
                        "All ticket invariants hold"
                    ),
                    Ok(summary) => {
                        warn!(
                            checks_failed = summary.checks_failed,
                            violations = summary.violations.len(),
                            "Ticket invariant violations found"
                        );
                        for v in &summary.violations {
                            error!(
                                invariant = %v.invariant,
                                severity = %v.severity,
                                ticket_ids = ?v.ticket_ids,
                                event_id = ?v.event_id,
                                context = %v.context,
                                "{}",
                                v.description
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant check (daily at 4:00 AM UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Eventpass Worker started successfully with 6 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_schedule_parses() {
        for schedule in [
            FAST_POLL_SCHEDULE,
            REGULAR_POLL_SCHEDULE,
            GRACE_POLL_SCHEDULE,
            STALE_SWEEP_SCHEDULE,
            GRACE_FINALIZE_SCHEDULE,
            INVARIANT_CHECK_SCHEDULE,
        ] {
            assert!(
                Job::new_async(schedule, |_uuid, _l| Box::pin(async {})).is_ok(),
                "schedule {schedule} should parse"
            );
        }
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let guard = RunGuard::new("test");
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let first = tokio::spawn({
            let guard = guard.clone();
            async move {
                guard
                    .run(async move {
                        started_tx.send(()).unwrap();
                        release_rx.await.unwrap();
                    })
                    .await
            }
        });
        started_rx.await.unwrap();

        assert!(!guard.run(async {}).await);

        release_tx.send(()).unwrap();
        assert!(first.await.unwrap());
        assert!(guard.run(async {}).await);
    }

    #[test]
    fn test_fast_tier_runs_most_often() {
        assert_eq!(tier_schedule(PollTier::Fast), "*/5 * * * * *");
        assert_eq!(tier_schedule(PollTier::Grace), "*/10 * * * * *");
    }
}
