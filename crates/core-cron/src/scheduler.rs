//! The cron schedule set, tick loop, and retrying dispatcher. Composes the
//! expression evaluator with an externally supplied [`FunctionInvoker`] so the
//! scheduler never depends on how a function is actually executed.

use crate::expr::CronExpr;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use core_common::ids::{ExecutionId, FunctionId, ScheduleId};
use core_common::ids::OwnerId;
use core_common::retry::{with_retries, RetryConfig};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

const HISTORY_CAP: usize = 100;
const RECENT_WINDOW_FOR_DISABLE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ScheduleStatus {
    Active,
    Paused,
    Disabled,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    fn is_success(self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: ScheduleId,
    pub function_id: FunctionId,
    pub name: String,
    pub expr: CronExpr,
    pub timezone: Tz,
    pub status: ScheduleStatus,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub owner: OwnerId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub id: ExecutionId,
    pub schedule_id: ScheduleId,
    pub function_id: FunctionId,
    pub status: ExecutionStatus,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub exit_code: Option<i32>,
    pub attempt: u32,
    pub max_attempts: u32,
}

pub struct NewSchedule {
    pub function_id: FunctionId,
    pub name: String,
    pub cron_expression: String,
    pub timezone: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub output: String,
    pub exit_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("invocation failed: {0}")]
    Failed(String),
}

/// The decoupling seam between the scheduler and the worker supervisor: the scheduler
/// is constructed with one of these and never knows how invocation actually happens.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(&self, function_id: FunctionId, event: serde_json::Value) -> Result<InvokeOutcome, InvokeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("schedule not found")]
    NotFound,
    #[error("not authorized")]
    NotAuthorized,
    #[error("invalid cron expression: {0}")]
    InvalidExpression(#[from] crate::expr::CronError),
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

impl core_common::error::Classify for SchedulerError {
    fn kind(&self) -> core_common::error::ErrorKind {
        match self {
            SchedulerError::NotFound => core_common::error::ErrorKind::NotFound,
            SchedulerError::NotAuthorized => core_common::error::ErrorKind::NotAuthorized,
            SchedulerError::InvalidExpression(_) | SchedulerError::InvalidTimezone(_) => {
                core_common::error::ErrorKind::IllegalState
            }
        }
    }
}

#[derive(Clone)]
pub struct CronScheduler {
    schedules: Arc<DashMap<ScheduleId, Schedule>>,
    executions: Arc<DashMap<ExecutionId, Execution>>,
    history: Arc<DashMap<ScheduleId, VecDeque<ExecutionId>>>,
    invoker: Arc<dyn FunctionInvoker>,
}

impl CronScheduler {
    pub fn new(invoker: Arc<dyn FunctionInvoker>) -> Self {
        Self {
            schedules: Arc::new(DashMap::new()),
            executions: Arc::new(DashMap::new()),
            history: Arc::new(DashMap::new()),
            invoker,
        }
    }

    #[instrument(skip(self, params))]
    pub fn create_schedule(
        &self,
        owner: OwnerId,
        params: NewSchedule,
    ) -> Result<Schedule, SchedulerError> {
        let expr = CronExpr::parse(&params.cron_expression)?;
        let tz = Tz::from_str(&params.timezone)
            .map_err(|_| SchedulerError::InvalidTimezone(params.timezone.clone()))?;
        let now = Utc::now();
        let next_run_at = expr.next_run_time(now, tz)?;

        let schedule = Schedule {
            id: ScheduleId::new(),
            function_id: params.function_id,
            name: params.name,
            expr,
            timezone: tz,
            status: ScheduleStatus::Active,
            timeout: params.timeout,
            max_retries: params.max_retries,
            retry_delay: params.retry_delay,
            owner,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: Some(next_run_at),
            total_runs: 0,
            successful_runs: 0,
            failed_runs: 0,
        };
        self.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    pub fn get(&self, id: ScheduleId) -> Option<Schedule> {
        self.schedules.get(&id).map(|e| e.clone())
    }

    fn check_owner(&self, id: ScheduleId, owner: &OwnerId) -> Result<(), SchedulerError> {
        let schedule = self.schedules.get(&id).ok_or(SchedulerError::NotFound)?;
        if &schedule.owner != owner {
            return Err(SchedulerError::NotAuthorized);
        }
        Ok(())
    }

    pub fn pause(&self, id: ScheduleId, owner: &OwnerId) -> Result<(), SchedulerError> {
        self.check_owner(id, owner)?;
        let mut schedule = self.schedules.get_mut(&id).ok_or(SchedulerError::NotFound)?;
        schedule.status = ScheduleStatus::Paused;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    pub fn resume(&self, id: ScheduleId, owner: &OwnerId) -> Result<(), SchedulerError> {
        self.check_owner(id, owner)?;
        let mut schedule = self.schedules.get_mut(&id).ok_or(SchedulerError::NotFound)?;
        let now = Utc::now();
        schedule.next_run_at = Some(schedule.expr.next_run_time(now, schedule.timezone)?);
        schedule.status = ScheduleStatus::Active;
        schedule.updated_at = now;
        Ok(())
    }

    pub fn delete(&self, id: ScheduleId, owner: &OwnerId) -> Result<(), SchedulerError> {
        self.check_owner(id, owner)?;
        self.schedules.remove(&id);
        if let Some((_, ids)) = self.history.remove(&id) {
            for execution_id in ids {
                self.executions.remove(&execution_id);
            }
        }
        Ok(())
    }

    /// One minute-granular heartbeat: submits `execute_schedule` for every active
    /// schedule whose `nextRunAt <= now`, without awaiting completion. Fires once per
    /// tick per due schedule — a delayed tick that skips several fire windows does
    /// not backfill or coalesce them.
    #[instrument(skip(self))]
    pub fn tick(&self, now: DateTime<Utc>) {
        let due: Vec<ScheduleId> = self
            .schedules
            .iter()
            .filter(|entry| {
                entry.status == ScheduleStatus::Active
                    && entry.next_run_at.is_some_and(|t| t <= now)
            })
            .map(|entry| *entry.key())
            .collect();

        for schedule_id in due {
            let this = self.clone();
            tokio::spawn(async move {
                this.execute_schedule(schedule_id).await;
            });
        }
    }

    /// Bypasses `nextRunAt` and runs the schedule immediately, still owner-gated.
    pub async fn trigger_manually(
        &self,
        id: ScheduleId,
        owner: &OwnerId,
    ) -> Result<(), SchedulerError> {
        self.check_owner(id, owner)?;
        self.execute_schedule(id).await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn execute_schedule(&self, schedule_id: ScheduleId) {
        let Some(schedule) = self.get(schedule_id) else {
            warn!("schedule disappeared before execution started");
            return;
        };

        let max_attempts = schedule.max_retries + 1;
        let execution_id = ExecutionId::new();
        let execution = Execution {
            id: execution_id,
            schedule_id,
            function_id: schedule.function_id,
            status: ExecutionStatus::Pending,
            scheduled_at: Utc::now(),
            started_at: None,
            ended_at: None,
            output: None,
            exit_code: None,
            attempt: 0,
            max_attempts,
        };
        self.executions.insert(execution_id, execution);
        self.push_history(schedule_id, execution_id);

        // A fixed retry_delay per schedule, not an exponentially growing one, so the
        // backoff multiplier is pinned at 1.0.
        let retry_config = RetryConfig {
            max_attempts,
            min_delay: schedule.retry_delay,
            multiplier: 1.0,
        };

        let result = with_retries(&retry_config, |_err: &()| true, |attempt_no| {
            let this = self.clone();
            let schedule = schedule.clone();
            async move {
                if let Some(mut exec) = this.executions.get_mut(&execution_id) {
                    exec.attempt = attempt_no + 1;
                    exec.status = ExecutionStatus::Running;
                    exec.started_at = Some(Utc::now());
                }

                let outcome = tokio::time::timeout(
                    schedule.timeout,
                    this.invoker.invoke(schedule.function_id, serde_json::json!({})),
                )
                .await;

                match outcome {
                    Ok(Ok(invoke_outcome)) => {
                        if let Some(mut exec) = this.executions.get_mut(&execution_id) {
                            exec.output = Some(invoke_outcome.output.clone());
                            exec.exit_code = Some(invoke_outcome.exit_code);
                            exec.status = ExecutionStatus::Success;
                            exec.ended_at = Some(Utc::now());
                        }
                        Ok(invoke_outcome)
                    }
                    Ok(Err(invoke_error)) => {
                        if let Some(mut exec) = this.executions.get_mut(&execution_id) {
                            exec.output = Some(invoke_error.to_string());
                            exec.status = ExecutionStatus::Failed;
                        }
                        Err(())
                    }
                    Err(_elapsed) => {
                        if let Some(mut exec) = this.executions.get_mut(&execution_id) {
                            exec.status = ExecutionStatus::Timeout;
                        }
                        Err(())
                    }
                }
            }
        })
        .await;

        if let Some(mut exec) = self.executions.get_mut(&execution_id) {
            exec.ended_at = Some(Utc::now());
        }
        let final_status = self
            .executions
            .get(&execution_id)
            .map(|e| e.status)
            .unwrap_or(ExecutionStatus::Failed);
        let _ = result;
        self.finish_execution(schedule_id, final_status.is_success());
    }

    fn push_history(&self, schedule_id: ScheduleId, execution_id: ExecutionId) {
        let mut history = self.history.entry(schedule_id).or_default();
        history.push_back(execution_id);
        if history.len() > HISTORY_CAP {
            if let Some(dropped) = history.pop_front() {
                self.executions.remove(&dropped);
            }
        }
    }

    fn finish_execution(&self, schedule_id: ScheduleId, success: bool) {
        let Some(mut schedule) = self.schedules.get_mut(&schedule_id) else {
            return;
        };
        let now = Utc::now();
        schedule.last_run_at = Some(now);
        schedule.total_runs += 1;
        if success {
            schedule.successful_runs += 1;
        } else {
            schedule.failed_runs += 1;
        }

        let recent_all_failed = self
            .history
            .get(&schedule_id)
            .map(|ids| {
                let recent: Vec<ExecutionId> = ids
                    .iter()
                    .rev()
                    .take(RECENT_WINDOW_FOR_DISABLE)
                    .copied()
                    .collect();
                recent.len() == RECENT_WINDOW_FOR_DISABLE
                    && recent.iter().all(|id| {
                        self.executions
                            .get(id)
                            .map(|e| !e.status.is_success())
                            .unwrap_or(false)
                    })
            })
            .unwrap_or(false);

        if recent_all_failed {
            error!(%schedule_id, "last 5 executions were all non-success, auto-disabling schedule");
            schedule.status = ScheduleStatus::Error;
            schedule.next_run_at = None;
        } else {
            match schedule.expr.next_run_time(now, schedule.timezone) {
                Ok(next) => schedule.next_run_at = Some(next),
                Err(err) => {
                    error!(%schedule_id, %err, "could not compute next run time, disabling schedule");
                    schedule.status = ScheduleStatus::Error;
                    schedule.next_run_at = None;
                }
            }
        }
        schedule.updated_at = now;
        info!(%schedule_id, total = schedule.total_runs, successful = schedule.successful_runs, "execution finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AlwaysSucceeds;

    #[async_trait]
    impl FunctionInvoker for AlwaysSucceeds {
        async fn invoke(&self, _f: FunctionId, _e: serde_json::Value) -> Result<InvokeOutcome, InvokeError> {
            Ok(InvokeOutcome {
                output: "ok".to_string(),
                exit_code: 0,
            })
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl FunctionInvoker for AlwaysFails {
        async fn invoke(&self, _f: FunctionId, _e: serde_json::Value) -> Result<InvokeOutcome, InvokeError> {
            Err(InvokeError::Failed("boom".to_string()))
        }
    }

    struct CountingInvoker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FunctionInvoker for CountingInvoker {
        async fn invoke(&self, _f: FunctionId, _e: serde_json::Value) -> Result<InvokeOutcome, InvokeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(InvokeError::Failed("boom".to_string()))
        }
    }

    fn owner() -> OwnerId {
        OwnerId("tenant-1".to_string())
    }

    #[tokio::test]
    async fn cron_fire_scenario() {
        let scheduler = CronScheduler::new(Arc::new(AlwaysSucceeds));
        let schedule = scheduler
            .create_schedule(
                owner(),
                NewSchedule {
                    function_id: FunctionId::new(),
                    name: "every-minute".to_string(),
                    cron_expression: "*/1 * * * *".to_string(),
                    timezone: "UTC".to_string(),
                    timeout: Duration::from_secs(5),
                    max_retries: 0,
                    retry_delay: Duration::from_millis(10),
                },
            )
            .unwrap();

        scheduler.trigger_manually(schedule.id, &owner()).await.unwrap();
        // execute_schedule is spawned via tick() normally; trigger_manually awaits it
        // directly so no extra synchronization is needed here.

        let updated = scheduler.get(schedule.id).unwrap();
        assert_eq!(updated.total_runs, 1);
        assert_eq!(updated.successful_runs, 1);
    }

    #[tokio::test]
    async fn cron_retry_then_fail_scenario() {
        let invoker = Arc::new(CountingInvoker {
            calls: AtomicUsize::new(0),
        });
        let scheduler = CronScheduler::new(invoker.clone());
        let schedule = scheduler
            .create_schedule(
                owner(),
                NewSchedule {
                    function_id: FunctionId::new(),
                    name: "flaky".to_string(),
                    cron_expression: "* * * * *".to_string(),
                    timezone: "UTC".to_string(),
                    timeout: Duration::from_millis(100),
                    max_retries: 2,
                    retry_delay: Duration::from_millis(10),
                },
            )
            .unwrap();

        scheduler.trigger_manually(schedule.id, &owner()).await.unwrap();

        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);
        let updated = scheduler.get(schedule.id).unwrap();
        assert_eq!(updated.failed_runs, 1);

        for _ in 0..4 {
            scheduler.trigger_manually(schedule.id, &owner()).await.unwrap();
        }
        let updated = scheduler.get(schedule.id).unwrap();
        assert_eq!(updated.status, ScheduleStatus::Error);
    }

    #[tokio::test]
    async fn pause_removes_schedule_from_ticks() {
        let scheduler = CronScheduler::new(Arc::new(AlwaysSucceeds));
        let schedule = scheduler
            .create_schedule(
                owner(),
                NewSchedule {
                    function_id: FunctionId::new(),
                    name: "paused".to_string(),
                    cron_expression: "* * * * *".to_string(),
                    timezone: "UTC".to_string(),
                    timeout: Duration::from_secs(1),
                    max_retries: 0,
                    retry_delay: Duration::from_millis(1),
                },
            )
            .unwrap();
        scheduler.pause(schedule.id, &owner()).unwrap();
        let updated = scheduler.get(schedule.id).unwrap();
        assert_eq!(updated.status, ScheduleStatus::Paused);

        // a tick right now must not fire it even though next_run_at may be in the past
        scheduler.tick(Utc::now() + chrono::Duration::days(3650));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let updated = scheduler.get(schedule.id).unwrap();
        assert_eq!(updated.total_runs, 0);
    }

    #[tokio::test]
    async fn owner_mismatch_is_rejected() {
        let scheduler = CronScheduler::new(Arc::new(AlwaysSucceeds));
        let schedule = scheduler
            .create_schedule(
                owner(),
                NewSchedule {
                    function_id: FunctionId::new(),
                    name: "s".to_string(),
                    cron_expression: "* * * * *".to_string(),
                    timezone: "UTC".to_string(),
                    timeout: Duration::from_secs(1),
                    max_retries: 0,
                    retry_delay: Duration::from_millis(1),
                },
            )
            .unwrap();

        let other = OwnerId("someone-else".to_string());
        let result = scheduler.pause(schedule.id, &other);
        assert!(matches!(result, Err(SchedulerError::NotAuthorized)));
    }
}
