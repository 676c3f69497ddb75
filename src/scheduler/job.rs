use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};

/// A job definition as stored under `/cron/jobs/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub command: String,
    #[serde(rename = "cronExpr")]
    pub cron_expr: String,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        cron_expr: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cron_expr: cron_expr.into(),
        }
    }

    /// Parse the cron expression (6 or 7 fields, seconds first).
    pub fn schedule(&self) -> Result<Schedule> {
        Schedule::from_str(self.cron_expr.trim()).map_err(|e| CronError::InvalidCronExpr {
            job: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Reject definitions that could never be scheduled.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CronError::InvalidJob("job name is empty".to_string()));
        }
        if self.name.contains('/') {
            return Err(CronError::InvalidJob(format!(
                "job name must not contain '/': {}",
                self.name
            )));
        }
        if self.command.trim().is_empty() {
            return Err(CronError::InvalidJob(format!(
                "job {} has an empty command",
                self.name
            )));
        }
        self.schedule().map(|_| ())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Changes delivered to the scheduler by the job watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Save(Job),
    Delete(String),
    Kill(String),
}

impl JobEvent {
    pub fn job_name(&self) -> &str {
        match self {
            JobEvent::Save(job) => &job.name,
            JobEvent::Delete(name) | JobEvent::Kill(name) => name,
        }
    }
}

/// Scheduling state for one job: its parsed expression and next fire time.
#[derive(Debug, Clone)]
pub struct JobSchedulePlan {
    pub job: Job,
    schedule: Schedule,
    pub next_time: Option<DateTime<Utc>>,
}

impl JobSchedulePlan {
    pub fn new(job: Job, now: DateTime<Utc>) -> Result<Self> {
        let schedule = job.schedule()?;
        let next_time = schedule.after(&now).next();
        Ok(Self {
            job,
            schedule,
            next_time,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_time.is_some_and(|t| t <= now)
    }

    /// Move the next fire time strictly after `now`. A plan that fell
    /// behind skips the missed fires rather than queueing them.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.next_time = self.schedule.after(&now).next();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    Cancelled,
    /// Another worker holds the job lock for this tick.
    Skipped,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
            ExecutionStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Snapshot handed from the scheduler to the executor at dispatch time.
#[derive(Debug, Clone)]
pub struct JobExecuteInfo {
    pub job: Job,
    /// Fire time the plan asked for.
    pub plan_time: DateTime<Utc>,
    /// Time the scheduler actually dispatched.
    pub real_time: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl JobExecuteInfo {
    pub fn new(job: Job, plan_time: DateTime<Utc>, real_time: DateTime<Utc>) -> Self {
        Self {
            job,
            plan_time,
            real_time,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobExecuteResult {
    pub info: JobExecuteInfo,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl JobExecuteResult {
    pub fn job_name(&self) -> &str {
        &self.info.job.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn job_json_uses_cron_expr_key() {
        let job = Job::new("job1", "echo hello", "*/5 * * * * *");
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["name"], "job1");
        assert_eq!(json["command"], "echo hello");
        assert_eq!(json["cronExpr"], "*/5 * * * * *");

        let back = Job::from_bytes(&job.to_bytes().unwrap()).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn validate_rejects_bad_definitions() {
        assert!(Job::new("ok", "true", "* * * * * *").validate().is_ok());
        assert!(Job::new("ok", "true", "0 0 12 * * * 2099").validate().is_ok());
        assert!(matches!(
            Job::new("", "true", "* * * * * *").validate(),
            Err(CronError::InvalidJob(_))
        ));
        assert!(matches!(
            Job::new("a/b", "true", "* * * * * *").validate(),
            Err(CronError::InvalidJob(_))
        ));
        assert!(matches!(
            Job::new("x", "   ", "* * * * * *").validate(),
            Err(CronError::InvalidJob(_))
        ));
        assert!(matches!(
            Job::new("x", "true", "not a cron").validate(),
            Err(CronError::InvalidCronExpr { .. })
        ));
    }

    #[test]
    fn plan_computes_next_fire_after_now() {
        let plan = JobSchedulePlan::new(Job::new("j", "true", "0 */5 * * * *"), at(10, 2, 30))
            .unwrap();
        assert_eq!(plan.next_time, Some(at(10, 5, 0)));
        assert!(!plan.is_due(at(10, 4, 59)));
        assert!(plan.is_due(at(10, 5, 0)));
    }

    #[test]
    fn advance_skips_missed_fires() {
        let mut plan =
            JobSchedulePlan::new(Job::new("j", "true", "* * * * * *"), at(10, 0, 0)).unwrap();
        assert_eq!(plan.next_time, Some(at(10, 0, 1)));

        // The loop was stalled for a minute: one fire, then forward from now
        plan.advance(at(10, 1, 0));
        assert_eq!(plan.next_time, Some(at(10, 1, 1)));
    }

    #[test]
    fn plan_without_upcoming_fire_is_never_due() {
        let plan =
            JobSchedulePlan::new(Job::new("j", "true", "0 0 0 1 1 * 2020"), at(10, 0, 0)).unwrap();
        assert!(plan.next_time.is_none());
        assert!(!plan.is_due(at(23, 59, 59)));
    }

    #[test]
    fn job_event_name() {
        assert_eq!(JobEvent::Save(Job::new("a", "true", "* * * * * *")).job_name(), "a");
        assert_eq!(JobEvent::Delete("b".into()).job_name(), "b");
        assert_eq!(JobEvent::Kill("c".into()).job_name(), "c");
    }

    #[test]
    fn execution_status_display() {
        assert_eq!(ExecutionStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(ExecutionStatus::Skipped.to_string(), "skipped");
    }
}
