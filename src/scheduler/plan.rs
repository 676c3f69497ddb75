use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::scheduler::job::{Job, JobExecuteInfo, JobSchedulePlan};
use crate::scheduler::PlanEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Identical definition already planned; next fire time untouched.
    Unchanged,
}

/// The scheduler's job table, keyed by job name.
#[derive(Debug, Default)]
pub struct SchedulePlan {
    plans: HashMap<String, JobSchedulePlan>,
}

impl SchedulePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a job. An invalid cron expression removes any
    /// previous plan for the name and returns the parse error.
    pub fn upsert(&mut self, job: Job, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        if let Some(existing) = self.plans.get(&job.name) {
            if existing.job == job {
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let name = job.name.clone();
        match JobSchedulePlan::new(job, now) {
            Ok(plan) => match self.plans.insert(name, plan) {
                Some(_) => Ok(UpsertOutcome::Updated),
                None => Ok(UpsertOutcome::Inserted),
            },
            Err(e) => {
                self.plans.remove(&name);
                Err(e)
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<JobSchedulePlan> {
        self.plans.remove(name)
    }

    /// Drop every plan whose name is not in `keep`.
    pub fn retain_names(&mut self, keep: &[&str]) -> Vec<String> {
        let removed: Vec<String> = self
            .plans
            .keys()
            .filter(|name| !keep.contains(&name.as_str()))
            .cloned()
            .collect();
        for name in &removed {
            self.plans.remove(name);
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<&JobSchedulePlan> {
        self.plans.get(name)
    }

    /// Collect every due job with its planned fire time and advance each
    /// of them past `now`.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<(Job, DateTime<Utc>)> {
        let mut due = Vec::new();
        for plan in self.plans.values_mut() {
            if let Some(plan_time) = plan.next_time.filter(|t| *t <= now) {
                due.push((plan.job.clone(), plan_time));
                plan.advance(now);
            }
        }
        due.sort_by_key(|(_, t)| *t);
        due
    }

    /// Earliest upcoming fire time across all plans.
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.plans.values().filter_map(|p| p.next_time).min()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plans.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every plan as a snapshot row, sorted by job name.
    pub fn entries(&self) -> Vec<PlanEntry> {
        let mut entries: Vec<PlanEntry> = self
            .plans
            .values()
            .map(|p| PlanEntry {
                job: p.job.clone(),
                next_time: p.next_time,
            })
            .collect();
        entries.sort_by(|a, b| a.job.name.cmp(&b.job.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// In-flight executions on this worker; at most one per job name.
#[derive(Debug, Default)]
pub struct ExecutingTable {
    records: HashMap<String, JobExecuteInfo>,
}

impl ExecutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new execution. Returns false, leaving the table untouched,
    /// if the job is already in flight.
    pub fn try_begin(&mut self, info: &JobExecuteInfo) -> bool {
        if self.records.contains_key(&info.job.name) {
            return false;
        }
        self.records.insert(info.job.name.clone(), info.clone());
        true
    }

    /// Signal cancellation to an in-flight execution. The record stays
    /// until its result arrives.
    pub fn cancel(&self, name: &str) -> bool {
        match self.records.get(name) {
            Some(info) => {
                info.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish(&mut self, name: &str) -> Option<JobExecuteInfo> {
        self.records.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.keys().cloned().collect();
        names.sort();
        names
    }

    /// Cancel everything still running; used on shutdown.
    pub fn cancel_all(&self) {
        for info in self.records.values() {
            info.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
