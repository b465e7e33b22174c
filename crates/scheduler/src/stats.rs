//! Dashboard aggregates. Pure functions over loaded jobs and batches.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::types::{
    BatchConfig, CategoryStats, Job, JobStatus, ScriptRef, SchedulerStats, ratio,
};

/// Totals, per-category breakdown and overall error rate. Empty input
/// yields zeroed stats.
#[must_use]
pub fn compute(jobs: &[Job], batches: &[BatchConfig]) -> SchedulerStats {
    let by_name: HashMap<&str, &Job> = jobs.iter().map(|j| (j.name.as_str(), j)).collect();

    let total_runs: u64 = jobs.iter().map(|j| j.run_count).sum();
    let total_errors: u64 = jobs.iter().map(|j| j.error_count).sum();

    let mut members: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    let mut categories: BTreeMap<String, CategoryStats> = BTreeMap::new();
    for batch in batches {
        let category = batch.category_or_default().to_string();
        let entry = categories.entry(category.clone()).or_default();
        entry.batches += 1;
        if batch.enabled {
            entry.enabled_batches += 1;
        }
        members
            .entry(category)
            .or_default()
            .extend(batch.scripts.iter().map(ScriptRef::job_name));
    }

    for (category, names) in members {
        let Some(entry) = categories.get_mut(&category) else {
            continue;
        };
        entry.jobs = names.len();
        for job in names.iter().filter_map(|n| by_name.get(n)) {
            entry.runs += job.run_count;
            entry.errors += job.error_count;
        }
        entry.error_rate = ratio(entry.errors, entry.runs);
    }

    SchedulerStats {
        total_jobs: jobs.len(),
        enabled_jobs: jobs.iter().filter(|j| j.enabled).count(),
        requested_jobs: jobs
            .iter()
            .filter(|j| j.status == JobStatus::Requested)
            .count(),
        running_jobs: jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .count(),
        total_batches: batches.len(),
        enabled_batches: batches.iter().filter(|b| b.enabled).count(),
        total_runs,
        total_errors,
        error_rate: ratio(total_errors, total_runs),
        categories,
    }
}
