use std::collections::HashMap;

use crate::server::job::UnixBatchStatus;

/// Queue letter `atq` shows for a job that is currently running.
const EXECUTING_QUEUE: &str = "=";

/// Maps job numbers listed by `atq` to their state.
///
/// A line looks like `12\tThu Mar  6 10:00:00 2014 b alice`; the queue is the next to last field.
/// Lines that do not fit are skipped.
pub fn parse_atq(output: &str) -> HashMap<String, UnixBatchStatus> {
    let mut jobs = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let queue = fields[fields.len() - 2];
        let status = if queue == EXECUTING_QUEUE {
            UnixBatchStatus::Executing
        } else {
            UnixBatchStatus::Queued
        };
        jobs.insert(fields[0].to_string(), status);
    }
    jobs
}

/// State of a job that was not cancelled: whatever `atq` says, and a job `atq` no longer lists
/// has completed.
pub fn derive_status(
    listing: &HashMap<String, UnixBatchStatus>,
    job_id: &str,
) -> UnixBatchStatus {
    listing
        .get(job_id)
        .copied()
        .unwrap_or(UnixBatchStatus::Completed)
}
