use crate::server::job::{JobDetails, PbsStatus};
use crate::server::pbs::nodes::NodeInventory;
use crate::store::Store;

#[derive(Debug, Default, PartialEq)]
pub struct ReconcileSummary {
    pub updated: Vec<String>,
}

/// Brings stored PBS jobs in line with `qstat -x`.
///
/// When qstat knows no jobs at all, every job that is still incomplete is marked complete. Jobs
/// unknown to the store are ignored, and a complete job is never moved back.
pub async fn reconcile_jobs(
    store: &Store,
    nodes: &NodeInventory,
) -> crate::Result<ReconcileSummary> {
    let reported = nodes.qstat(None).await?;
    let mut summary = ReconcileSummary::default();

    if reported.is_empty() {
        for job in store.find_incomplete_jobs()? {
            let updated = store.update_job(&job.id, |job| {
                if let JobDetails::Pbs(pbs) = &mut job.details {
                    if !pbs.status.is_terminal() {
                        log::warn!(
                            "Updating status of job '{}' from '{}' to 'C' as not known to qstat",
                            job.id,
                            pbs.status
                        );
                        pbs.status = PbsStatus::Complete;
                    }
                }
            })?;
            if updated.is_some() {
                summary.updated.push(job.id);
            }
        }
        return Ok(summary);
    }

    for entry in reported {
        let mut changed = false;
        store.update_job(&entry.id, |job| {
            let JobDetails::Pbs(pbs) = &mut job.details else {
                return;
            };
            if pbs.status != entry.status && !pbs.status.is_terminal() {
                log::debug!(
                    "Updating status of job '{}' from '{}' to '{}'",
                    entry.id,
                    pbs.status,
                    entry.status
                );
                pbs.status = entry.status.clone();
                changed = true;
            }
            if pbs.worker_node != entry.worker_node {
                log::debug!(
                    "Updating worker node of job '{}' from '{}' to '{}'",
                    entry.id,
                    pbs.worker_node,
                    entry.worker_node
                );
                pbs.worker_node = entry.worker_node.clone();
                changed = true;
            }
            if pbs.comment != entry.comment {
                log::debug!(
                    "Updating comment of job '{}' from '{}' to '{}'",
                    entry.id,
                    pbs.comment,
                    entry.comment
                );
                pbs.comment = entry.comment.clone();
                changed = true;
            }
        })?;
        if changed {
            summary.updated.push(entry.id);
        }
    }
    Ok(summary)
}
