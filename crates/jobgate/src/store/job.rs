use rusqlite::{OptionalExtension, Row, params};

use super::{Store, from_millis, to_millis};
use crate::common::error::internal_error;
use crate::server::job::{Job, JobDetails, PbsJob, PbsStatus, UnixBatchJob};

const BACKEND_PBS: &str = "pbs";
const BACKEND_UNIX_BATCH: &str = "unix_batch";

const JOB_COLUMNS: &str = "id, backend, username, owner, executable, submitted_at, location, \
                           status, worker_node, comment, cancelled";

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let backend: String = row.get(1)?;
    let location: String = row.get(6)?;
    let details = if backend == BACKEND_PBS {
        let status: Option<String> = row.get(7)?;
        JobDetails::Pbs(PbsJob {
            batch_filename: location,
            status: PbsStatus::from_code(status.as_deref().unwrap_or("Q")),
            worker_node: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            comment: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        })
    } else {
        JobDetails::UnixBatch(UnixBatchJob {
            directory: location,
            cancelled: row.get(10)?,
        })
    };
    Ok(Job {
        id: row.get(0)?,
        username: row.get(2)?,
        owner: row.get(3)?,
        executable: row.get(4)?,
        submitted_at: from_millis(row.get(5)?),
        details,
    })
}

/// Columns that differ between the two backends: (backend, location, status, worker, comment,
/// cancelled).
fn variant_columns(
    job: &Job,
) -> (
    &'static str,
    &str,
    Option<&str>,
    Option<&str>,
    Option<&str>,
    bool,
) {
    match &job.details {
        JobDetails::Pbs(pbs) => (
            BACKEND_PBS,
            pbs.batch_filename.as_str(),
            Some(pbs.status.code()),
            Some(pbs.worker_node.as_str()),
            Some(pbs.comment.as_str()),
            false,
        ),
        JobDetails::UnixBatch(batch) => (
            BACKEND_UNIX_BATCH,
            batch.directory.as_str(),
            None,
            None,
            None,
            batch.cancelled,
        ),
    }
}

impl Store {
    pub fn put_job(&self, job: &Job) -> crate::Result<()> {
        if job.id.is_empty() || job.username.is_empty() {
            return internal_error("Job id and user name must not be empty");
        }
        let (backend, location, status, worker, comment, cancelled) = variant_columns(job);
        let conn = self.connection()?;
        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                job.id,
                backend,
                job.username,
                job.owner,
                job.executable,
                to_millis(job.submitted_at),
                location,
                status,
                worker,
                comment,
                cancelled,
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> crate::Result<Option<Job>> {
        let conn = self.connection()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Jobs of a user, most recently submitted first.
    pub fn find_jobs_by_user(&self, username: &str) -> crate::Result<Vec<Job>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE username = ?1 \
             ORDER BY submitted_at DESC, id DESC"
        ))?;
        let jobs = statement
            .query_map(params![username], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// PBS jobs that have not been seen complete yet.
    pub fn find_incomplete_jobs(&self) -> crate::Result<Vec<Job>> {
        let conn = self.connection()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE backend = ?1 AND status != 'C'"
        ))?;
        let jobs = statement
            .query_map(params![BACKEND_PBS], job_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn remove_job(&self, id: &str) -> crate::Result<bool> {
        let conn = self.connection()?;
        let removed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Read-modify-write of a single job inside one transaction.
    ///
    /// Returns the updated job, or `None` if it does not exist. Nothing is written when `update`
    /// leaves the job unchanged.
    pub fn update_job<F>(&self, id: &str, update: F) -> crate::Result<Option<Job>>
    where
        F: FnOnce(&mut Job),
    {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let Some(original) = tx
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                job_from_row,
            )
            .optional()?
        else {
            return Ok(None);
        };

        let mut job = original.clone();
        update(&mut job);
        if job.id != original.id {
            return internal_error("Job id cannot be changed");
        }
        if job != original {
            let (backend, location, status, worker, comment, cancelled) = variant_columns(&job);
            tx.execute(
                "UPDATE jobs SET backend = ?2, username = ?3, owner = ?4, executable = ?5, \
                 submitted_at = ?6, location = ?7, status = ?8, worker_node = ?9, comment = ?10, \
                 cancelled = ?11 WHERE id = ?1",
                params![
                    job.id,
                    backend,
                    job.username,
                    job.owner,
                    job.executable,
                    to_millis(job.submitted_at),
                    location,
                    status,
                    worker,
                    comment,
                    cancelled,
                ],
            )?;
        }
        tx.commit()?;
        Ok(Some(job))
    }
}
