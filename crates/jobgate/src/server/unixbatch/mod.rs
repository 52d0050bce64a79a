//! Backend built on the `at`/`batch` daemon of the gateway host. Jobs run as a random member of a
//! family and write their output into a private directory under `job_output_dir`.

pub mod atq;

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;
use rand::seq::IndexedRandom;
use regex::Regex;
use serde::Serialize;

use crate::common::config::UnixBatchConfig;
use crate::common::error::{GatewayError, internal_error, parameter_error};
use crate::common::script::{BatchScript, STDERR_FILE, STDOUT_FILE, create_unique_dir};
use crate::common::shell::{ExecutorRef, ShellCommand};
use crate::server::job::{Job, JobDetails, JobId, OutputKind, UnixBatchJob, UnixBatchStatus};
use crate::server::unixbatch::atq::{derive_status, parse_atq};
use crate::store::StoreRef;

/// `batch` reports `job <N> at <date>` on stderr.
static JOB_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s).*job (\d+) .*").expect("job id pattern is valid"));

#[derive(Serialize, Debug, PartialEq)]
pub struct JobStatusEntry {
    #[serde(rename = "JobId")]
    pub job_id: JobId,
    #[serde(rename = "Status")]
    pub status: UnixBatchStatus,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct SingleStatus {
    #[serde(rename = "Status")]
    pub status: UnixBatchStatus,
}

pub struct UnixBatchBackend {
    config: UnixBatchConfig,
    store: StoreRef,
    executor: ExecutorRef,
}

impl UnixBatchBackend {
    pub fn new(config: UnixBatchConfig, store: StoreRef, executor: ExecutorRef) -> Self {
        Self {
            config,
            store,
            executor,
        }
    }

    pub fn default_family(&self) -> Option<&str> {
        self.config.default_family()
    }

    fn pick_owner(&self, family: Option<&str>) -> crate::Result<String> {
        let name = match family.filter(|f| !f.is_empty()) {
            Some(name) => name,
            None => match self.config.default_family() {
                Some(name) => name,
                None => return parameter_error("No family was specified"),
            },
        };
        let Some(family) = self.config.family(name) else {
            return parameter_error(format!("Family {name} is not recognised"));
        };
        match family.members.choose(&mut rand::rng()) {
            Some(member) => Ok(member.clone()),
            None => internal_error(format!("Family {name} has no members")),
        }
    }

    /// Enqueues the executable with `batch` as a member of `family` and records the job.
    pub async fn submit_batch(
        &self,
        username: &str,
        executable: &str,
        args: &[String],
        family: Option<&str>,
    ) -> crate::Result<JobId> {
        let owner = self.pick_owner(family)?;
        let directory = create_unique_dir(&self.config.job_output_dir)?;
        let job_dir = self.config.job_output_dir.join(&directory);

        match self.enqueue(&owner, &job_dir, executable, args).await {
            Ok(job_id) => {
                let job = Job {
                    id: job_id.clone(),
                    username: username.to_string(),
                    owner: owner.clone(),
                    executable: executable.to_string(),
                    submitted_at: Utc::now(),
                    details: JobDetails::UnixBatch(UnixBatchJob {
                        directory,
                        cancelled: false,
                    }),
                };
                self.store.blocking(move |store| store.put_job(&job)).await?;
                log::info!("Job {job_id} running {executable} submitted for {username} as {owner}");
                Ok(job_id)
            }
            Err(error) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&job_dir).await {
                    log::warn!("Cannot remove {}: {cleanup}", job_dir.display());
                }
                Err(error)
            }
        }
    }

    async fn enqueue(
        &self,
        owner: &str,
        job_dir: &Path,
        executable: &str,
        args: &[String],
    ) -> crate::Result<JobId> {
        let dir_arg = job_dir.to_string_lossy().to_string();
        let acl = format!("user:{owner}:rwx");
        self.executor
            .execute(ShellCommand::new(["setfacl", "-m", acl.as_str(), dir_arg.as_str()]))
            .await
            .check("setfacl")?;

        let script = BatchScript::new(executable, args)
            .with_output_dir(job_dir)
            .render();
        let output = self
            .executor
            .execute(
                ShellCommand::new(["sudo", "-u", owner, "batch"])
                    .cwd(home_dir(owner))
                    .stdin(script.into_bytes()),
            )
            .await;
        let stderr = output.stderr_str();
        if output.is_error() {
            return internal_error(format!(
                "Unable to submit job via batch: {}",
                stderr.trim()
            ));
        }
        match JOB_ID_PATTERN.captures(&stderr).and_then(|c| c.get(1)) {
            Some(id) => Ok(id.as_str().to_string()),
            None => internal_error(format!(
                "Unable to find job id in batch output: {}",
                stderr.trim()
            )),
        }
    }

    async fn queue_of(&self, owner: &str) -> crate::Result<HashMap<String, UnixBatchStatus>> {
        let output = self
            .executor
            .execute(ShellCommand::new(["sudo", "-u", owner, "atq"]))
            .await
            .check("atq")?;
        Ok(parse_atq(&output.stdout_str()))
    }

    pub async fn status(&self, job: &Job) -> crate::Result<UnixBatchStatus> {
        let details = unix_batch_details(job)?;
        if details.cancelled {
            return Ok(UnixBatchStatus::Cancelled);
        }
        let listing = self.queue_of(&job.owner).await?;
        Ok(derive_status(&listing, &job.id))
    }

    /// Status of every given job, querying `atq` once per owner.
    pub async fn list(&self, jobs: &[Job]) -> crate::Result<Vec<JobStatusEntry>> {
        let mut listings: HashMap<&str, HashMap<String, UnixBatchStatus>> = HashMap::new();
        let mut entries = Vec::with_capacity(jobs.len());
        for job in jobs {
            let Some(details) = job.unix_batch() else {
                continue;
            };
            let status = if details.cancelled {
                UnixBatchStatus::Cancelled
            } else {
                if !listings.contains_key(job.owner.as_str()) {
                    let listing = self.queue_of(&job.owner).await?;
                    listings.insert(job.owner.as_str(), listing);
                }
                match listings.get(job.owner.as_str()) {
                    Some(listing) => derive_status(listing, &job.id),
                    None => UnixBatchStatus::Completed,
                }
            };
            entries.push(JobStatusEntry {
                job_id: job.id.clone(),
                status,
            });
        }
        Ok(entries)
    }

    /// Removes the job from the `at` queue, killing the owner's processes when it already runs,
    /// and flags it as cancelled.
    pub async fn cancel(&self, job: &Job) -> crate::Result<()> {
        unix_batch_details(job)?;
        let output = self
            .executor
            .execute(
                ShellCommand::new(["sudo", "-u", job.owner.as_str(), "atrm", job.id.as_str()])
                    .cwd(home_dir(&job.owner)),
            )
            .await;
        let stderr = output.stderr_str();
        if stderr.contains("Warning") {
            log::debug!("Job {} is running: {}", job.id, stderr.trim());
            self.kill_jobs_for(&job.owner).await;
        } else if output.is_error() {
            return internal_error(format!("Unable to cancel job: {}", stderr.trim()));
        }

        let id = job.id.clone();
        self.store
            .blocking(move |store| {
                store.update_job(&id, |job| {
                    if let JobDetails::UnixBatch(details) = &mut job.details {
                        details.cancelled = true;
                    }
                })
            })
            .await?;
        log::info!("Job {} cancelled", job.id);
        Ok(())
    }

    async fn kill_jobs_for(&self, owner: &str) {
        let output = self
            .executor
            .execute(ShellCommand::new(["ps", "-U", owner, "-o", "pid="]))
            .await;
        if output.is_error() {
            log::warn!(
                "Unable to list processes of {owner}: {}",
                output.stderr_str().trim()
            );
            return;
        }
        let stdout = output.stdout_str();
        let pids: Vec<&str> = stdout.split_whitespace().collect();
        if pids.is_empty() {
            return;
        }
        let mut args = vec!["sudo", "-u", owner, "/usr/bin/kill", "-9"];
        args.extend(pids.iter().copied());
        let output = self.executor.execute(ShellCommand::new(args)).await;
        if output.is_error() {
            log::warn!(
                "Unable to kill processes of {owner}: {}",
                output.stderr_str().trim()
            );
        } else {
            log::debug!("Killed {} processes of {owner}", pids.len());
        }
    }

    pub async fn delete(&self, job: &Job) -> crate::Result<()> {
        let details = unix_batch_details(job)?;
        let status = self.status(job).await?;
        if !status.is_terminal() {
            return parameter_error(format!("Job {} is {status}", job.id));
        }
        let path = self.config.job_output_dir.join(&details.directory);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                return internal_error(format!("Unable to delete {}: {error}", path.display()));
            }
        }
        let id = job.id.clone();
        self.store.blocking(move |store| store.remove_job(&id)).await?;
        log::debug!("Job {} deleted", job.id);
        Ok(())
    }

    pub async fn output(&self, job: &Job, kind: OutputKind) -> crate::Result<PathBuf> {
        let details = unix_batch_details(job)?;
        let name = match kind {
            OutputKind::Output => STDOUT_FILE,
            OutputKind::Error => STDERR_FILE,
        };
        let path = self.config.job_output_dir.join(&details.directory).join(name);
        if tokio::fs::try_exists(&path).await? {
            Ok(path)
        } else {
            internal_error("No output file available at the moment")
        }
    }
}

fn home_dir(owner: &str) -> PathBuf {
    Path::new("/home").join(owner)
}

fn unix_batch_details(job: &Job) -> crate::Result<&UnixBatchJob> {
    job.unix_batch().ok_or_else(|| {
        GatewayError::InternalError(format!("Job {} was not submitted through batch", job.id))
    })
}
