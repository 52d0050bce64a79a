use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::common::config::PbsConfig;
use crate::common::error::{GatewayError, internal_error, parameter_error};
use crate::common::script::{BatchScript, write_script, write_temp_script};
use crate::common::shell::{ExecutorRef, ShellCommand};
use crate::server::job::{Job, JobDetails, JobId, OutputKind, PbsJob, PbsStatus};
use crate::server::pbs::accounts::{AccountPool, ReclaimSummary};
use crate::server::pbs::load::LoadSourceRef;
use crate::server::pbs::nodes::NodeInventory;
use crate::server::pbs::reconcile::{ReconcileSummary, reconcile_jobs};
use crate::store::StoreRef;

pub struct PbsBackend {
    config: PbsConfig,
    store: StoreRef,
    executor: ExecutorRef,
    nodes: Arc<NodeInventory>,
    pool: AccountPool,
}

impl PbsBackend {
    pub fn new(
        config: PbsConfig,
        store: StoreRef,
        executor: ExecutorRef,
        loads: LoadSourceRef,
    ) -> Self {
        let nodes = Arc::new(NodeInventory::new(executor.clone(), &config));
        let pool = AccountPool::new(
            store.clone(),
            executor.clone(),
            nodes.clone(),
            loads,
            &config,
        );
        Self {
            config,
            store,
            executor,
            nodes,
            pool,
        }
    }

    /// Submits a batch job as the family account and records it.
    pub async fn submit_batch(
        &self,
        username: &str,
        executable: &str,
        args: &[String],
        family: Option<&str>,
    ) -> crate::Result<JobId> {
        let owner = match family.or(self.config.default_family.as_deref()) {
            Some(family) if !family.is_empty() => family.to_string(),
            _ => return parameter_error("No family was specified"),
        };

        let script = BatchScript::new(executable, args).render();
        let script_path = write_script(&self.config.script_dir, &script)?;
        let batch_filename = script_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let script_arg = script_path.to_string_lossy().to_string();
        let output = self
            .executor
            .execute(ShellCommand::new([
                "sudo",
                "-u",
                owner.as_str(),
                self.config.qsub.as_str(),
                "-k",
                "eo",
                script_arg.as_str(),
            ]))
            .await;
        if output.is_error() {
            return internal_error(format!(
                "Unable to submit job via qsub: {}",
                output.stderr_str().trim()
            ));
        }
        let job_id = output.stdout_str().trim().to_string();
        if job_id.is_empty() {
            return internal_error("qsub did not report a job id");
        }

        let mut details = PbsJob {
            batch_filename,
            status: PbsStatus::Queued,
            worker_node: String::new(),
            comment: String::new(),
        };
        match self.nodes.qstat(Some(&job_id)).await {
            Ok(jobs) => match jobs.into_iter().find(|job| job.id == job_id) {
                Some(job) => {
                    details.status = job.status;
                    details.worker_node = job.worker_node;
                    details.comment = job.comment;
                }
                None => log::warn!("Just submitted job {job_id} is not known to qstat"),
            },
            Err(error) => log::warn!("Unable to query just submitted job {job_id}: {error}"),
        }

        let job = Job {
            id: job_id.clone(),
            username: username.to_string(),
            owner,
            executable: executable.to_string(),
            submitted_at: Utc::now(),
            details: JobDetails::Pbs(details),
        };
        self.store.blocking(move |store| store.put_job(&job)).await?;
        log::info!("Job {job_id} running {executable} submitted for {username}");
        Ok(job_id)
    }

    /// Prepares a pool account and returns `<user name> <password> <host>`.
    pub async fn submit_interactive(
        &self,
        username: &str,
        executable: &str,
        args: &[String],
    ) -> crate::Result<String> {
        let script = write_temp_script(&BatchScript::new(executable, args).render())?;
        let prepared = self
            .pool
            .prepare_machine(username, executable, &script)
            .await?;
        let user_name = prepared.account.user_name.as_deref().unwrap_or(username);
        Ok(format!(
            "{user_name} {} {}",
            prepared.password, prepared.account.host
        ))
    }

    pub async fn cancel(&self, job: &Job) -> crate::Result<()> {
        let output = self
            .executor
            .execute(ShellCommand::new([self.config.qdel.as_str(), job.id.as_str()]))
            .await;
        if output.is_error() {
            return internal_error(format!(
                "Unable to cancel job: {}",
                output.stderr_str().trim()
            ));
        }
        log::info!("Job {} cancelled", job.id);
        Ok(())
    }

    pub async fn delete(&self, job: &Job) -> crate::Result<()> {
        let pbs = pbs_details(job)?;
        if !pbs.status.is_terminal() {
            return parameter_error("Only completed jobs can be deleted - try cancelling first");
        }
        for kind in [OutputKind::Output, OutputKind::Error] {
            let path = self.output_path(job, pbs, kind);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => {
                    return internal_error(format!(
                        "Unable to delete {}: {error}",
                        path.display()
                    ));
                }
            }
        }
        let id = job.id.clone();
        self.store.blocking(move |store| store.remove_job(&id)).await?;
        log::debug!("Job {} deleted", job.id);
        Ok(())
    }

    pub fn status(&self, job: &Job) -> crate::Result<String> {
        let pbs = pbs_details(job)?;
        Ok(format!(
            "Id:                 {}\n\
             Status:             {}\n\
             Comment:            {}\n\
             Date of submission: {}\n\
             Node:               {}\n",
            job.id,
            pbs.status,
            pbs.comment,
            job.submitted_at.format("%a %b %d %H:%M:%S %Z %Y"),
            pbs.worker_node
        ))
    }

    pub fn list(&self, jobs: &[Job]) -> String {
        jobs.iter()
            .filter_map(|job| job.pbs().map(|pbs| format!("{}, {}\n", job.id, pbs.status)))
            .collect()
    }

    /// Locates the output file of a job, asking the worker to push intermediate output when the
    /// final file does not exist yet.
    pub async fn output(&self, job: &Job, kind: OutputKind) -> crate::Result<PathBuf> {
        let pbs = pbs_details(job)?;
        let path = self.output_path(job, pbs, kind);
        if tokio::fs::try_exists(&path).await? {
            log::debug!("Returning output for {}", job.id);
            return Ok(path);
        }
        if pbs.worker_node.is_empty() {
            return internal_error("No output file available at the moment");
        }

        log::debug!("Getting intermediate output for {}", job.id);
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let output = self
            .executor
            .execute(ShellCommand::new([
                "sudo",
                "-u",
                "batch",
                "ssh",
                pbs.worker_node.as_str(),
                "sudo",
                "push_output",
                job.owner.as_str(),
                name.as_str(),
            ]))
            .await;
        if output.is_error() {
            return internal_error(format!(
                "Temporary problem getting output: {}",
                output.stderr_str().trim()
            ));
        }
        let mut tmp = path.into_os_string();
        tmp.push("_tmp");
        let tmp = PathBuf::from(tmp);
        if tokio::fs::try_exists(&tmp).await? {
            log::debug!("Returning intermediate output for {}", job.id);
            Ok(tmp)
        } else {
            internal_error("No output file available at the moment")
        }
    }

    fn output_path(&self, job: &Job, pbs: &PbsJob, kind: OutputKind) -> PathBuf {
        let sequence = job.id.split('.').next().unwrap_or_default();
        self.config.job_dir.join(format!(
            "{}.{}{sequence}",
            pbs.batch_filename,
            kind.letter()
        ))
    }

    pub async fn reconcile(&self) -> crate::Result<ReconcileSummary> {
        reconcile_jobs(&self.store, &self.nodes).await
    }

    pub async fn reclaim(&self) -> crate::Result<ReclaimSummary> {
        self.pool.reclaim(Utc::now()).await
    }
}

fn pbs_details(job: &Job) -> crate::Result<&PbsJob> {
    job.pbs().ok_or_else(|| {
        GatewayError::InternalError(format!("Job {} was not submitted through PBS", job.id))
    })
}
