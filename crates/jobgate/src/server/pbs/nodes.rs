use std::collections::BTreeMap;

use crate::common::config::PbsConfig;
use crate::common::error::{GatewayError, internal_error};
use crate::common::shell::{ExecutorRef, ShellCommand};
use crate::server::job::PbsStatus;
use crate::server::pbs::qstat::{QstatJob, child_text, parse_qstat, parse_xml};

/// `qsig` exit code for a job in a state that does not accept the signal.
const QSIG_INVALID_STATE: i32 = 170;

/// Host to comma separated state tokens, e.g. `free,offline`.
pub type NodeStates = BTreeMap<String, String>;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct NodeReport {
    pub states: NodeStates,
    /// Host to comma separated job tokens of the form `<slot>/<job id>`.
    pub jobs: BTreeMap<String, String>,
}

impl NodeReport {
    pub fn job_ids_on(&self, host: &str) -> Vec<String> {
        self.jobs
            .get(host)
            .map(|jobs| {
                jobs.split(',')
                    .map(|token| token.trim())
                    .filter(|token| !token.is_empty())
                    .map(|token| match token.split_once('/') {
                        Some((_, id)) => id.to_string(),
                        None => token.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub fn is_offline(states: &str) -> bool {
    states.split(',').any(|state| state.trim() == "offline")
}

pub fn parse_pbsnodes(xml: &str) -> crate::Result<NodeReport> {
    let document = parse_xml(xml.trim())?;
    let mut report = NodeReport::default();
    for node in document
        .root_element()
        .children()
        .filter(|n| n.has_tag_name("Node"))
    {
        let Some(host) = child_text(node, "name") else {
            continue;
        };
        if let Some(state) = child_text(node, "state") {
            report.states.insert(host.clone(), state);
        }
        if let Some(jobs) = child_text(node, "jobs") {
            report.jobs.insert(host, jobs);
        }
    }
    Ok(report)
}

/// Queries and changes the state of PBS worker nodes.
pub struct NodeInventory {
    executor: ExecutorRef,
    pbsnodes: String,
    qsig: String,
    qstat: String,
    qsub: String,
    wakeup_script: String,
}

impl NodeInventory {
    pub fn new(executor: ExecutorRef, config: &PbsConfig) -> Self {
        Self {
            executor,
            pbsnodes: config.pbsnodes.clone(),
            qsig: config.qsig.clone(),
            qstat: config.qstat.clone(),
            qsub: config.qsub.clone(),
            wakeup_script: config.wakeup_script.clone(),
        }
    }

    async fn run(&self, args: Vec<&str>) -> crate::Result<String> {
        let command = ShellCommand::new(args);
        let name = command.to_string();
        let output = self.executor.execute(command).await.check(&name)?;
        Ok(output.stdout_str())
    }

    pub async fn report(&self) -> crate::Result<NodeReport> {
        let xml = self.run(vec![self.pbsnodes.as_str(), "-x"]).await?;
        parse_pbsnodes(&xml)
    }

    /// Returns an owned snapshot of node states.
    pub async fn get_states(&self) -> crate::Result<NodeStates> {
        Ok(self.report().await?.states)
    }

    /// Runs `qstat -x`, optionally restricted to a single job.
    pub async fn qstat(&self, job_id: Option<&str>) -> crate::Result<Vec<QstatJob>> {
        let mut args = vec![self.qstat.as_str(), "-x"];
        args.extend(job_id);
        let xml = self
            .run(args)
            .await
            .map_err(|error| {
                GatewayError::InternalError(format!("Unable to query jobs: {error}"))
            })?;
        parse_qstat(&xml)
    }

    /// Takes a host out of scheduling and suspends the jobs running there.
    pub async fn set_offline(&self, host: &str) -> crate::Result<()> {
        self.run(vec![self.pbsnodes.as_str(), "-o", host]).await?;
        for job_id in self.report().await?.job_ids_on(host) {
            self.suspend_job(&job_id).await?;
        }
        log::debug!("{host} is now offline");
        Ok(())
    }

    /// Returns a host to scheduling, resumes its suspended jobs and nudges the scheduler.
    pub async fn set_online(&self, host: &str) -> crate::Result<()> {
        self.run(vec![self.pbsnodes.as_str(), "-c", host]).await?;
        for job in self.qstat(None).await? {
            if job.status == PbsStatus::Suspended && job.worker_node == host {
                self.resume_job(&job.id).await?;
            }
        }
        let reply = self
            .run(vec![
                self.qsub.as_str(),
                "-o",
                "/dev/null",
                "-e",
                "/dev/null",
                self.wakeup_script.as_str(),
            ])
            .await?;
        if !reply.trim().is_empty() {
            log::debug!("qsub reports {}", reply.trim());
        }
        log::debug!("{host} is now online");
        Ok(())
    }

    async fn suspend_job(&self, job_id: &str) -> crate::Result<()> {
        let output = self
            .executor
            .execute(ShellCommand::new([self.qsig.as_str(), "-s", "suspend", job_id]))
            .await;
        if output.code == QSIG_INVALID_STATE {
            log::debug!(
                "Job {job_id} cannot be suspended: {}",
                output.stderr_str().trim()
            );
            return Ok(());
        }
        if output.is_error() {
            return internal_error(format!(
                "Unable to suspend job {job_id}: {}",
                output.stderr_str().trim()
            ));
        }
        log::debug!("{job_id} is now suspended");
        Ok(())
    }

    async fn resume_job(&self, job_id: &str) -> crate::Result<()> {
        self.run(vec![self.qsig.as_str(), "-s", "resume", job_id]).await?;
        log::debug!("{job_id} has now resumed");
        Ok(())
    }
}
