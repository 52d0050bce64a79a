use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::common::config::PbsConfig;
use crate::common::error::GatewayError;
use crate::common::identity::{IdentityRef, IdentityService};
use crate::common::shell::{ShellCommand, ShellExecutor, ShellOutput};
use crate::server::job::{Job, JobDetails, PbsJob, PbsStatus, UnixBatchJob};
use crate::server::pbs::load::{HostLoads, LoadSource, LoadSourceRef};
use crate::store::Store;

pub fn init_test_logging() {
    let _ = env_logger::Builder::default()
        .filter(None, log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Records every command and answers from rules matched on an argv prefix. The most recently
/// added matching rule wins; without a match the command succeeds with empty output.
#[derive(Default)]
pub struct FakeShell {
    rules: Mutex<Vec<(Vec<String>, ShellOutput)>>,
    commands: Mutex<Vec<ShellCommand>>,
}

impl FakeShell {
    pub fn new() -> Arc<Self> {
        init_test_logging();
        Arc::new(Self::default())
    }

    pub fn on(&self, prefix: &[&str], output: ShellOutput) {
        let prefix = prefix.iter().map(|s| s.to_string()).collect();
        self.rules.lock().unwrap().push((prefix, output));
    }

    pub fn commands(&self) -> Vec<ShellCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.commands().into_iter().map(|c| c.args).collect()
    }

    pub fn find_calls(&self, prefix: &[&str]) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|args| starts_with(args, prefix))
            .collect()
    }

    fn answer(&self, args: &[String]) -> ShellOutput {
        let rules = self.rules.lock().unwrap();
        rules
            .iter()
            .rev()
            .find(|(prefix, _)| {
                prefix.len() <= args.len() && prefix.iter().zip(args).all(|(p, a)| p == a)
            })
            .map(|(_, output)| output.clone())
            .unwrap_or_default()
    }
}

fn starts_with(args: &[String], prefix: &[&str]) -> bool {
    prefix.len() <= args.len() && prefix.iter().zip(args).all(|(p, a)| p == a)
}

impl ShellExecutor for FakeShell {
    fn execute(&self, command: ShellCommand) -> BoxFuture<'_, ShellOutput> {
        let output = self.answer(&command.args);
        self.commands.lock().unwrap().push(command);
        Box::pin(async move { output })
    }
}

/// Forwards to a [`FakeShell`], but holds commands starting with `prefix` until `release` is
/// notified. `entered` is notified when such a command arrives.
pub struct GatedShell {
    inner: Arc<FakeShell>,
    prefix: Vec<String>,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedShell {
    pub fn new(inner: Arc<FakeShell>, prefix: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            inner,
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

impl ShellExecutor for GatedShell {
    fn execute(&self, command: ShellCommand) -> BoxFuture<'_, ShellOutput> {
        Box::pin(async move {
            let gated = self.prefix.len() <= command.args.len()
                && self.prefix.iter().zip(&command.args).all(|(p, a)| p == a);
            if gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.execute(command).await
        })
    }
}

pub struct FakeLoads(HostLoads);

impl FakeLoads {
    pub fn new(loads: &[(&str, f32)]) -> LoadSourceRef {
        Arc::new(FakeLoads(
            loads.iter().map(|(h, l)| (h.to_string(), *l)).collect(),
        ))
    }
}

impl LoadSource for FakeLoads {
    fn loads(&self) -> BoxFuture<'_, crate::Result<HostLoads>> {
        let loads = self.0.clone();
        Box::pin(async move { Ok(loads) })
    }
}

/// Maps session ids to user names; anything else is an unknown session.
pub struct FakeIdentity(HashMap<String, String>);

impl FakeIdentity {
    pub fn new(sessions: &[(&str, &str)]) -> IdentityRef {
        Arc::new(FakeIdentity(
            sessions
                .iter()
                .map(|(s, u)| (s.to_string(), u.to_string()))
                .collect(),
        ))
    }
}

impl IdentityService for FakeIdentity {
    fn user_name<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, crate::Result<String>> {
        let result = self.0.get(session_id).cloned().ok_or_else(|| {
            GatewayError::SessionError(format!("Unable to find user by sessionid: {session_id}"))
        });
        Box::pin(async move { result })
    }
}

pub fn create_store() -> Store {
    Store::open_in_memory().unwrap()
}

pub fn pbs_config() -> PbsConfig {
    PbsConfig {
        ganglia_host: "localhost".into(),
        ganglia_port: 8649,
        pbsnodes: "pbsnodes".into(),
        qsig: "qsig".into(),
        qstat: "qstat".into(),
        qsub: "qsub".into(),
        qdel: "qdel".into(),
        pool_prefix: "ijp".into(),
        prepareaccount: "prepareaccount".into(),
        password_duration_seconds: 300,
        job_dir: PathBuf::from("/nonexistent/jobs"),
        script_dir: PathBuf::from("/nonexistent/scripts"),
        wakeup_script: "/home/dmf/bin/wakeup".into(),
        copy_user: "dmf".into(),
        default_family: None,
    }
}

fn now_millis() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
}

pub fn pbs_job(id: &str, username: &str, status: PbsStatus) -> Job {
    Job {
        id: id.to_string(),
        username: username.to_string(),
        owner: "small".into(),
        executable: "/bin/app".into(),
        submitted_at: now_millis(),
        details: JobDetails::Pbs(PbsJob {
            batch_filename: "script.sh".into(),
            status,
            worker_node: String::new(),
            comment: String::new(),
        }),
    }
}

pub fn unix_batch_job(id: &str, username: &str) -> Job {
    Job {
        id: id.to_string(),
        username: username.to_string(),
        owner: "small1".into(),
        executable: "/bin/app".into(),
        submitted_at: now_millis(),
        details: JobDetails::UnixBatch(UnixBatchJob {
            directory: "dir".into(),
            cancelled: false,
        }),
    }
}

/// `pbsnodes -x` document for `(host, state, jobs)` triples.
pub fn pbsnodes_xml(nodes: &[(&str, &str, &str)]) -> String {
    let mut xml = String::from("<Data>");
    for (name, state, jobs) in nodes {
        xml.push_str(&format!("<Node><name>{name}</name><state>{state}</state>"));
        if !jobs.is_empty() {
            xml.push_str(&format!("<jobs>{jobs}</jobs>"));
        }
        xml.push_str("</Node>");
    }
    xml.push_str("</Data>");
    xml
}

/// `qstat -x` document for `(id, state, exec_host)` triples.
pub fn qstat_xml(jobs: &[(&str, &str, &str)]) -> String {
    let mut xml = String::from("<Data>");
    for (id, state, exec_host) in jobs {
        xml.push_str(&format!(
            "<Job><Job_Id>{id}</Job_Id><Job_Name>script.sh</Job_Name><job_state>{state}</job_state>"
        ));
        if !exec_host.is_empty() {
            xml.push_str(&format!("<exec_host>{exec_host}</exec_host>"));
        }
        xml.push_str("</Job>");
    }
    xml.push_str("</Data>");
    xml
}
