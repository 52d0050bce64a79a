use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;

use crate::common::config::PbsConfig;
use crate::common::error::{GatewayError, internal_error};
use crate::common::shell::{ExecutorRef, ShellCommand, ShellOutput};
use crate::server::pbs::load::LoadSourceRef;
use crate::server::pbs::nodes::{NodeInventory, NodeStates, is_offline};
use crate::store::{Account, StoreRef};

/// Characters of generated passwords; easily confused glyphs are left out.
const PASSWORD_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyz23456789";
const PASSWORD_LENGTH: usize = 4;

const VANISHED_USER: &str = "ERROR: User name does not exist";

/// Account handed out by [`AccountPool::prepare_machine`]. The password exists only here.
#[derive(Debug)]
pub struct PreparedAccount {
    pub account: Account,
    pub login: String,
    pub password: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct ReclaimSummary {
    pub expired: Vec<i64>,
    pub deleted: Vec<i64>,
    pub restored_hosts: Vec<String>,
}

/// Creates pool accounts on lightly loaded workers and removes them once they are idle.
pub struct AccountPool {
    store: StoreRef,
    executor: ExecutorRef,
    nodes: Arc<NodeInventory>,
    loads: LoadSourceRef,
    pool_prefix: String,
    prepareaccount: String,
    copy_user: String,
    password_duration: Duration,
    /// Serialises host selection and allocation against reclaim sweeps.
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    /// Some offline host may have no accounts left; cleared only by a complete restore pass.
    restore_pending: bool,
}

impl AccountPool {
    pub fn new(
        store: StoreRef,
        executor: ExecutorRef,
        nodes: Arc<NodeInventory>,
        loads: LoadSourceRef,
        config: &PbsConfig,
    ) -> Self {
        Self {
            store,
            executor,
            nodes,
            loads,
            pool_prefix: config.pool_prefix.clone(),
            prepareaccount: config.prepareaccount.clone(),
            copy_user: config.copy_user.clone(),
            password_duration: config.password_duration(),
            state: Mutex::new(PoolState::default()),
        }
    }

    async fn ssh(&self, host: &str, args: &[&str]) -> ShellOutput {
        let mut argv = vec!["ssh", host];
        argv.extend_from_slice(args);
        self.executor.execute(ShellCommand::new(argv)).await
    }

    /// Picks the least loaded worker, takes it offline and creates a fresh account on it that
    /// runs `script` on login.
    pub async fn prepare_machine(
        &self,
        user: &str,
        executable: &str,
        script: &Path,
    ) -> crate::Result<PreparedAccount> {
        let mut state = self.state.lock().await;

        let states = self.nodes.get_states().await?;
        let loads = self.loads.loads().await?;
        let host = choose_host(&states, |host| loads.get(host).copied())?;
        log::debug!("Set up account for {user} running {executable} on {host}");

        let result = self.take_host(&host, user, script).await;
        if result.is_err() {
            // The host may already be offline without an account to bring it back.
            state.restore_pending = true;
        }
        result
    }

    async fn take_host(
        &self,
        host: &str,
        user: &str,
        script: &Path,
    ) -> crate::Result<PreparedAccount> {
        self.nodes.set_offline(host).await?;

        let id = self.store.create_account(host)?;
        let login = format!("{}{id}", self.pool_prefix);
        let password = generate_password();
        let remote_script = format!("{id}.sh");

        self.executor
            .execute(ShellCommand::new([
                "scp".to_string(),
                script.to_string_lossy().to_string(),
                format!("{}@{host}:{remote_script}", self.copy_user),
            ]))
            .await
            .check("scp")?;

        let output = self
            .ssh(
                host,
                &[
                    self.prepareaccount.as_str(),
                    login.as_str(),
                    password.as_str(),
                    remote_script.as_str(),
                ],
            )
            .await
            .check(&self.prepareaccount)?;
        let report = output.stdout_str();
        if !report.trim().is_empty() {
            log::debug!("Prepare account reports {}", report.trim());
        }

        let Some(account) = self.store.allocate_account(id, user, Utc::now())? else {
            return internal_error(format!("Account {login} vanished during preparation"));
        };
        log::info!("Pool account {login} on {host} allocated to {user}");
        Ok(PreparedAccount {
            account,
            login,
            password,
        })
    }

    /// One reclaim sweep: expire old passwords, delete idle accounts, put emptied hosts back
    /// online. Failures of individual accounts are logged and skipped.
    pub async fn reclaim(&self, now: DateTime<Utc>) -> crate::Result<ReclaimSummary> {
        let mut state = self.state.lock().await;
        let mut summary = ReclaimSummary::default();

        let limit = now
            - chrono::Duration::from_std(self.password_duration)
                .map_err(|e| GatewayError::InternalError(format!("Invalid duration: {e}")))?;
        for account in self.store.find_expired_accounts(limit)? {
            let login = account.login(&self.pool_prefix);
            log::debug!(
                "Delete password for account {} on {}",
                account.id,
                account.host
            );
            let output = self
                .ssh(&account.host, &["sudo", "/usr/bin/passwd", "-d", login.as_str()])
                .await;
            if output.is_error() {
                log::error!(
                    "Cannot delete password of {login} on {}: {}",
                    account.host,
                    output.stderr_str().trim()
                );
                continue;
            }
            log::debug!("Command passwd reports {}", output.stdout_str().trim());
            if self.store.expire_account(account.id)? {
                summary.expired.push(account.id);
            }
        }

        for account in self.store.find_deletable_accounts()? {
            if self.delete_if_idle(&account).await {
                self.store.remove_account(account.id)?;
                summary.deleted.push(account.id);
            }
        }

        if !summary.deleted.is_empty() {
            state.restore_pending = true;
        }
        if state.restore_pending {
            let complete = self.restore_idle_hosts(&mut summary.restored_hosts).await?;
            state.restore_pending = !complete;
        }
        Ok(summary)
    }

    /// Puts every offline host without accounts back online. Returns false when some host could
    /// not be restored.
    async fn restore_idle_hosts(&self, restored: &mut Vec<String>) -> crate::Result<bool> {
        let mut complete = true;
        for (host, states) in self.nodes.get_states().await? {
            if !is_offline(&states) {
                continue;
            }
            let count = self.store.count_accounts_on(&host)?;
            if count > 0 {
                log::debug!("Idle machine {host} has {count} users so stays offline");
                continue;
            }
            log::debug!("Idle machine {host} has no users");
            match self.nodes.set_online(&host).await {
                Ok(()) => restored.push(host),
                Err(error) => {
                    log::error!("Cannot put {host} back online: {error}");
                    complete = false;
                }
            }
        }
        Ok(complete)
    }

    /// Deletes the OS user of `account` if it runs no processes. Returns true when the account
    /// no longer exists on its host.
    async fn delete_if_idle(&self, account: &Account) -> bool {
        let login = account.login(&self.pool_prefix);
        let host = &account.host;
        let output = self
            .ssh(host, &["ps", "-F", "--noheaders", "-U", login.as_str()])
            .await;
        let stderr = output.stderr_str();
        if output.code == 1 && stderr.starts_with(VANISHED_USER) {
            log::warn!("Account for {login} on {host} has vanished!");
            return true;
        }
        if !stderr.trim().is_empty() {
            log::error!(
                "Unexpected problem using ssh to connect to {host} to find processes for {login}: {}",
                stderr.trim()
            );
            return false;
        }
        let stdout = output.stdout_str();
        if !stdout.trim().is_empty() {
            log::debug!(
                "{login} has {} processes running on {host}",
                stdout.trim().lines().count()
            );
            return false;
        }

        log::debug!("No processes running for {login}");
        let output = self.ssh(host, &["sudo", "userdel", "-r", login.as_str()]).await;
        if output.is_error() {
            log::error!(
                "Cannot delete {login} on {host}: {}",
                output.stderr_str().trim()
            );
            return false;
        }
        log::info!(
            "Deleted pool account {login} on {host}: {}",
            output.stdout_str().trim()
        );
        true
    }
}

/// Picks the online host with the lowest load; falls back to all hosts when every host is
/// offline. Hosts without a load reading are chosen last.
pub fn choose_host<F>(states: &NodeStates, load: F) -> crate::Result<String>
where
    F: Fn(&str) -> Option<f32>,
{
    let online: Vec<&String> = states
        .iter()
        .filter(|(_, states)| !is_offline(states))
        .map(|(host, _)| host)
        .collect();
    let candidates: Vec<&String> = if online.is_empty() {
        states.keys().collect()
    } else {
        online
    };

    let mut best: Option<(&String, f32)> = None;
    for host in candidates {
        let value = load(host).unwrap_or(f32::INFINITY);
        match best {
            Some((_, best_load)) if best_load <= value => {}
            _ => best = Some((host, value)),
        }
    }
    match best {
        Some((host, _)) => Ok(host.clone()),
        None => internal_error("No machines available"),
    }
}

fn generate_password() -> String {
    let mut rng = rand::rng();
    (0..PASSWORD_LENGTH)
        .map(|_| char::from(PASSWORD_ALPHABET[rng.random_range(0..PASSWORD_ALPHABET.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{AccountPool, PASSWORD_ALPHABET, choose_host, generate_password};
    use crate::common::shell::ShellOutput;
    use crate::server::pbs::nodes::{NodeInventory, NodeStates};
    use crate::tests::utils::{
        FakeLoads, FakeShell, GatedShell, create_store, pbs_config, pbsnodes_xml, qstat_xml,
    };
    use chrono::{Duration, Utc};
    use std::path::Path;
    use std::sync::Arc;

    fn states(items: &[(&str, &str)]) -> NodeStates {
        items
            .iter()
            .map(|(h, s)| (h.to_string(), s.to_string()))
            .collect()
    }

    fn create_pool(
        shell: &Arc<FakeShell>,
        loads: &[(&str, f32)],
    ) -> (AccountPool, crate::store::StoreRef) {
        let store = Arc::new(create_store());
        let config = pbs_config();
        let nodes = Arc::new(NodeInventory::new(shell.clone(), &config));
        let pool = AccountPool::new(
            store.clone(),
            shell.clone(),
            nodes,
            FakeLoads::new(loads),
            &config,
        );
        (pool, store)
    }

    #[test]
    fn choose_lightest_online_host() {
        let states = states(&[("h1", "free"), ("h2", "offline"), ("h3", "free")]);
        let loads = |host: &str| match host {
            "h1" => Some(0.5),
            "h2" => Some(0.0),
            "h3" => Some(0.1),
            _ => None,
        };
        assert_eq!(choose_host(&states, loads).unwrap(), "h3");
    }

    #[test]
    fn choose_falls_back_to_offline_hosts() {
        let states = states(&[("h1", "offline"), ("h2", "job-exclusive,offline")]);
        let loads = |host: &str| if host == "h2" { Some(0.1) } else { Some(0.9) };
        assert_eq!(choose_host(&states, loads).unwrap(), "h2");
    }

    #[test]
    fn choose_prefers_hosts_with_known_load() {
        let states = states(&[("a", "free"), ("b", "free")]);
        let loads = |host: &str| if host == "b" { Some(3.0) } else { None };
        assert_eq!(choose_host(&states, loads).unwrap(), "b");
    }

    #[test]
    fn choose_ties_use_first_host() {
        let states = states(&[("a", "free"), ("b", "free")]);
        assert_eq!(choose_host(&states, |_| Some(1.0)).unwrap(), "a");
    }

    #[test]
    fn choose_without_hosts_fails() {
        let error = choose_host(&NodeStates::new(), |_| None).unwrap_err();
        assert_eq!(error.message(), "No machines available");
    }

    #[test]
    fn passwords_use_alphabet() {
        let password = generate_password();
        assert_eq!(password.len(), 4);
        assert!(password.bytes().all(|c| PASSWORD_ALPHABET.contains(&c)));
    }

    #[tokio::test]
    async fn prepare_picks_lightest_host() {
        let shell = FakeShell::new();
        shell.on(
            &["pbsnodes", "-x"],
            ShellOutput::success(pbsnodes_xml(&[
                ("h1", "free", ""),
                ("h2", "free", ""),
                ("h3", "free", ""),
            ])),
        );
        let (pool, store) = create_pool(&shell, &[("h1", 0.8), ("h2", 0.2), ("h3", 0.5)]);

        let prepared = pool
            .prepare_machine("alice", "/bin/app", Path::new("/tmp/script.sh"))
            .await
            .unwrap();
        let id = prepared.account.id;
        assert_eq!(prepared.account.host, "h2");
        assert_eq!(prepared.account.user_name.as_deref(), Some("alice"));
        assert!(prepared.account.allocated_at.is_some());
        assert_eq!(prepared.login, format!("ijp{id}"));

        assert_eq!(
            shell.find_calls(&["pbsnodes", "-o"]),
            vec![vec!["pbsnodes", "-o", "h2"]]
        );
        assert_eq!(
            shell.find_calls(&["scp"]),
            vec![vec![
                "scp".to_string(),
                "/tmp/script.sh".to_string(),
                format!("dmf@h2:{id}.sh")
            ]]
        );
        assert_eq!(
            shell.find_calls(&["ssh"]),
            vec![vec![
                "ssh".to_string(),
                "h2".to_string(),
                "prepareaccount".to_string(),
                format!("ijp{id}"),
                prepared.password.clone(),
                format!("{id}.sh")
            ]]
        );

        let stored = store.get_account(id).unwrap().unwrap();
        assert_eq!(stored, prepared.account);
        assert_eq!(store.count_accounts_on("h2").unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_preparation_leaves_reclaimable_row() {
        let shell = FakeShell::new();
        shell.on(
            &["pbsnodes", "-x"],
            ShellOutput::success(pbsnodes_xml(&[("h1", "free", "")])),
        );
        shell.on(&["ssh", "h1", "prepareaccount"], ShellOutput::failure(1, "no"));
        let (pool, store) = create_pool(&shell, &[("h1", 0.1)]);

        let error = pool
            .prepare_machine("alice", "/bin/app", Path::new("/tmp/s.sh"))
            .await
            .unwrap_err();
        assert!(error.message().contains("no"));
        let rows = store.find_deletable_accounts().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].host, "h1");
    }

    #[tokio::test]
    async fn no_hosts_is_internal_error() {
        let shell = FakeShell::new();
        shell.on(&["pbsnodes", "-x"], ShellOutput::success("<Data></Data>"));
        let (pool, store) = create_pool(&shell, &[]);
        assert!(
            pool.prepare_machine("alice", "/bin/app", Path::new("/tmp/s.sh"))
                .await
                .is_err()
        );
        assert!(store.find_deletable_accounts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclaim_expires_old_passwords_only() {
        let shell = FakeShell::new();
        let (pool, store) = create_pool(&shell, &[]);
        let now = Utc::now();
        let old = store.create_account("h1").unwrap();
        store
            .allocate_account(old, "alice", now - Duration::seconds(600))
            .unwrap();
        let young = store.create_account("h1").unwrap();
        store.allocate_account(young, "bob", now).unwrap();
        // Both still run processes.
        shell.on(&["ssh", "h1", "ps"], ShellOutput::success("proc\n"));

        let summary = pool.reclaim(now).await.unwrap();
        assert_eq!(summary.expired, vec![old]);
        assert!(summary.deleted.is_empty());
        assert_eq!(
            shell.find_calls(&["ssh", "h1", "sudo", "/usr/bin/passwd"]),
            vec![vec![
                "ssh".to_string(),
                "h1".to_string(),
                "sudo".to_string(),
                "/usr/bin/passwd".to_string(),
                "-d".to_string(),
                format!("ijp{old}")
            ]]
        );
        assert!(store.get_account(old).unwrap().unwrap().allocated_at.is_none());
        assert!(store.get_account(young).unwrap().unwrap().allocated_at.is_some());
    }

    #[tokio::test]
    async fn reclaim_keeps_password_when_passwd_fails() {
        let shell = FakeShell::new();
        let (pool, store) = create_pool(&shell, &[]);
        let now = Utc::now();
        let id = store.create_account("h1").unwrap();
        store
            .allocate_account(id, "alice", now - Duration::seconds(600))
            .unwrap();
        shell.on(&["ssh", "h1", "sudo", "/usr/bin/passwd"], ShellOutput::failure(255, "down"));

        let summary = pool.reclaim(now).await.unwrap();
        assert!(summary.expired.is_empty());
        assert!(store.get_account(id).unwrap().unwrap().allocated_at.is_some());
    }

    #[tokio::test]
    async fn reclaim_deletes_idle_accounts_and_restores_host() {
        let shell = FakeShell::new();
        shell.on(
            &["pbsnodes", "-x"],
            ShellOutput::success(pbsnodes_xml(&[
                ("h1", "offline", ""),
                ("h2", "offline", ""),
                ("h3", "free", ""),
            ])),
        );
        shell.on(&["qstat", "-x"], ShellOutput::success(qstat_xml(&[])));
        let (pool, store) = create_pool(&shell, &[]);
        let idle = store.create_account("h1").unwrap();
        let busy = store.create_account("h2").unwrap();
        shell.on(
            &["ssh", "h2", "ps"],
            ShellOutput::success("ijp 1 0 0 bash\nijp 2 1 0 app\n"),
        );

        let summary = pool.reclaim(Utc::now()).await.unwrap();
        assert_eq!(summary.deleted, vec![idle]);
        assert_eq!(summary.restored_hosts, vec!["h1"]);
        assert!(store.get_account(idle).unwrap().is_none());
        assert!(store.get_account(busy).unwrap().is_some());
        assert_eq!(
            shell.find_calls(&["ssh", "h1", "sudo", "userdel"]),
            vec![vec![
                "ssh".to_string(),
                "h1".to_string(),
                "sudo".to_string(),
                "userdel".to_string(),
                "-r".to_string(),
                format!("ijp{idle}")
            ]]
        );
        assert_eq!(
            shell.find_calls(&["pbsnodes", "-c"]),
            vec![vec!["pbsnodes", "-c", "h1"]]
        );
    }

    #[tokio::test]
    async fn reclaim_removes_vanished_accounts() {
        let shell = FakeShell::new();
        shell.on(
            &["pbsnodes", "-x"],
            ShellOutput::success(pbsnodes_xml(&[("h1", "free", "")])),
        );
        let (pool, store) = create_pool(&shell, &[]);
        let id = store.create_account("h1").unwrap();
        shell.on(
            &["ssh", "h1", "ps"],
            ShellOutput::failure(1, "ERROR: User name does not exist.\n"),
        );

        let summary = pool.reclaim(Utc::now()).await.unwrap();
        assert_eq!(summary.deleted, vec![id]);
        assert!(summary.restored_hosts.is_empty());
        assert!(shell.find_calls(&["ssh", "h1", "sudo", "userdel"]).is_empty());
        assert!(store.get_account(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaim_skips_accounts_with_ssh_problems() {
        let shell = FakeShell::new();
        let (pool, store) = create_pool(&shell, &[]);
        let broken = store.create_account("h1").unwrap();
        let idle = store.create_account("h2").unwrap();
        shell.on(
            &["ssh", "h1", "ps"],
            ShellOutput::failure(255, "ssh: connect to host h1: No route to host"),
        );
        shell.on(
            &["pbsnodes", "-x"],
            ShellOutput::success(pbsnodes_xml(&[("h2", "free", "")])),
        );

        let summary = pool.reclaim(Utc::now()).await.unwrap();
        assert_eq!(summary.deleted, vec![idle]);
        assert!(store.get_account(broken).unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_account_stays_expired() {
        let shell = FakeShell::new();
        let (pool, store) = create_pool(&shell, &[]);
        let now = Utc::now();
        let id = store.create_account("h1").unwrap();
        store
            .allocate_account(id, "alice", now - Duration::seconds(600))
            .unwrap();
        shell.on(&["ssh", "h1", "ps"], ShellOutput::success("proc\n"));

        for _ in 0..3 {
            pool.reclaim(now).await.unwrap();
            let account = store.get_account(id).unwrap().unwrap();
            assert!(account.allocated_at.is_none());
        }
        assert!(store.allocate_account(id, "bob", now).unwrap().is_none());
    }

    #[tokio::test]
    async fn restore_is_retried_after_pbsnodes_failure() {
        let shell = FakeShell::new();
        shell.on(&["pbsnodes", "-x"], ShellOutput::failure(1, "pbs_server down"));
        let (pool, store) = create_pool(&shell, &[]);
        let id = store.create_account("h1").unwrap();

        assert!(pool.reclaim(Utc::now()).await.is_err());
        assert!(store.get_account(id).unwrap().is_none());
        assert!(shell.find_calls(&["pbsnodes", "-c"]).is_empty());

        shell.on(
            &["pbsnodes", "-x"],
            ShellOutput::success(pbsnodes_xml(&[("h1", "offline", "")])),
        );
        shell.on(&["qstat", "-x"], ShellOutput::success(qstat_xml(&[])));
        let summary = pool.reclaim(Utc::now()).await.unwrap();
        assert!(summary.deleted.is_empty());
        assert_eq!(summary.restored_hosts, vec!["h1"]);
        assert_eq!(
            shell.find_calls(&["pbsnodes", "-c"]),
            vec![vec!["pbsnodes", "-c", "h1"]]
        );

        // Nothing left to restore.
        let summary = pool.reclaim(Utc::now()).await.unwrap();
        assert!(summary.restored_hosts.is_empty());
        assert_eq!(shell.find_calls(&["pbsnodes", "-c"]).len(), 1);
    }

    #[tokio::test]
    async fn restore_is_retried_after_online_failure() {
        let shell = FakeShell::new();
        shell.on(
            &["pbsnodes", "-x"],
            ShellOutput::success(pbsnodes_xml(&[("h1", "offline", "")])),
        );
        shell.on(&["qstat", "-x"], ShellOutput::success(qstat_xml(&[])));
        shell.on(&["pbsnodes", "-c"], ShellOutput::failure(1, "busy"));
        let (pool, store) = create_pool(&shell, &[]);
        let id = store.create_account("h1").unwrap();

        let summary = pool.reclaim(Utc::now()).await.unwrap();
        assert_eq!(summary.deleted, vec![id]);
        assert!(summary.restored_hosts.is_empty());

        shell.on(&["pbsnodes", "-c"], ShellOutput::success(""));
        let summary = pool.reclaim(Utc::now()).await.unwrap();
        assert_eq!(summary.restored_hosts, vec!["h1"]);
    }

    #[tokio::test]
    async fn host_taken_offline_by_failed_preparation_is_restored() {
        let shell = FakeShell::new();
        shell.on(
            &["pbsnodes", "-x"],
            ShellOutput::success(pbsnodes_xml(&[("h1", "free", "0/12.head")])),
        );
        shell.on(&["qsig"], ShellOutput::failure(1, "boom"));
        let (pool, store) = create_pool(&shell, &[("h1", 0.1)]);

        assert!(
            pool.prepare_machine("alice", "/bin/app", Path::new("/tmp/s.sh"))
                .await
                .is_err()
        );
        assert_eq!(
            shell.find_calls(&["pbsnodes", "-o"]),
            vec![vec!["pbsnodes", "-o", "h1"]]
        );
        assert!(store.find_deletable_accounts().unwrap().is_empty());

        shell.on(
            &["pbsnodes", "-x"],
            ShellOutput::success(pbsnodes_xml(&[("h1", "offline", "0/12.head")])),
        );
        shell.on(&["qstat", "-x"], ShellOutput::success(qstat_xml(&[])));
        let summary = pool.reclaim(Utc::now()).await.unwrap();
        assert!(summary.deleted.is_empty());
        assert_eq!(summary.restored_hosts, vec!["h1"]);
    }

    #[tokio::test]
    async fn reclaim_waits_for_account_in_preparation() {
        let shell = FakeShell::new();
        shell.on(
            &["pbsnodes", "-x"],
            ShellOutput::success(pbsnodes_xml(&[("h1", "offline", ""), ("h2", "offline", "")])),
        );
        shell.on(&["qstat", "-x"], ShellOutput::success(qstat_xml(&[])));
        let gate = GatedShell::new(shell.clone(), &["scp"]);
        let store = Arc::new(create_store());
        let config = pbs_config();
        let nodes = Arc::new(NodeInventory::new(gate.clone(), &config));
        let pool = AccountPool::new(
            store.clone(),
            gate.clone(),
            nodes,
            FakeLoads::new(&[("h1", 0.1), ("h2", 0.9)]),
            &config,
        );
        let stale = store.create_account("h2").unwrap();

        let prepare = pool.prepare_machine("alice", "/bin/app", Path::new("/tmp/s.sh"));
        let sweep = async {
            gate.entered.notified().await;
            let reclaim = pool.reclaim(Utc::now());
            tokio::pin!(reclaim);
            for _ in 0..10 {
                assert!(futures::poll!(&mut reclaim).is_pending());
                tokio::task::yield_now().await;
            }

            let rows = store.find_deletable_accounts().unwrap();
            assert_eq!(rows.len(), 2);
            assert_eq!(rows[1].host, "h1");
            assert!(rows[1].allocated_at.is_none());
            assert!(shell.find_calls(&["ssh"]).is_empty());
            assert!(shell.find_calls(&["pbsnodes", "-c"]).is_empty());

            gate.release.notify_one();
            reclaim.await
        };
        let (prepared, summary) = tokio::join!(prepare, sweep);

        let prepared = prepared.unwrap();
        let summary = summary.unwrap();
        assert_eq!(prepared.account.host, "h1");
        assert!(store.get_account(prepared.account.id).unwrap().is_some());
        assert_eq!(summary.deleted, vec![stale]);
        assert_eq!(summary.restored_hosts, vec!["h2"]);
        assert!(shell.find_calls(&["ssh", "h1", "ps"]).is_empty());
    }
}
