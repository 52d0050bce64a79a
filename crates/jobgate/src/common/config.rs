use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// How often the reconciler and the account reclaimer run.
pub fn get_tick_interval() -> Duration {
    get_duration_from_env("JOBGATE_TICK_INTERVAL_MS").unwrap_or_else(|| Duration::from_secs(60))
}

fn get_duration_from_env(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub database: PathBuf,
    pub icat: IcatConfig,
    pub backend: BackendConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct IcatConfig {
    pub url: String,
    /// PEM bundle with additional root certificates for the ICAT connection.
    pub trust_store: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Pbs(PbsConfig),
    UnixBatch(UnixBatchConfig),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PbsConfig {
    pub ganglia_host: String,
    #[serde(default = "default_ganglia_port")]
    pub ganglia_port: u16,
    pub pbsnodes: String,
    pub qsig: String,
    pub qstat: String,
    pub qsub: String,
    #[serde(default = "default_qdel")]
    pub qdel: String,
    pub pool_prefix: String,
    pub prepareaccount: String,
    pub password_duration_seconds: u64,
    #[serde(default = "default_job_dir")]
    pub job_dir: PathBuf,
    pub script_dir: PathBuf,
    #[serde(default = "default_wakeup_script")]
    pub wakeup_script: String,
    #[serde(default = "default_copy_user")]
    pub copy_user: String,
    pub default_family: Option<String>,
}

impl PbsConfig {
    pub fn password_duration(&self) -> Duration {
        Duration::from_secs(self.password_duration_seconds)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct UnixBatchConfig {
    pub job_output_dir: PathBuf,
    pub families: Vec<FamilyConfig>,
}

impl UnixBatchConfig {
    pub fn default_family(&self) -> Option<&str> {
        self.families.first().map(|f| f.name.as_str())
    }

    pub fn family(&self, name: &str) -> Option<&FamilyConfig> {
        self.families.iter().find(|f| f.name == name)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FamilyConfig {
    pub name: String,
    pub members: Vec<String>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_ganglia_port() -> u16 {
    8649
}

fn default_qdel() -> String {
    "qdel".to_string()
}

fn default_job_dir() -> PathBuf {
    PathBuf::from("/home/batch/jobs")
}

fn default_wakeup_script() -> String {
    "/home/dmf/bin/wakeup".to_string()
}

fn default_copy_user() -> String {
    "dmf".to_string()
}

pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read configuration file {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Invalid configuration file {}", path.display()))
}

pub fn parse_config(content: &str) -> anyhow::Result<GatewayConfig> {
    let config: GatewayConfig = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &GatewayConfig) -> anyhow::Result<()> {
    if config.icat.url.trim().is_empty() {
        anyhow::bail!("icat.url must not be empty");
    }
    match &config.backend {
        BackendConfig::Pbs(pbs) => {
            if pbs.password_duration_seconds == 0 {
                anyhow::bail!("password_duration_seconds must be positive");
            }
            if pbs.pool_prefix.is_empty() {
                anyhow::bail!("pool_prefix must not be empty");
            }
        }
        BackendConfig::UnixBatch(batch) => {
            if batch.families.is_empty() {
                anyhow::bail!("At least one family has to be configured");
            }
            let mut names = HashSet::new();
            for family in &batch.families {
                if !names.insert(family.name.as_str()) {
                    anyhow::bail!("Family {} is declared more than once", family.name);
                }
                if family.members.is_empty() {
                    anyhow::bail!("Family {} has no members", family.name);
                }
            }
        }
    }
    Ok(())
}
