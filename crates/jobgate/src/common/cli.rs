use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
pub struct CommonOpts {
    /// Enables more detailed log output
    #[arg(long, short, global = true, env = "JOBGATE_VERBOSE")]
    pub verbose: bool,
}

#[derive(Parser)]
#[command(author, version, about = "Remote job submission gateway")]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Start the HTTP gateway
    Serve(ConfigOpts),
    /// Load and validate a configuration file, then exit
    CheckConfig(ConfigOpts),
}

#[derive(Parser)]
pub struct ConfigOpts {
    /// Path to the TOML configuration file
    #[arg(long, value_hint = clap::ValueHint::FilePath, env = "JOBGATE_CONFIG")]
    pub config: PathBuf,
}
