use clap::{CommandFactory, FromArgMatches};

use jobgate::common::cli::{ConfigOpts, RootOptions, SubCommand};
use jobgate::common::config::{BackendConfig, load_config};
use jobgate::common::setup::setup_logging;
use jobgate::server::bootstrap::start_server;

async fn command_serve(opts: ConfigOpts) -> anyhow::Result<()> {
    let config = load_config(&opts.config)?;
    start_server(config).await
}

fn command_check_config(opts: ConfigOpts) -> anyhow::Result<()> {
    let config = load_config(&opts.config)?;
    let backend = match &config.backend {
        BackendConfig::Pbs(_) => "pbs".to_string(),
        BackendConfig::UnixBatch(batch) => format!(
            "unix_batch with families {}",
            batch
                .families
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    println!(
        "{}: {backend}, listening on {}",
        opts.config.display(),
        config.listen
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.verbose);

    let result = match top_opts.subcmd {
        SubCommand::Serve(opts) => command_serve(opts).await,
        SubCommand::CheckConfig(opts) => command_check_config(opts),
    };

    if let Err(error) = result {
        log::error!("{error:?}");
        std::process::exit(1);
    }
}
