use env_logger::DEFAULT_FILTER_ENV;
use log::LevelFilter;
use std::io::Write;

/// Crate whose records pass at the gateway level; dependencies only report warnings.
const GATEWAY_TARGET: &str = "jobgate";

fn gateway_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

/// Logs `jobgate=info` (or `jobgate=debug` with `verbose`) and `warn` for everything else.
/// `RUST_LOG` takes precedence over both.
pub fn setup_logging(verbose: bool) {
    let mut builder = env_logger::Builder::default();
    builder
        .filter_level(LevelFilter::Warn)
        .filter_module(GATEWAY_TARGET, gateway_level(verbose));

    let debugging = verbose
        || std::env::var(DEFAULT_FILTER_ENV)
            .map(|v| v.contains("debug") || v.contains("trace"))
            .unwrap_or(false);

    if debugging {
        builder.format_timestamp_millis().format_module_path(true);
    } else {
        // <time> <level> <message>
        builder.format(|buf, record| {
            let style = buf.default_level_style(record.level()).bold();
            writeln!(
                buf,
                "{} {style}{:<5}{style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    builder.parse_default_env();
    builder.init();
}
