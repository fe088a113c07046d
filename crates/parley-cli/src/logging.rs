use anyhow::Context;
use parley_core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Install the global subscriber. `RUST_LOG`, when set, replaces the
/// configured level and filters.
pub fn init(config: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = build_filter(config, verbose, env.as_deref())?;

    let writer = match config.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(verbose);
    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

fn build_filter(
    config: &LoggingConfig,
    verbose: bool,
    env: Option<&str>,
) -> anyhow::Result<EnvFilter> {
    if let Some(directives) = env.filter(|d| !d.trim().is_empty()) {
        return EnvFilter::try_new(directives).context("invalid RUST_LOG");
    }

    let level = if verbose {
        "debug"
    } else {
        config.level.as_deref().unwrap_or("info")
    };
    let mut filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    for directive in &config.filters {
        filter = filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("invalid log filter: {directive}"))?,
        );
    }
    Ok(filter)
}
