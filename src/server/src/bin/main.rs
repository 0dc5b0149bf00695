use clap::{Args, Parser, Subcommand};
use crucible_server::runtime::{
    config::{ConfRoot, DEFAULT_CONFIG_PATH},
    driver::ServerRuntime,
};

// === Clap === //

#[derive(Debug, Clone, Parser)]
#[command(about = "headless tick server for crucible", long_about = None)]
struct CliArgs {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Starts the tick loop.
    Start(CliStartCommand),
}

#[derive(Debug, Clone, Args)]
struct CliStartCommand {
    #[arg(short = 'c', long = "config", name = "path to config")]
    config: Option<String>,

    /// Overrides `tick.max_ticks` from the config. Zero runs forever.
    #[arg(long = "ticks")]
    ticks: Option<u64>,
}

// === Driver === //

fn main() -> anyhow::Result<()> {
    // Setup debug services
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("INFO"));

    // Parse arguments
    let cmd = CliArgs::parse();

    match &cmd.command {
        CliCommand::Start(sub) => do_cli_start_command(sub)?,
    };

    Ok(())
}

fn do_cli_start_command(sub: &CliStartCommand) -> anyhow::Result<()> {
    // Load config
    let conf_path = sub.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let conf = ConfRoot::load(conf_path)?;
    let max_ticks = sub.ticks.unwrap_or(conf.tick.max_ticks);

    // Run the server
    let mut runtime = ServerRuntime::new(conf)?;
    let result = runtime.run(max_ticks);
    let summary = runtime.shutdown();

    log::info!(
        "Fired {} spawn request(s): {} completed, {} spawned, {} cancelled, {} effect(s) played.",
        summary.fired,
        summary.completed,
        summary.spawned,
        summary.cancelled,
        summary.effects,
    );

    if summary.failed_lanes > 0 {
        log::warn!("{} event lane(s) panicked during the run.", summary.failed_lanes);
    }

    result
}
