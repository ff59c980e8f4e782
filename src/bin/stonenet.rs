use std::path::PathBuf;

use clap::Parser;
use stonenet::{setup_tracing, AppResult, Node, NodeConfig};
use tracing::info;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    let _log_guard = setup_tracing("logs", log_level(commandline.verbose))?;

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let node_config = NodeConfig::set_up_config(&config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{node_config:#?}");
        return Ok(());
    }

    let node = Node::new(node_config);
    info!(node = %node.node_id(), config = %config_path.display(), "starting stonenet node");
    node.run_until_ctrl_c()
}
