use std::path::PathBuf;

use clap::Parser;
use tokio::runtime::Runtime;

use meshgate::service::setup_local_tracing;
use meshgate::{AppResult, Bootstrap, ProxyConfig, GLOBAL_CONFIG};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: debug, vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();
    setup_local_tracing(commandline.verbose);

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("conf");
            path.push("meshgate.toml");
            path
        },
        PathBuf::from,
    );
    let proxy_config = ProxyConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{}", serde_json::to_string_pretty(&proxy_config)?);
        return Ok(());
    }

    GLOBAL_CONFIG
        .set(proxy_config)
        .expect("set proxy config failed");

    let rt = Runtime::new()?;
    Bootstrap::start(&rt)
}
