use std::path::PathBuf;

use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;
use webserv::config::Config;
use webserv::error::ServerError;
use webserv::event_loop::EventLoop;

#[derive(Debug, Parser)]
#[command(version, about = "single-threaded HTTP/1.x server with CGI and streaming uploads")]
struct Cli {
    /// JSON configuration file
    #[arg(default_value = "conf/webserv.json")]
    config: PathBuf,

    /// Most verbose level that is logged
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

fn main() -> Result<(), ServerError> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder().with_max_level(cli.log_level).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    let config = Config::load(&cli.config).inspect_err(|e| error!(cause = %e, config = %cli.config.display(), "invalid configuration"))?;
    info!(config = %cli.config.display(), servers = config.servers.len(), "configuration loaded");

    let mut event_loop = EventLoop::bind(config).inspect_err(|e| error!(cause = %e, "failed to start"))?;
    event_loop.run()
}
