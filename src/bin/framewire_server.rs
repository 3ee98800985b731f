use std::{
    error::Error,
    io::{self, Write},
    path::PathBuf,
    process,
    time::Duration,
};

use clap::Parser;
use framewire::{RunMode, Server, ServerConfig, protocol::StopOutcome};
use log::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Interface to bind
    #[arg(short, long)]
    address: Option<String>,
    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Pending-connection queue depth
    #[arg(short, long)]
    backlog: Option<i32>,
    /// Serve connections from a worker pool instead of a single thread
    #[arg(long)]
    parallel: bool,
    /// Worker count in parallel mode
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
    /// Close connections that send nothing for this long
    #[arg(long)]
    read_timeout_ms: Option<u64>,
    /// Log level used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };

        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
        if let Some(ms) = self.read_timeout_ms {
            config.read_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }
}

/// Ask the operator on the terminal whether busy workers should be abandoned.
fn confirm_force(busy: usize) -> bool {
    print!(
        "\nWARNING: {busy} connections are still being served.\n\
         Do you want to force the termination of the server? (y/n): "
    );
    let _ = io::stdout().flush();

    let mut answer = String::new();
    io::stdin().read_line(&mut answer).is_ok() && answer.trim() == "y"
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = cli.server_config()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    let mut server = Server::bind(&config)?;
    server.set_handler(|request| request.to_vec());

    let handle = server.handle();
    ctrlc::set_handler(move || {
        if handle.stop_with(confirm_force) == StopOutcome::ForceRequested {
            eprintln!("server is terminated forcefully");
            process::exit(-1);
        }
    })?;

    let mode = if cli.parallel {
        RunMode::Parallel {
            workers: cli.workers,
        }
    } else {
        RunMode::Sequential
    };
    info!("press Ctrl+C to stop {}", server.info());
    server.run(mode)?;
    Ok(())
}
