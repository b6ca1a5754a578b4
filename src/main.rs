// src/main.rs
//
// modgate daemon entry point: parse arguments, load and validate the
// config, then run gateway lifetimes until shutdown. A `_reload` request on
// the bus tears the gateway down and starts over from the config file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use modgate::gateway::RunOutcome;
use modgate::tlog;

#[derive(Parser, Debug)]
#[command(name = "modgate", about = "Modbus TCP/RTU client gateway")]
struct Args {
    /// Gateway config file (JSON)
    config: PathBuf,

    /// Bus server address
    #[arg(long, default_value = "127.0.0.1:1735")]
    bus: String,

    /// Process name announced on the bus
    #[arg(long, default_value = "modgate")]
    name: String,

    /// Write logs to this directory in addition to stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Validate the config file and exit
    #[arg(long)]
    check: bool,

    /// Verbose connection logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(log_dir) = &args.log_dir {
        if let Err(e) = modgate::logging::init_file_logging(log_dir) {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    }

    loop {
        let cfg = match modgate::config::load_config(&args.config) {
            Ok(cfg) => std::sync::Arc::new(cfg),
            Err(e) => {
                tlog!("[modgate] Config error: {}", e);
                return ExitCode::FAILURE;
            }
        };

        if args.check {
            tlog!(
                "[modgate] Config OK: {} component(s), {} group(s), {} point(s)",
                cfg.components.len(),
                cfg.groups.len(),
                cfg.points.len()
            );
            return ExitCode::SUCCESS;
        }

        tlog!(
            "[modgate] Starting: {} → {} ({} worker(s))",
            args.config.display(),
            cfg.connection.transport.describe(),
            cfg.connection.max_num_connections
        );
        if args.debug || cfg.connection.debug {
            for comp in &cfg.components {
                tlog!(
                    "[modgate]   component {} ({} groups, every {} ms)",
                    comp.id,
                    comp.groups.len(),
                    comp.frequency_ms
                );
            }
        }

        match modgate::gateway::run(cfg, &args.bus, &args.name).await {
            Ok(RunOutcome::Reload) => {
                tlog!("[modgate] Reloading configuration");
                continue;
            }
            Ok(RunOutcome::Shutdown) => break,
            Err(e) => {
                tlog!("[modgate] Fatal: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}
