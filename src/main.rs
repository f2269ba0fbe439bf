use std::sync::Arc;

use clap::Parser;
use remaprt::path::Path;
use remaprt::probe::ProbeEngine;
use remaprt::prober::Prober;
use remaprt::{Args, Remap, Result};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.logbase) {
        eprintln!("cannot open log file {}.log: {e}", args.logbase);
        std::process::exit(1);
    }

    match run(args).await {
        Ok(line) => println!("{line}"),
        Err(e) => {
            error!(error = %e, "remap failed");
            println!("remap failed.");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<String> {
    info!(dst = %args.dst, ttl = args.ttl, "starting remap");
    let old_path = Path::from_hops(&args.old_path, args.dst)?;

    let remap = match &args.new_path {
        Some(new_hopstr) => {
            info!("offline replay, no probes will be sent");
            let new_path = Path::from_hops(new_hopstr, args.dst)?;
            Remap::offline(old_path, new_path, args.ttl)
        }
        None => {
            check_permissions()?;
            let oracle = ProbeEngine::spawn(&args.iface, args.dst, args.icmpid)?;
            Remap::online(old_path, Prober::spawn(oracle), args.ttl)
        }
    };

    // The driver blocks on the prober's handoff, so it gets its own
    // thread; the oracle and prober tasks stay on the runtime.
    Ok(tokio::task::spawn_blocking(move || remap.run()).await??)
}

fn check_permissions() -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        anyhow::bail!("you must be root to run this program");
    }
    Ok(())
}

fn init_logging(logbase: &str) -> Result<()> {
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(format!("{logbase}.log"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("remaprt=debug")),
        )
        .with_writer(Arc::new(log_file))
        .with_ansi(false)
        .init();
    Ok(())
}
