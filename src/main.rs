//! Plugin Host Harness - CLI Entry Point
//!
//! Inspects harness configuration files; the harness itself runs inside
//! browser tests.

use anyhow::Result;
use clap::Parser;
use plugin_host_harness::channel::InitPayload;
use plugin_host_harness::{HarnessConfig, MockResolutionEngine};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "plugin-host-harness",
    about = "Host simulator for iframe plugin tests - request mocks and host handshake",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "plugin-host-harness.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Print the route keys the configured mocks register
    #[arg(long)]
    print_routes: bool,

    /// Print the init event delivered to the plugin
    #[arg(long)]
    print_init: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let default_config = include_str!("../demos/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        HarnessConfig::from_file(&args.config)?
    } else if args.validate || args.print_routes {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no mocks)");
        HarnessConfig::default()
    };

    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} mocks defined for plugin {})",
            config.mocks.len(),
            config.plugin_id
        );
        return Ok(());
    }

    if args.print_routes {
        let engine = MockResolutionEngine::new(config.settings.clone());
        for def in &config.mocks {
            engine.register_definition(&config.origins, def)?;
        }
        for key in engine.route_keys() {
            println!("{} ({} mocks)", key, engine.bucket_len(&key));
        }
        return Ok(());
    }

    if args.print_init {
        let payload = InitPayload::from_config(&config);
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    info!(
        plugin_id = %config.plugin_id,
        backend = %config.origins.backend,
        data = %config.origins.data,
        mocks = config.mocks.len(),
        "Configuration loaded; use --validate, --print-routes or --print-init"
    );
    Ok(())
}
