mod cli;

use galleryd::{config, hooks::HookRegistry, server, App};
use galleryd_db::pool::{get_conn, init_pool};
use galleryd_db::queries::registrations;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};

async fn start(
    host: Option<String>,
    port: Option<u16>,
    root: Option<PathBuf>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(root) = root {
        config.watch.root = root;
    }
    config::validate_config(&config)?;

    tracing::info!("Starting galleryd");
    tracing::info!(root = %config.watch.root.display(), "Watching generation outputs");

    let listener = server::bind(&config.server.host, config.server.port).await?;
    let mut app = App::start(config).await?;
    app.serve(listener);

    tokio::select! {
        _ = server::shutdown_signal() => {}
        _ = app.stopped() => {}
    }

    app.shutdown().await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "galleryd=trace,galleryd_db=debug,galleryd_common=debug,tower_http=debug".to_string()
        } else {
            "galleryd=debug,galleryd_db=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(env_filter))
        .init();

    match cli.command {
        Commands::Start { host, port, root } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start(host, port, root, cli.config.as_deref()))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Hooks => list_hooks(cli.config.as_deref()),
        Commands::Stats => print_stats(cli.config.as_deref()),
        Commands::Version => {
            println!("galleryd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            config::load_config(p)?
        }
        None => {
            println!("No config file specified, checking default locations");
            config::load_config_or_default(None)?
        }
    };

    println!("✓ Configuration is valid");
    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Watch root: {}", config.watch.root.display());
    println!("  Watch enabled: {}", config.watch.enabled);
    println!("  Extensions: {}", config.watch.image_extensions().join(", "));
    println!("  Queue capacity: {}", config.ingest.queue_capacity);
    println!("  Removal grace: {}s", config.ingest.removal_grace_secs);
    println!("  Builtin hooks: {}", config.hooks.builtin.join(", "));
    if let Some(ref dir) = config.hooks.dir {
        println!("  Hook directory: {}", dir.display());
    }
    println!(
        "  Thumbnails: {}px q{} ({} workers)",
        config.thumbnails.size,
        config.thumbnails.quality,
        config.thumbnails.worker_count()
    );
    println!("  Database: {}", config.db_path().display());
    println!(
        "  Event signatures: {}",
        if config.server.event_secret.is_some() { "required" } else { "off" }
    );
    Ok(())
}

fn list_hooks(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let registry = HookRegistry::from_config(&config.hooks);

    for hook in registry.describe() {
        let marker = if hook.active { "✓" } else { "✗" };
        print!("{} {} [{}]", marker, hook.name, hook.kind);
        if let Some(reason) = hook.reason {
            print!(" - {}", reason);
        }
        println!();
    }
    if registry.is_empty() {
        println!("No active hooks; records will carry empty metadata.");
    }
    Ok(())
}

fn print_stats(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let db_path = config.db_path();
    if !db_path.exists() {
        anyhow::bail!("No database at {}", db_path.display());
    }
    let pool = init_pool(&db_path).context("Failed to open registration database")?;
    let conn = get_conn(&pool)?;
    let stats = registrations::registration_stats(&conn)?;

    println!("Registrations: {}", stats.total);
    println!("  Liked: {}", stats.liked);
    println!("  Disliked: {}", stats.disliked);
    println!("  Flagged: {}", stats.flagged);
    println!("  Pending removal: {}", stats.pending_removal);
    println!(
        "Thumbnails: {} ready, {} failed",
        stats.thumbnails_ready, stats.thumbnails_failed
    );
    Ok(())
}
