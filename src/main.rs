use std::process::ExitCode;

use tracing::{error, info};

use warden::{Config, Database, ScriptEngine};

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());

    // Load configuration
    let config = match Config::load_with_env(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = warden::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        warden::logging::init_console_only(&config.logging.level);
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> warden::Result<()> {
    config.validate()?;
    info!("Warden - sandboxed script execution engine");

    let db = Database::open(&config.database.path).await?;
    let engine = ScriptEngine::with_database(&config, &db)?;
    let loaded = engine.start().await?;
    info!(
        "{} scripts active, {} interpreters pre-warmed",
        loaded,
        config.engine.pool_size
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    engine.stop();
    db.close().await;
    Ok(())
}
