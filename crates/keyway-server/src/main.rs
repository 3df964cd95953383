//! Keyway: orchestrator delegating tasks to tenant-protected backends.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use keyway_core::KeywayConfig;
use keyway_server::{build_router, AppState};

fn resolve_data_dir() -> PathBuf {
    std::env::var("KEYWAY_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let exe_dir = std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.to_path_buf()));
            if let Some(dir) = exe_dir {
                let parent_data = dir.join("../data");
                if parent_data.exists() {
                    return parent_data;
                }
            }
            PathBuf::from("data")
        })
}

fn print_help() {
    println!("Keyway: task orchestrator with per-tenant OAuth2 delegation");
    println!();
    println!("Usage: keyway [command]");
    println!();
    println!("Commands:");
    println!("  (none)                   Start the server");
    println!("  sweep [days]             Fail tasks awaiting login for longer than [days]");
    println!("                           and prune expired login states");
    println!("  help                     Show this help message");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let data_dir = resolve_data_dir();

    if args.len() > 1 {
        match args[1].as_str() {
            "sweep" => {
                let config = KeywayConfig::from_env(&data_dir)?;
                let days = match args.get(2) {
                    Some(days) => days
                        .parse::<i64>()
                        .map_err(|_| anyhow::anyhow!("Invalid retention '{}': expected days", days))?,
                    None => config.awaiting_retention_days as i64,
                };
                let state = AppState::open(config)
                    .map_err(|e| anyhow::anyhow!("Failed to open state: {}", e))?;
                let report = state.orchestrator.sweep(chrono::Duration::days(days))?;
                println!(
                    "Failed {} abandoned tasks, pruned {} login states",
                    report.failed_tasks, report.pruned_states
                );
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}. Use 'keyway help' for usage.", args[1]);
                std::process::exit(1);
            }
        }
    }

    info!("Data directory: {}", data_dir.display());

    let config = KeywayConfig::from_env(&data_dir)?;
    let port = config.port;
    info!("Identity provider: {}", config.provider.authorization_endpoint);

    let state = Arc::new(
        AppState::open(config).map_err(|e| anyhow::anyhow!("Failed to open state: {}", e))?,
    );

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Keyway orchestrator listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
