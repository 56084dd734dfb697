use std::sync::Arc;
use std::time::Duration;

use curfew::api;
use curfew::config::{self, Config};
use curfew::engine::{AccessEngine, EngineOptions};
use curfew::store::JsonFileStore;
use curfew::upstream::{HttpFirewall, HttpWirelessController, WebhookNotifier};
use curfew::utils::logging;
use curfew::{error, info};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init_from_config(&config.log_level, config.log_file.as_deref()).await {
        println!("Failed to initialize logger: {}", e);
    } else {
        info!("Logger initialized at level {}", config.log_level);
    }

    let subjects = match config::load_subjects(&config.subjects_path).await {
        Ok(subjects) => subjects,
        Err(e) => {
            eprintln!("Failed to load subjects: {}", e);
            std::process::exit(1);
        }
    };
    info!("Managing {} subject(s)", subjects.len());

    let firewall = match HttpFirewall::new(
        &config.firewall_url,
        &config.firewall_api_key,
        config.http_timeout_secs,
    ) {
        Ok(firewall) => Arc::new(firewall),
        Err(e) => {
            eprintln!("Failed to build firewall client: {}", e);
            std::process::exit(1);
        }
    };
    let wireless = match HttpWirelessController::new(
        &config.wireless_url,
        &config.wireless_api_key,
        config.http_timeout_secs,
    ) {
        Ok(wireless) => Arc::new(wireless),
        Err(e) => {
            eprintln!("Failed to build wireless client: {}", e);
            std::process::exit(1);
        }
    };
    let notifier = Arc::new(WebhookNotifier::new(
        config.notify_url.clone(),
        config.http_timeout_secs,
    ));
    let store = match JsonFileStore::open(&config.state_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("Failed to open state file: {}", e);
            std::process::exit(1);
        }
    };

    let options = EngineOptions {
        excluded_macs: config.excluded_macs.clone(),
        ..EngineOptions::default()
    };
    let engine = match AccessEngine::new(
        subjects,
        firewall.clone(),
        firewall,
        wireless,
        notifier,
        store,
        options,
    )
    .await
    {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Failed to initialize engine: {}", e);
            std::process::exit(1);
        }
    };

    // Startup reconciliation pass, then the periodic worker
    match engine.run_tick().await {
        Ok(corrected) => info!("Startup reconciliation corrected {} subject(s)", corrected),
        Err(e) => error!("Startup reconciliation failed: {}", e),
    }
    engine.spawn_reconciliation_loop(Duration::from_secs(config.tick_secs));

    info!("Control API listening on {}", config.listen_addr);
    api::serve(engine, config.listen_addr).await;

    Ok(())
}
