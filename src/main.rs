mod bot;
mod config;
mod convert;
mod model;
mod notify;
mod parser;
mod probe;
mod scheduler;
mod session;
mod store;
mod synth;
mod web;

use notify::Notifier;
use session::{Prober, SessionManager};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use store::Store;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut config_path = "config.json".to_string();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-d" => {
                if i + 1 < args.len() {
                    let dir = &args[i + 1];
                    if let Err(e) = env::set_current_dir(dir) {
                        eprintln!("Failed to change directory to {}: {}", dir, e);
                        std::process::exit(1);
                    }
                    i += 1;
                } else {
                    eprintln!("Missing argument for -d");
                    std::process::exit(1);
                }
            }
            "-c" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 1;
                } else {
                    eprintln!("Missing argument for -c");
                    std::process::exit(1);
                }
            }
            _ => {}
        }
        i += 1;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "proxywatch=info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 1. Load configuration
    let app_config = match config::load_config(&PathBuf::from(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return;
        }
    };

    // 2. Build the store and seed it
    let store = Arc::new(Store::new());
    if let Some(alert) = app_config.alert.clone() {
        store.update_settings(|s| *s = alert);
    }
    for link in &app_config.links {
        match parser::parse_link(link) {
            Ok(parsed) => {
                let endpoint = store.insert(parsed);
                tracing::info!("registered endpoint {} ({})", endpoint.id, endpoint.name);
            }
            Err(e) => tracing::warn!("skipping configured link: {}", e),
        }
    }

    // 3. Shared plumbing
    let sessions = Arc::new(SessionManager::new(app_config.engine.clone()));
    let prober: Arc<dyn Prober> = sessions.clone();
    let notifier = Arc::new(Notifier::new(
        store.clone(),
        prober.clone(),
        app_config.engine.request_timeout(),
    ));
    let (shutdown_tx, _) = broadcast::channel(1);

    // 4. Background health-check scheduler
    let check_loop = scheduler::Scheduler::new(
        store.clone(),
        prober.clone(),
        notifier.clone(),
        app_config.engine.test_url.clone(),
        app_config.engine.request_timeout(),
    );
    tokio::spawn(check_loop.run(shutdown_tx.subscribe()));

    // 5. Command bot poller
    let command_bot = bot::CommandBot::new(
        store.clone(),
        notifier.clone(),
        prober.clone(),
        app_config.engine.test_url.clone(),
        app_config.engine.request_timeout(),
    );
    tokio::spawn(command_bot.run(shutdown_tx.subscribe()));

    // 6. Live-monitor server
    let app_state = web::AppState {
        sessions,
        shutdown_tx: shutdown_tx.clone(),
    };

    let app = web::app(app_state);
    let listener = match tokio::net::TcpListener::bind(&app_config.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", app_config.listen, e);
            return;
        }
    };
    tracing::info!("Live monitor listening on http://{}", app_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .unwrap();
}

async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping background tasks...");
    let _ = shutdown_tx.send(());
}
