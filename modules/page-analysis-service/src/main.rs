//! Page Analysis Service: standalone binary that runs AI page-analysis and
//! test-scenario sessions and streams their progress over SSE.
//!
//! Default: http://127.0.0.1:9110/

mod analyzer;
mod config;
mod db;
mod normalizer;
mod queue;
mod registry;
mod routes;
mod runner;
mod scenarios;
mod scripts;
mod session;
mod stream;

#[cfg(test)]
mod routes_tests;

use analyzer::ModelClient;
use config::Config;
use registry::SessionRegistry;
use routes::AppState;
use runner::AnalysisTaskRunner;
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Config::from_env();

    log::info!("Opening database at: {}", config.db_path);
    let database = Arc::new(db::Db::open(&config.db_path).expect("Failed to open database"));

    let model = ModelClient::from_config(&config).expect("Invalid model configuration");
    log::info!(
        "Model endpoint: {} (vision: {}, scenarios: {})",
        config.model_endpoint,
        config.vision_model,
        config.scenario_model
    );

    let registry = SessionRegistry::new();
    let runner = Arc::new(AnalysisTaskRunner::new(
        registry.clone(),
        Arc::new(model),
        database.clone(),
        config.session_timeout,
    ));

    let addr = config.bind_addr();
    let state = Arc::new(AppState {
        registry,
        runner,
        db: database,
        config,
        start_time: Instant::now(),
    });

    let cors = tower_http::cors::CorsLayer::permissive();
    let app = routes::router(state).layer(cors);

    log::info!("Page Analysis Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
