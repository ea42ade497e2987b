mod handlers;
mod route;

use crate::route::create_router;
use axum::http::{Method, header::CONTENT_TYPE};
use clap::Parser;
use kioku::config::{Environment, SyncTuning, get_data_dir, get_env_config, read_sync_tuning};
use sqlx::{
    Sqlite,
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

#[derive(Debug)]
struct AppState {
    pub db: SqlitePool,
    pub tuning: SyncTuning,
}

async fn start_server(args: Args) -> Result<(), String> {
    // Create directory for database file, if it doesn't exist
    let _ = get_data_dir();

    let env_config = get_env_config(args.environment);
    if Sqlite::database_exists(env_config.database_url.as_str())
        .await
        .unwrap_or(false)
    {
        log::info!("Database already exists. Skipping creation.");
    } else {
        log::info!("Creating database: {}", env_config.database_url);
        Sqlite::create_database(env_config.database_url.as_str())
            .await
            .map_err(|e| e.to_string())?;
    }

    let pool = SqlitePoolOptions::new()
        .max_lifetime(None)
        .idle_timeout(None)
        .connect(&env_config.database_url)
        .await
        .map_err(|e| format!("Failed to connect to the database: {:?}", e))?;
    kioku::MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| format!("Failed to migrate the database: {:?}", e))?;

    let tuning = read_sync_tuning().map_err(|e| e.to_string())?;
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers([CONTENT_TYPE]);
    let app = create_router(Arc::new(AppState { db: pool, tuning })).layer(cors);
    let listener = TcpListener::bind(&env_config.socket_address)
        .await
        .map_err(|e| e.to_string())?;
    log::info!("Starting server at {:?}", env_config.socket_address);
    axum::serve(listener, app.into_make_service())
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

/// Kioku sync server
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = Environment::Production)]
    environment: Environment,
}

#[tokio::main(worker_threads = 5)]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    let res = start_server(args).await;
    if let Err(e) = res {
        eprintln!("{}", e);
    }
}
