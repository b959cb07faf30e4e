use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use cli::{Command, HealthCheckArgs};
use config::FinalConfig;
use controller::create_router;
use cyder_tools::log::{error, info, LocalLogger};
use service::Runtime;
use tower_http::cors::CorsLayer;

mod cli;
mod config;
mod controller;
mod database;
mod proxy;
mod schema;
mod service;
mod utils;

fn load_config(path: Option<&std::path::Path>) -> Option<FinalConfig> {
    match FinalConfig::load(path) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("failed to load config: {}", e);
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
}

async fn serve(config: FinalConfig) -> ExitCode {
    LocalLogger::init(&config.log_level);
    let addr = format!("{}:{}", &config.host, config.port);
    let runtime = match Runtime::build(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };
    runtime.spawn_background();

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    info!("server start at {}", &addr);
    let app = create_router(runtime.clone())
        .layer(CorsLayer::permissive())
        .with_state(runtime)
        .into_make_service_with_connect_info::<SocketAddr>();
    match axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        Ok(()) => {
            info!("server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn health_check(mut config: FinalConfig, args: HealthCheckArgs) -> ExitCode {
    args.apply(&mut config);
    LocalLogger::init(&config.log_level);
    let runtime = match Runtime::build(config).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.interval_secs == 0 {
        return match runtime.health.run_once(utils::now_secs()).await {
            Ok(report) => {
                info!("health check finished: {:?}", report);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("health check failed: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = runtime.health.run_once(utils::now_secs()).await {
                    error!("health check failed: {}", e);
                }
            }
            _ = &mut shutdown => {
                info!("health check stopped");
                return ExitCode::SUCCESS;
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let command = match cli::parse(std::env::args_os().skip(1).collect()) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}", e);
            cli::print_help();
            return ExitCode::from(2);
        }
    };
    match command {
        Command::Help => {
            cli::print_help();
            ExitCode::SUCCESS
        }
        Command::Serve { config } => match load_config(config.as_deref()) {
            Some(config) => serve(config).await,
            None => ExitCode::FAILURE,
        },
        Command::HealthCheck(args) => match load_config(args.config.as_deref()) {
            Some(config) => health_check(config, args).await,
            None => ExitCode::FAILURE,
        },
    }
}
