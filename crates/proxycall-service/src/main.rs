use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use proxycall_config::ConfigLoader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod service;

use service::ProxycallService;

#[derive(Parser)]
#[command(name = "proxycall-service")]
#[command(about = "Proxy number allocation and routing service", long_about = None)]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,

	#[arg(short, long, value_name = "FILE", default_value = "config/local.toml")]
	config: PathBuf,

	#[arg(long, env = "PROXYCALL_LOG_LEVEL", default_value = "info")]
	log_level: String,
}

#[derive(Subcommand)]
enum Commands {
	/// Start the proxycall service
	Start,
	/// Validate the configuration file
	Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	setup_tracing(&cli.log_level)?;

	match cli.command {
		Some(Commands::Start) | None => start_service(cli).await,
		Some(Commands::Validate) => validate_config(cli).await,
	}
}

async fn start_service(cli: Cli) -> Result<()> {
	info!("Starting proxycall service");
	info!("Loading configuration from: {:?}", cli.config);

	let config = ConfigLoader::new()
		.with_file(&cli.config)
		.load()
		.await
		.context("Failed to load configuration")?;

	info!("Configuration loaded successfully");
	info!("Service name: {}", config.service.name);
	info!("HTTP port: {}", config.service.http_port);

	let service = Arc::new(ProxycallService::from_config(&config));

	let sweep_interval = Duration::from_secs(config.service.sweep_interval_secs);
	let sweeper_handle = tokio::spawn(service.clone().run_expiry_sweeper(sweep_interval));

	let webhook_secret = config.telephony.webhook_secret.clone();
	let http_port = config.service.http_port;
	let http_service = service.clone();
	let http_handle =
		tokio::spawn(async move { api::serve(http_service, &webhook_secret, http_port).await });

	let shutdown_signal = setup_shutdown_signal();

	info!("Proxycall service started successfully");

	shutdown_signal.await;

	info!("Shutdown signal received, stopping services...");

	http_handle.abort();
	sweeper_handle.abort();

	info!("Proxycall service stopped");
	Ok(())
}

async fn validate_config(cli: Cli) -> Result<()> {
	info!("Validating configuration file: {:?}", cli.config);

	let config = ConfigLoader::new()
		.with_file(&cli.config)
		.load()
		.await
		.context("Failed to load configuration")?;

	info!("Configuration is valid");
	info!("Service name: {}", config.service.name);
	info!("HTTP port: {}", config.service.http_port);
	info!("Pool reservation TTL: {}s", config.pool.reservation_ttl_secs);
	info!("Order expiry age: {}s", config.orders.max_order_age_secs);
	info!("OTP length: {}", config.orders.otp_length);

	Ok(())
}

fn setup_tracing(log_level: &str) -> Result<()> {
	let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

	tracing_subscriber::registry()
		.with(env_filter)
		.with(tracing_subscriber::fmt::layer())
		.init();

	Ok(())
}

async fn setup_shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c()
			.await
			.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
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
}
