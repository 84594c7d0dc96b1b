use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use ruleway::{
    adapters::{HttpHandler, registry_from_config},
    config::{ServerConfigValidator, load_configuration, load_server_config},
    core::ConfigurationWatcher,
    metrics, tracing_setup,
    utils::GracefulShutdown,
};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "ruleway.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate the settings file and, optionally, a routes document
    Validate {
        /// Settings file to validate
        #[clap(short, long, default_value = "ruleway.yaml")]
        config: String,
        /// Routes document to compile
        #[clap(short, long)]
        routes: Option<PathBuf>,
    },
    /// Start the proxy (default)
    Serve {
        /// Settings file to use
        #[clap(short, long, default_value = "ruleway.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config, routes }) => validate_command(&config, routes),
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    let config = load_server_config(config_path)
        .wrap_err_with(|| format!("Failed to load settings from {config_path}"))?;

    tracing_setup::init_tracing_from_config(&config.log)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    ServerConfigValidator::validate(&config).wrap_err("Invalid settings")?;

    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .wrap_err_with(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let providers = registry_from_config(&config.providers)?;
    let handler = Arc::new(HttpHandler::new());

    let watcher = ConfigurationWatcher::new(providers);
    watcher.add_listener(handler.listener());
    watcher.start()?;

    let listener = TcpListener::bind(listen_addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {listen_addr}"))?;
    tracing::info!("Ruleway listening on {}", listen_addr);

    let graceful_shutdown = GracefulShutdown::new();
    let signal_task = {
        let graceful_shutdown = graceful_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = graceful_shutdown.run_signal_handler().await {
                tracing::error!("Signal handler failed: {:#}", e);
                graceful_shutdown.trigger();
            }
        })
    };

    let app = handler.clone().into_app();
    let shutdown_token = graceful_shutdown.token();
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
    .await
    .context("Server error");

    // the server can also end on its own error; make sure everything else stops
    graceful_shutdown.trigger();
    graceful_shutdown
        .drain("Configuration watcher", watcher.stop())
        .await;
    signal_task.abort();

    tracing::info!("Ruleway stopped");
    server_result
}

fn validate_command(config_path: &str, routes: Option<PathBuf>) -> Result<()> {
    println!("🔍 Validating settings file: {config_path}");

    let config = match load_server_config(config_path) {
        Ok(config) => {
            println!("✅ Settings parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Settings parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = ServerConfigValidator::validate(&config) {
        eprintln!("❌ Settings validation failed:");
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("✅ Settings validation: OK");
    println!("   • Listen Address: {}", config.listen_addr);
    if let Some(file) = &config.providers.file {
        println!("   • File provider: {}", file.path);
    }
    if let Some(http) = &config.providers.http {
        println!("   • HTTP provider: {} every {}", http.url, http.poll_interval);
    }

    let routes = routes.or_else(|| {
        config
            .providers
            .file
            .as_ref()
            .map(|file| PathBuf::from(&file.path))
    });
    if let Some(routes) = routes {
        println!("🔍 Validating routes document: {}", routes.display());
        let configuration = match load_configuration(&routes) {
            Ok(configuration) => configuration,
            Err(e) => {
                eprintln!("❌ Routes parsing failed:");
                eprintln!("   {e:#}");
                std::process::exit(1);
            }
        };
        if let Err(e) = ServerConfigValidator::validate_configuration(&configuration) {
            eprintln!("❌ Routes validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
        println!("✅ Routes: {} OK", configuration.routers.len());
    }

    println!("🎉 Configuration is valid and ready to use!");
    Ok(())
}
