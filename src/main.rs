//! CLI for smsgate
//!
//! Subcommands:
//! - `server`: run the gateway (store, dispatcher, modems, WebSocket API)
//! - `send`: submit one message to a running gateway
//! - `logs`: print the store overview of a running gateway

use clap::Parser;
use smsgate::client::GatewayClient;
use smsgate::config::{Settings, load_config, load_config_file};
use smsgate::dispatcher::Dispatcher;
use smsgate::modem::Connection;
use smsgate::modem::at::AtModem;
use smsgate::persistence::SledStore;
use smsgate::transport::websocket::start_websocket_server;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "smsgate")]
enum Command {
    /// Run the gateway until Ctrl-C, then drain in-flight messages
    Server {
        /// Configuration file (default: config/default.toml if present)
        #[arg(long)]
        config: Option<String>,
    },
    /// Submit a message through a running gateway
    Send {
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long)]
        mobile: String,
        #[arg(long)]
        message: String,
    },
    /// Print status summary, daily counts and all messages
    Logs {
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
    },
}

#[tokio::main]
async fn main() {
    // a missing .env is fine
    let _ = dotenvy::dotenv();
    smsgate::utils::logging::init("info");

    let cmd = Command::parse();

    match cmd {
        Command::Server { config } => {
            if let Err(e) = run_server(config.as_deref()).await {
                error!("Server failed: {}", e);
                std::process::exit(1);
            }
        }
        Command::Send {
            url,
            mobile,
            message,
        } => {
            if let Err(e) = run_send(&url, &mobile, &message).await {
                error!("Send failed: {}", e);
                std::process::exit(1);
            }
        }
        Command::Logs { url } => {
            if let Err(e) = run_logs(&url).await {
                error!("Logs failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config: Settings = match config_path {
        Some(path) => load_config_file(path)?,
        None => load_config()?,
    };
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let store = SledStore::open(&config.store.path)?;
    let cancel = CancellationToken::new();

    let (dispatcher, handle, submitter) = Dispatcher::new(
        store.clone(),
        config.dispatcher.pool_size,
        config.dispatcher.pool_low,
    );
    let dispatcher = dispatcher.with_drain_timeout(config.dispatcher.drain_timeout());
    let dispatcher_task = tokio::spawn(dispatcher.run(cancel.clone(), config.dispatcher.poll_interval()));

    let connection_settings = config.modem.connection_settings();
    let modems: Vec<_> = config
        .devices
        .iter()
        .map(|device| {
            Connection::new(
                device.id.clone(),
                AtModem::new(device.address.clone()),
                connection_settings.clone(),
            )
            .connect(cancel.clone(), handle.clone())
        })
        .collect();
    if modems.is_empty() {
        info!("No devices configured, messages will queue until one is added.");
    }
    drop(handle);

    let server = tokio::spawn(start_websocket_server(
        addr,
        submitter,
        store.clone(),
        cancel.clone(),
    ));

    tokio::select! {
        result = server => match result {
            Ok(Ok(())) => error!("WebSocket server exited unexpectedly."),
            Ok(Err(e)) => error!("WebSocket server failed: {}", e),
            Err(e) => error!("WebSocket server task failed: {}", e),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Draining.");
        }
    }

    cancel.cancel();
    dispatcher_task.await?;
    for modem in modems {
        modem.await?;
    }
    store.flush().await?;
    info!("Shutdown complete.");
    Ok(())
}

async fn run_send(url: &str, mobile: &str, message: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = GatewayClient::connect(url).await?;
    let uuid = client.send_sms(mobile, message).await?;
    println!("{uuid}");
    client.close().await?;
    Ok(())
}

async fn run_logs(url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = GatewayClient::connect(url).await?;
    let report = client.logs().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    client.close().await?;
    Ok(())
}
