pub mod bridge;
pub mod config;
pub mod error;
pub mod mqtt;
pub mod persistence;
pub mod ui;

use crate::bridge::EventBridge;
use crate::config::AppConfig;
use crate::mqtt::client::BrokerClient;
use crate::mqtt::config::ConnectionProfile;
use crate::mqtt::rumqtt_client::RumqttClient;
use crate::persistence::json_store::JsonFileStore;
use crate::ui::App;
use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const LOG_FILE: &str = "mqttdeck.log";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load();
    let data_dir = config.data_dir();
    setup(&data_dir, config.log_level())?;
    info!("Starting mqttdeck, data in {}", data_dir.display());

    let store = JsonFileStore::open(&data_dir)
        .map_err(|e| eyre!("Failed to open data directory: {}", e))?;

    let (bridge, events) = EventBridge::channel();

    let settings = config.client_settings();
    let client_bridge = bridge.clone();
    let connect = Box::new(move |profile: &ConnectionProfile| -> Arc<dyn BrokerClient> {
        Arc::new(RumqttClient::new(
            profile.clone(),
            settings.clone(),
            client_bridge.clone(),
        ))
    });

    let app = App::new(&config, Arc::new(store), bridge, connect);
    app.run(events).await?;

    info!("mqttdeck stopped");
    Ok(())
}

fn setup(data_dir: &Path, level: Level) -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging(data_dir, level)
}

/// Logs go to a daily file, stdout belongs to the UI
fn setup_logging(data_dir: &Path, level: Level) -> Result<()> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;
    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(appender)
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
    Ok(())
}
