use anyhow::{Context, Result};
use roadvision_core::config::{parse as parse_config_file, AppSettings, RoadvisionConfig};
use roadvision_core::inference::capture::FfmpegFrameSource;
use roadvision_core::inference::detector::{CommandDetector, Detector, UnavailableDetector};
use roadvision_core::manager::{StreamManager, StreamManagerError};
use roadvision_http_api::{start_http_api, stream_routes, HttpApiShutdownSignal};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot::Sender;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, layer::SubscriberExt};

const CONFIG_PATH_VARIABLE: &str = "ROADVISION_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "roadvision.config";

#[tokio::main]
pub async fn main() -> Result<()> {
    // Start logging
    let log_dir = get_log_directory()?;
    let app_log_path = log_dir.join("application");

    let log_level = match env::var("roadvision_log") {
        Ok(level) => match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            "trace" => Level::TRACE,
            _ => Level::INFO,
        },

        Err(_) => Level::INFO,
    };

    let appender = tracing_appender::rolling::hourly(app_log_path.clone(), "application.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(appender);
    let stdout_writer = std::io::stdout.with_max_level(log_level);
    let json_writer = non_blocking.with_max_level(log_level);

    let subscriber = tracing_subscriber::registry()
        .with(fmt::Layer::new().with_writer(stdout_writer).pretty())
        .with(fmt::Layer::new().with_writer(json_writer).json());

    tracing::subscriber::set_global_default(subscriber)
        .context("Unable to set a global collector")?;

    info!("roadvision {} started", env!("CARGO_PKG_VERSION"));
    info!("Logging to {}", app_log_path.display());

    let config = read_config()?;
    let settings = AppSettings::from_config(&config, &log_dir)?;
    let manager = start_manager(&settings);
    register_configured_streams(&config, &manager).await;
    let http_api_shutdown = start_api(&settings, &manager)?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install ctrl+c signal handler")?;

    info!("Shutdown requested");
    if let Some(sender) = http_api_shutdown {
        let _ = sender.send(HttpApiShutdownSignal {});
    }

    manager.shutdown().await;

    Ok(())
}

fn read_config() -> Result<RoadvisionConfig> {
    let path = env::var(CONFIG_PATH_VARIABLE).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    if !Path::new(&path).exists() {
        warn!("No config file found at '{}', using default settings", path);
        return Ok(RoadvisionConfig {
            settings: Default::default(),
            streams: Vec::new(),
        });
    }

    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read '{}'", path))?;

    parse_config_file(contents.as_str()).with_context(|| format!("Failed to parse '{}'", path))
}

fn get_log_directory() -> Result<PathBuf> {
    let log_dir = "logs";
    let mut log_path = PathBuf::from(log_dir);
    if log_path.is_relative() {
        log_path = env::current_dir().context("Failed to get current directory")?;
        log_path.push(log_dir);
    }

    Ok(log_path)
}

fn start_manager(settings: &AppSettings) -> StreamManager {
    let detector: Arc<dyn Detector> = match &settings.detector_path {
        Some(path) => match CommandDetector::new(path.clone(), Vec::new()) {
            Ok(detector) => {
                info!("Using detection model at '{}'", path);
                Arc::new(detector)
            }

            Err(error) => {
                warn!("{}, streams will not be analyzed", error);
                Arc::new(UnavailableDetector)
            }
        },

        None => {
            warn!("No detector_path configured, streams will not be analyzed");
            Arc::new(UnavailableDetector)
        }
    };

    let frame_source = Arc::new(FfmpegFrameSource::new(
        settings.capture_path.clone(),
        settings.capture_timeout,
    ));

    info!(
        "Writing transcoder output to '{}'",
        settings.manager.transcoder.output_root.display()
    );

    StreamManager::new(settings.manager.clone(), frame_source, detector)
}

async fn register_configured_streams(config: &RoadvisionConfig, manager: &StreamManager) {
    for definition in &config.streams {
        let result = manager
            .add_stream(definition.name.clone(), definition.source.clone())
            .await;

        match result {
            Ok(stream) => info!(
                "Configured stream '{}' registered with id {}",
                definition.name,
                stream.id()
            ),

            // The stream is still tracked, so this is not fatal
            Err(StreamManagerError::LaunchFailure { id, error }) => error!(
                "Configured stream '{}' ({}) could not be transcoded: {:?}",
                definition.name, id, error
            ),

            Err(error) => error!(
                "Configured stream '{}' could not be registered: {}",
                definition.name, error
            ),
        }
    }
}

fn start_api(
    settings: &AppSettings,
    manager: &StreamManager,
) -> Result<Option<Sender<HttpApiShutdownSignal>>> {
    let address = match settings.http_api_address {
        Some(address) => address,
        None => {
            info!("No http_api_port specified, the HTTP api is disabled");
            return Ok(None);
        }
    };

    let routes = stream_routes(manager.clone()).context("Failed to register HTTP routes")?;
    let sender = start_http_api(address, routes)
        .with_context(|| format!("Failed to start the HTTP api on {}", address))?;

    Ok(Some(sender))
}
