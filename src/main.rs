use std::io::Write;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use tokio::signal;
use tokio::signal::unix::SignalKind;

use lightscene::backend::hass::HassBackend;
use lightscene::backend::hass::applier::HassApplier;
use lightscene::backend::hass::client::HassClient;
use lightscene::backend::hass::publisher::HassPublisher;
use lightscene::backend::hass::source::HassSceneSource;
use lightscene::config;
use lightscene::error::ApiResult;
use lightscene::scene::SceneSource;
use lightscene::scene::event::{EventBus, PlatformEvent};
use lightscene::scene::manager::SceneManager;
use lightscene::scene::source::YamlSceneSource;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: Utf8PathBuf,
}

/*
 * Formatter function to output in syslog format. This makes sense when running
 * as a service (where output might go to a log file, or the system journal)
 */
#[allow(clippy::match_same_arms)]
fn syslog_format(
    buf: &mut pretty_env_logger::env_logger::fmt::Formatter,
    record: &log::Record,
) -> std::io::Result<()> {
    writeln!(
        buf,
        "<{}>{}: {}",
        match record.level() {
            log::Level::Error => 3,
            log::Level::Warn => 4,
            log::Level::Info => 6,
            log::Level::Debug => 7,
            log::Level::Trace => 7,
        },
        record.target(),
        record.args()
    )
}

fn init_logging() -> ApiResult<()> {
    /* Try to provide reasonable default filters, when RUST_LOG is not specified */
    const DEFAULT_LOG_FILTERS: &[&str] = &[
        "debug",
        "hyper_util=info",
        "reqwest=info",
        "tungstenite=info",
        "tokio_tungstenite=info",
    ];

    let log_filters = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTERS.join(","));

    /* Detect if we need syslog or human-readable formatting */
    if std::env::var("SYSTEMD_EXEC_PID").is_ok_and(|pid| pid == std::process::id().to_string()) {
        Ok(pretty_env_logger::env_logger::builder()
            .format(syslog_format)
            .parse_filters(&log_filters)
            .try_init()?)
    } else {
        Ok(pretty_env_logger::formatted_timed_builder()
            .parse_filters(&log_filters)
            .try_init()?)
    }
}

fn install_signal_handlers(bus: &EventBus) -> ApiResult<()> {
    fn shutdown(msg: &str, bus: &EventBus) {
        log::warn!("{msg}");
        let _ = std::io::stderr().flush();
        bus.send(PlatformEvent::Shutdown);
    }

    let ctrl_c_bus = bus.clone();
    tokio::spawn(async move {
        if matches!(signal::ctrl_c().await, Ok(())) {
            shutdown("Ctrl-C pressed, exiting..", &ctrl_c_bus);
        }
    });

    let term_bus = bus.clone();
    let mut signal = signal::unix::signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        if matches!(signal.recv().await, Some(())) {
            shutdown("SIGTERM received, exiting..", &term_bus);
        }
    });

    Ok(())
}

async fn run() -> ApiResult<()> {
    let args = Args::parse();

    init_logging()?;

    let config = config::parse(&args.config)?;
    log::debug!("Configuration loaded successfully");

    let mut client = HassClient::new("hass", &config.hass)?;
    client.load_token_from_env()?;
    let client = Arc::new(client);

    let source: Arc<dyn SceneSource> = match &config.lightscene.scenes_file {
        Some(file) => {
            log::info!("Loading scenes from {file}");
            Arc::new(YamlSceneSource::new(file.clone()))
        }
        None => Arc::new(HassSceneSource::new(client.clone())),
    };

    let bus = EventBus::new();

    let mut manager = SceneManager::new(
        config.lightscene,
        source,
        Arc::new(HassApplier::new(client.clone())),
        Arc::new(HassPublisher::new(client.clone())),
        bus.clone(),
    );

    install_signal_handlers(&bus)?;

    if let Err(err) = manager.discover().await {
        log::error!("Initial scene discovery failed: {err}");
        bus.send(PlatformEvent::SceneReloaded);
    }

    let backend = tokio::spawn(HassBackend::new(client, bus.clone()).run());

    manager.run().await?;
    backend.await??;

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        log::error!("Lightscene error: {err}");
        log::error!("Fatal error encountered, cannot continue.");
    }
}
