use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use rustls::crypto::{ring, CryptoProvider};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_coach::audio::{enumerate_audio_devices, AlsaMicrophone, AlsaSpeakerBackend};
use voice_coach::coach::{ActiveCard, VoiceCoach, WsConnector};
use voice_coach::config::{ConfigStore, SAMPLE_RATE};
use voice_coach::events::CoachEvent;
use voice_coach::relay::{RealtimeConnector, RelayBridge};
use voice_coach::state::AppState;
use voice_coach::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// voice-coach command line arguments
#[derive(Parser, Debug)]
#[command(name = "voice-coach")]
#[command(version, about = "Realtime voice coach for flashcard study sessions", long_about = None)]
struct CliArgs {
    /// Listen address (overrides database config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides database config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Data directory path (default: /etc/voice-coach)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server (default)
    Serve {
        /// Upstream realtime endpoint (ws:// or wss://), stored in the config
        #[arg(long, value_name = "URL")]
        upstream_url: Option<String>,
        /// Environment variable holding the upstream credential, stored in the config
        #[arg(long, value_name = "NAME")]
        api_key_env: Option<String>,
    },
    /// Run a coaching session against a relay using local audio devices
    Coach {
        /// Relay WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:8080/api/relay")]
        url: String,
        /// Flashcard title to coach on
        #[arg(long)]
        title: Option<String>,
        /// Flashcard description
        #[arg(long, default_value = "")]
        description: String,
        /// Flashcard topic
        #[arg(long, default_value = "")]
        topic: String,
    },
    /// List ALSA capture and playback devices
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    // Install default crypto provider (required by rustls 0.23+)
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        tracing::warn!("rustls crypto provider already installed");
    }

    tracing::info!("Starting voice-coach v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);

    match args.command {
        None => serve(data_dir, args.address, args.http_port, UpstreamOverrides::default()).await,
        Some(Command::Serve {
            upstream_url,
            api_key_env,
        }) => {
            let overrides = UpstreamOverrides {
                url: upstream_url,
                api_key_env,
            };
            serve(data_dir, args.address, args.http_port, overrides).await
        }
        Some(Command::Coach {
            url,
            title,
            description,
            topic,
        }) => {
            let card = title.map(|title| ActiveCard::new(title, description, topic));
            coach(data_dir, url, card).await
        }
        Some(Command::Devices) => devices(),
    }
}

/// Upstream settings that can only be changed at startup
#[derive(Debug, Default)]
struct UpstreamOverrides {
    url: Option<String>,
    api_key_env: Option<String>,
}

async fn serve(
    data_dir: PathBuf,
    address: Option<String>,
    http_port: Option<u16>,
    overrides: UpstreamOverrides,
) -> anyhow::Result<()> {
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_store = open_config(&data_dir).await?;
    let mut web_config = config_store.get().web.clone();

    // CLI overrides are not persisted
    if let Some(addr) = address {
        web_config.bind_address = addr;
    }
    if let Some(port) = http_port {
        web_config.http_port = port;
    }

    if let Some(ref url) = overrides.url {
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            anyhow::bail!("Upstream URL must start with ws:// or wss://");
        }
    }
    if overrides.api_key_env.as_deref().is_some_and(|env| env.trim().is_empty()) {
        anyhow::bail!("Credential environment variable name must not be empty");
    }
    if overrides.url.is_some() || overrides.api_key_env.is_some() {
        config_store
            .update(|config| {
                if let Some(url) = overrides.url {
                    config.upstream.url = url;
                }
                if let Some(env) = overrides.api_key_env {
                    config.upstream.api_key_env = env.trim().to_string();
                }
            })
            .await?;
    }

    let config = config_store.get();
    let upstream = &config.upstream;
    tracing::info!("Upstream endpoint: {}", upstream.url);
    if upstream.credential().is_none() {
        tracing::warn!(
            "No upstream credential configured (set {} or PATCH /api/config/upstream); relays will be refused",
            upstream.api_key_env
        );
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let relay = RelayBridge::new(Arc::new(RealtimeConnector));
    let state = AppState::new(config_store, relay, shutdown_tx.clone());

    let app = web::create_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", web_config.bind_address, web_config.http_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on: http://{}", addr);

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!(
        "Server stopped ({} relays still registered)",
        state.relay.registry().active_count()
    );
    Ok(())
}

async fn coach(data_dir: PathBuf, url: String, card: Option<ActiveCard>) -> anyhow::Result<()> {
    let config_store = open_config(&data_dir).await?;
    let config = config_store.get();

    let microphone = AlsaMicrophone::new(
        config.audio.capture_device.clone(),
        SAMPLE_RATE,
        config.audio.period_frames,
    );
    let speaker = AlsaSpeakerBackend::new(
        config.audio.playback_device.clone(),
        SAMPLE_RATE,
        config.audio.period_frames,
    );

    let coach = VoiceCoach::new(
        Arc::new(WsConnector::new(url)),
        Arc::new(microphone),
        Arc::new(speaker),
        config.coach.clone(),
        &config.audio,
    );
    let mut events = coach.subscribe();

    if let Some(card) = card {
        coach.set_card(card).await?;
    }
    coach.enable().await?;
    tracing::info!("Coaching session active, press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping coaching session");
                break;
            }
            event = events.recv() => match event {
                Ok(CoachEvent::Error { message }) => {
                    tracing::error!("Coaching session ended: {}", message);
                    break;
                }
                Ok(event) => {
                    tracing::info!(event = event.event_name(), "{}", serde_json::to_string(&event)?);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} coach events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    coach.disable().await?;
    Ok(())
}

fn devices() -> anyhow::Result<()> {
    let devices = enumerate_audio_devices()?;
    for device in devices.iter().filter(|d| d.usable) {
        println!("{}", serde_json::to_string(device)?);
    }
    let skipped = devices.iter().filter(|d| !d.usable).count();
    if skipped > 0 {
        tracing::info!("{} devices cannot open mono f32 at {}Hz", skipped, SAMPLE_RATE);
    }
    Ok(())
}

async fn open_config(data_dir: &std::path::Path) -> anyhow::Result<ConfigStore> {
    let db_path = data_dir.join("voice-coach.db");
    Ok(ConfigStore::new(&db_path).await?)
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "voice_coach=error,tower_http=error",
        LogLevel::Warn => "voice_coach=warn,tower_http=warn",
        LogLevel::Info => "voice_coach=info,tower_http=info",
        LogLevel::Verbose => "voice_coach=debug,tower_http=info",
        LogLevel::Debug => "voice_coach=debug,tower_http=debug",
        LogLevel::Trace => "voice_coach=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("VOICE_COACH_DATA_DIR") {
        return PathBuf::from(path);
    }

    PathBuf::from("/etc/voice-coach")
}
