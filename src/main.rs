use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use talkline::config::{self, AppConfig};
use talkline::events::CallEvent;
use talkline::media::{SyntheticMediaSource, TrackKind};
use talkline::relay::{LocalRelay, RelayHub, SignalRelay, WsRelay};
use talkline::webrtc::{
    CallHandle, CallIdentity, CallSession, ConnectionState, Role, RtcTransportFactory,
};

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

/// Talkline command line arguments
#[derive(Parser, Debug)]
#[command(name = "talkline")]
#[command(version, about = "One-on-one video call negotiation over a signal relay", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket signal relay
    Relay {
        /// Listen address (overrides config)
        #[arg(short = 'b', long, value_name = "ADDRESS")]
        bind: Option<String>,
    },
    /// Join a call with synthetic media
    Call {
        /// Relay WebSocket URL (overrides config)
        #[arg(long, value_name = "URL")]
        relay: Option<String>,
        #[arg(long)]
        request_id: String,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        remote_user_id: String,
        /// talker or listener
        #[arg(long)]
        role: Role,
    },
    /// Run a talker and a listener in-process and hang up once connected
    Demo {
        /// Seconds to wait for the connection
        #[arg(long, default_value_t = 20)]
        timeout: u64,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to this file
        #[arg(long, value_name = "FILE")]
        write: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting Talkline v{}", env!("CARGO_PKG_VERSION"));
    let config = config::load(args.config.as_deref()).await?;

    match args.command {
        Command::Relay { bind } => run_relay(config, bind).await,
        Command::Call {
            relay,
            request_id,
            user_id,
            remote_user_id,
            role,
        } => {
            let url = relay.unwrap_or_else(|| config.relay.url.clone());
            let identity = CallIdentity::new(request_id, user_id, remote_user_id, role);
            run_call(config, &url, identity).await
        }
        Command::Demo { timeout } => run_demo(config, Duration::from_secs(timeout)).await,
        Command::Config { write } => {
            if let Some(path) = write {
                config::save(&path, &config).await?;
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_relay(config: AppConfig, bind: Option<String>) -> anyhow::Result<()> {
    let bind = bind.unwrap_or(config.relay.bind);
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", bind))?;

    let hub = Arc::new(RelayHub::new());
    tokio::select! {
        result = talkline::relay::serve(addr, hub) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
    }

    tracing::info!("Relay shutdown complete");
    Ok(())
}

async fn run_call(config: AppConfig, url: &str, identity: CallIdentity) -> anyhow::Result<()> {
    let relay: Arc<dyn SignalRelay> = Arc::new(WsRelay::connect(url).await?);
    let call = start_call(&config, relay, identity).await?;
    let mut events = call.events();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Hanging up");
            call.hangup().await;
        }
        _ = call.closed() => {}
        _ = async {
            while let Ok(event) = events.recv().await {
                log_event(&call, &event);
            }
        } => {}
    }

    tracing::info!("Call finished");
    Ok(())
}

async fn run_demo(config: AppConfig, timeout: Duration) -> anyhow::Result<()> {
    let relay: Arc<dyn SignalRelay> = Arc::new(LocalRelay::new());
    let request_id = uuid::Uuid::new_v4().to_string();

    let listener = start_call(
        &config,
        relay.clone(),
        CallIdentity::new(&request_id, "listener", "talker", Role::Listener),
    )
    .await?;
    let talker = start_call(
        &config,
        relay,
        CallIdentity::new(&request_id, "talker", "listener", Role::Talker),
    )
    .await?;

    let connected = tokio::time::timeout(timeout, async {
        let mut talker_state = talker.connection_watch();
        let mut listener_state = listener.connection_watch();
        let _ = talker_state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await;
        let _ = listener_state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await;
    })
    .await
    .is_ok();

    if connected {
        tracing::info!("Both peers connected, hanging up from the talker");
    } else {
        tracing::warn!("Peers did not connect within {:?}", timeout);
    }

    talker.hangup().await;
    if tokio::time::timeout(Duration::from_secs(2), listener.closed())
        .await
        .is_err()
    {
        listener.close().await;
    }

    println!(
        "connected: {}, talker: {}, listener: {}",
        connected,
        talker.connection_state(),
        listener.connection_state()
    );
    if connected {
        Ok(())
    } else {
        Err(anyhow::anyhow!("demo call did not connect"))
    }
}

async fn start_call(
    config: &AppConfig,
    relay: Arc<dyn SignalRelay>,
    identity: CallIdentity,
) -> anyhow::Result<CallHandle> {
    let call = CallSession::new(
        identity,
        relay,
        Arc::new(RtcTransportFactory),
        Arc::new(SyntheticMediaSource::new()),
    )
    .with_config(config.session.clone())
    .with_rtc_config(config.ice.clone())
    .start()
    .await?;

    call.spawn_failure_hangup();
    Ok(call)
}

fn log_event(call: &CallHandle, event: &CallEvent) {
    let id = &call.identity().request_id;
    match event {
        CallEvent::ConnectionStateChanged(state) => {
            tracing::info!("Call {} connection {}", id, state)
        }
        CallEvent::RemoteStream(stream) => tracing::info!(
            "Call {} remote stream with {} tracks (audio: {}, video: {})",
            id,
            stream.tracks().len(),
            stream.has_kind(TrackKind::Audio),
            stream.has_kind(TrackKind::Video)
        ),
        CallEvent::Error(err) => tracing::warn!("Call {} error: {}", id, err),
        CallEvent::HungUp { initiator } => {
            tracing::info!("Call {} hung up ({:?})", id, initiator)
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "talkline=error,webrtc=error",
        LogLevel::Warn => "talkline=warn,webrtc=warn",
        LogLevel::Info => "talkline=info,webrtc=warn",
        LogLevel::Verbose => "talkline=debug,webrtc=warn",
        LogLevel::Debug => "talkline=debug,webrtc=info",
        LogLevel::Trace => "talkline=trace,webrtc=debug",
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
