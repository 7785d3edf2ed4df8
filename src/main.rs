use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use lingocall::config::Config;
use lingocall::voice::Voice;

#[derive(Parser, Debug)]
#[command(name = "lingocall", version, about = "Realtime voice practice sessions")]
struct Cli {
    /// Config file (default: ~/.lingocall/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the credential issuance gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// List the voices the realtime model accepts
    Voices,
    /// Start a voice session from the terminal
    Call {
        #[arg(long)]
        voice: Option<Voice>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lingocall=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            lingocall::gateway::run_gateway(config).await
        }
        Commands::Voices => {
            for voice in Voice::all() {
                let marker = if *voice == config.session.voice { " (default)" } else { "" };
                println!("{voice}{marker}");
            }
            Ok(())
        }
        Commands::Call { voice } => {
            let voice = voice.unwrap_or(config.session.voice);
            call(config, voice).await
        }
    }
}

#[cfg(not(feature = "webrtc-native"))]
async fn call(_config: Config, _voice: Voice) -> Result<()> {
    anyhow::bail!("`lingocall call` requires building with --features webrtc-native")
}

#[cfg(feature = "webrtc-native")]
async fn call(config: Config, voice: Voice) -> Result<()> {
    use lingocall::archive::{ConversationArchive, JsonArchive};
    use lingocall::voice::webrtc::{OpusTrackSource, WebRtcTransportFactory};
    use lingocall::voice::{
        ConversationStatus, ConversationStore, CoordinatorConfig, EventBus,
        HttpCredentialBroker, HttpSdpExchange, NullAudioOutput, PeerConfig,
        PeerConnectionController, ProtocolEvent, Role, SessionCoordinator, Topic,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    let timeout = Duration::from_secs(config.session.http_timeout_secs);
    let broker = Arc::new(HttpCredentialBroker::new(
        &config.session.issuer_url,
        config.realtime.model.clone(),
        timeout,
    )?);
    let sdp = Arc::new(HttpSdpExchange::new(
        &config.realtime.api_base,
        &config.realtime.model,
        timeout,
    )?);
    let controller = PeerConnectionController::new(
        PeerConfig {
            ice_servers: config.realtime.ice_servers.clone(),
            data_channel_label: config.realtime.data_channel_label.clone(),
        },
        Arc::new(WebRtcTransportFactory::new()?),
        sdp,
        Arc::new(NullAudioOutput),
    );

    let bus = Arc::new(EventBus::new());
    let store = ConversationStore::init();
    store.attach(&bus);
    bus.subscribe(&[Topic::Transcript, Topic::Error], |event| match event {
        ProtocolEvent::TranscriptDone { role, text, .. } => {
            let who = match role {
                Role::User => "you",
                Role::Assistant => "tutor",
            };
            println!("{who}: {text}");
        }
        ProtocolEvent::ErrorNotice { message, .. } => eprintln!("error: {message}"),
        _ => {}
    });

    let coordinator = SessionCoordinator::new(
        CoordinatorConfig::from_config(&config),
        broker,
        Arc::new(OpusTrackSource::default()),
        controller,
        Arc::clone(&bus),
    );
    coordinator
        .start(voice)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start session: {e}"))?;
    println!("Connected with voice {voice}. Type to talk, /cancel to interrupt, /quit to end.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = store.status_changes();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.recv() => {
                if matches!(changed, Ok(ConversationStatus::Error)) {
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                let sent = match line {
                    "" => continue,
                    "/quit" => break,
                    "/cancel" => coordinator.cancel_response().await,
                    text => coordinator.send_text(text).await,
                };
                if let Err(e) = sent {
                    eprintln!("error: {e}");
                }
            }
        }
    }

    let session_id = coordinator.session_id();
    coordinator.stop().await;
    let messages = store.finish();
    JsonArchive::new(config.archive_dir()?)
        .save(&session_id, &messages)
        .await?;
    Ok(())
}
