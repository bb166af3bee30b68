use anyhow::{Context, Result};
use catalyst_voice::integration::VoiceConfig;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "catalyst-voice",
    about = "Stream the microphone to a Catalyst voice service and play its replies",
    version
)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base WebSocket endpoint
    #[arg(long, env = "CATALYST_WS_URL")]
    url: Option<String>,

    #[arg(long, env = "CATALYST_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "CATALYST_TENANT_ID")]
    tenant_id: Option<String>,

    /// Knowledge-base namespace for new sessions
    #[arg(long)]
    namespace: Option<String>,

    #[arg(long)]
    sample_rate: Option<u32>,
}

impl Cli {
    /// File values first, then flags and environment on top
    fn into_config(self) -> Result<VoiceConfig> {
        let mut config = match &self.config {
            Some(path) => VoiceConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => VoiceConfig::default(),
        };

        if let Some(url) = self.url {
            config = config.with_url(url);
        }
        if let Some(api_key) = self.api_key {
            config = config.with_api_key(api_key);
        }
        if let Some(tenant_id) = self.tenant_id {
            config = config.with_tenant_id(tenant_id);
        }
        if let Some(namespace) = self.namespace {
            config = config.with_namespace(namespace);
        }
        if let Some(rate) = self.sample_rate {
            config = config.with_sample_rate(rate);
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "catalyst_voice=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config()?;
    info!("Starting Catalyst voice client");

    run(config).await
}

#[cfg(feature = "audio-io")]
async fn run(config: VoiceConfig) -> Result<()> {
    use catalyst_voice::integration::VoiceClientBuilder;
    use catalyst_voice::state::{VoiceCommand, VoiceEvent};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tracing::warn;

    fn report(event: VoiceEvent) {
        match event {
            VoiceEvent::Transcript { text, received_at } => {
                println!("[{}] {}", received_at.format("%H:%M:%S"), text)
            }
            VoiceEvent::ServerError(message) => eprintln!("service error: {}", message),
            VoiceEvent::Error(message) => eprintln!("error: {}", message),
            VoiceEvent::Warning(message) => warn!("{}", message),
            other => info!(event = ?other, "Voice event"),
        }
    }

    let (client, handle) = VoiceClientBuilder::new()
        .with_config(config)
        .build()
        .context("Failed to create voice client")?;
    let task = client.start();

    handle.send_command(VoiceCommand::StartRecording)?;
    info!("Press Enter to toggle recording, Ctrl-C to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut poll = tokio::time::interval(Duration::from_millis(50));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(_)) => {
                    let cmd = if handle.is_recording() {
                        VoiceCommand::StopRecording
                    } else {
                        VoiceCommand::StartRecording
                    };
                    handle.send_command(cmd)?;
                }
                _ => break,
            },
            _ = poll.tick() => {
                while let Some(event) = handle.try_recv_event() {
                    report(event);
                }
            }
        }
    }

    let _ = handle.send_command(VoiceCommand::Shutdown);
    task.await.context("Voice client task failed")?;
    while let Some(event) = handle.try_recv_event() {
        report(event);
    }

    Ok(())
}

#[cfg(not(feature = "audio-io"))]
async fn run(_config: VoiceConfig) -> Result<()> {
    anyhow::bail!("built without the audio-io feature; no microphone or speaker available")
}
