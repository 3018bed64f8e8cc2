use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tipswitch_core::modules::config::{
    KEY_ADDRESS, KEY_PAGE_ID, KEY_PASSWORD, KEY_REVERT_DELAY, KEY_SCENE_TARGET, KEY_STREAM_KEY,
    KEY_TEXT_TARGET,
};
use tipswitch_core::modules::log::MemoryLog;
use tipswitch_core::modules::orchestrator::DonationOutcome;
use tipswitch_core::modules::ports::TracingNotifier;
use tipswitch_core::modules::settings::JsonFileSettings;
use tipswitch_core::{
    AutomationSession, ConfigPatch, ConfigStore, ControlPlaneClient, DonationEvent,
    DonationFeedClient, FeedEndpoint, LogPort, NotificationPort,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tipswitch", about = "Switch OBS scenes when a Trakteer donation arrives")]
struct Args {
    /// Settings file. Defaults to `<config dir>/tipswitch/settings.json`.
    #[arg(long, value_name = "PATH", global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect both sides and react to donations until Ctrl-C.
    Run {
        /// Also write "<supporter>: <message>" into the configured text source.
        #[arg(long, default_value_t = false)]
        mirror_text: bool,
    },
    /// List the scenes and text sources OBS offers.
    Scenes,
    /// Run one switch-and-revert as if a donation had arrived.
    Trigger {
        #[arg(long, default_value = "tipswitch")]
        name: String,
        #[arg(long, default_value = "test donation")]
        message: String,
    },
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration. Secrets are redacted.
    Show,
    /// Set one key. An empty value clears `targetScene`/`textSource`.
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let settings_path = match args.settings.clone() {
        Some(p) => p,
        None => default_settings_path()?,
    };
    let log: Arc<dyn LogPort> = Arc::new(MemoryLog::new());
    let notifier: Arc<dyn NotificationPort> = Arc::new(TracingNotifier);
    let settings = JsonFileSettings::open(&settings_path)
        .with_context(|| format!("failed to open settings {}", settings_path.display()))?;
    let config = Arc::new(ConfigStore::load(Arc::new(settings), Arc::clone(&log)));

    match args.command {
        Command::Run { mirror_text } => run(config, log, notifier, mirror_text).await,
        Command::Scenes => scenes(config, log, notifier).await,
        Command::Trigger { name, message } => trigger(config, log, notifier, name, message).await,
        Command::Config(ConfigCommand::Show) => {
            println!("settings: {}", settings_path.display());
            println!("{:#?}", config.snapshot());
            Ok(())
        }
        Command::Config(ConfigCommand::Set { key, value }) => {
            let patch = patch_for(&key, value)?;
            config.update(patch).wait().await;
            eprintln!("saved {key}");
            Ok(())
        }
    }
}

fn default_settings_path() -> anyhow::Result<PathBuf> {
    let dir = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("no config directory; pass --settings"))?;
    Ok(dir.join("tipswitch").join("settings.json"))
}

/// `TIPSWITCH_FEED_SOCKET_URL` / `TIPSWITCH_FEED_LOOKUP_URL` override the
/// production endpoints.
fn feed_endpoint() -> FeedEndpoint {
    let mut endpoint = FeedEndpoint::default();
    if let Ok(url) = std::env::var("TIPSWITCH_FEED_SOCKET_URL") {
        endpoint.socket_url = url;
    }
    if let Ok(url) = std::env::var("TIPSWITCH_FEED_LOOKUP_URL") {
        endpoint.lookup_url = url;
    }
    endpoint
}

fn build_session(
    config: Arc<ConfigStore>,
    log: Arc<dyn LogPort>,
    notifier: Arc<dyn NotificationPort>,
) -> AutomationSession {
    let feed =
        DonationFeedClient::with_http_resolver(feed_endpoint(), Arc::clone(&log), Arc::clone(&notifier));
    let control = ControlPlaneClient::new(Arc::clone(&log), Arc::clone(&notifier));
    AutomationSession::new(feed, control, config, log, notifier)
}

async fn run(
    config: Arc<ConfigStore>,
    log: Arc<dyn LogPort>,
    notifier: Arc<dyn NotificationPort>,
    mirror_text: bool,
) -> anyhow::Result<()> {
    if !config.snapshot().feed_credentials.is_complete() {
        anyhow::bail!("pageId and streamApiKey must be set (tipswitch config set ...)");
    }
    let session = build_session(config, log, notifier);

    // The feed is useful without OBS; donations are logged and ignored.
    if let Err(e) = session.connect_control_plane().await {
        tracing::warn!("continuing without OBS: {e}");
    }
    session.connect_feed().await?;
    session.start();

    let mirror = mirror_text.then(|| {
        let mut events = session.feed.subscribe();
        let orchestrator = Arc::clone(&session.orchestrator);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let text = format!("{}: {}", event.supporter_name, event.message);
                orchestrator.update_text_content(&text).await;
            }
        })
    });

    tracing::info!("waiting for donations, Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    if let Some(handle) = mirror {
        handle.abort();
    }
    session.shutdown();
    Ok(())
}

async fn scenes(
    config: Arc<ConfigStore>,
    log: Arc<dyn LogPort>,
    notifier: Arc<dyn NotificationPort>,
) -> anyhow::Result<()> {
    let session = build_session(Arc::clone(&config), log, notifier);
    session.connect_control_plane().await?;

    let targets = session.control.targets();
    let selected = config.snapshot();
    println!("scenes:");
    for scene in &targets.scenes {
        let mark = if selected.scene_target.as_deref() == Some(scene.as_str()) { "*" } else { " " };
        println!(" {mark} {scene}");
    }
    println!("text sources:");
    for input in &targets.text_inputs {
        let mark = if selected.text_target.as_deref() == Some(input.as_str()) { "*" } else { " " };
        println!(" {mark} {input}");
    }
    session.disconnect_control_plane();
    Ok(())
}

async fn trigger(
    config: Arc<ConfigStore>,
    log: Arc<dyn LogPort>,
    notifier: Arc<dyn NotificationPort>,
    name: String,
    message: String,
) -> anyhow::Result<()> {
    let session = build_session(config, log, notifier);
    session.connect_control_plane().await?;

    let event = DonationEvent::new(name, message);
    match session.orchestrator.handle_donation(&event).await {
        DonationOutcome::Ignored(reason) => anyhow::bail!("donation ignored: {reason:?}"),
        DonationOutcome::Failed(e) => return Err(e.into()),
        DonationOutcome::Switched { original, revert } => {
            if revert.is_some() {
                eprintln!("switched; waiting to restore {original}");
                while session.orchestrator.pending_revert_count() > 0 {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    session.shutdown();
    Ok(())
}

fn patch_for(key: &str, value: String) -> anyhow::Result<ConfigPatch> {
    let target = |v: String| Some(Some(v).filter(|s: &String| !s.is_empty()));
    let mut patch = ConfigPatch::default();
    match key {
        KEY_PAGE_ID => patch.page_id = Some(value),
        KEY_STREAM_KEY => patch.stream_key = Some(value),
        KEY_ADDRESS => patch.control_plane_address = Some(value),
        KEY_PASSWORD => patch.control_plane_credential = Some(value),
        KEY_REVERT_DELAY => {
            let ms = value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{KEY_REVERT_DELAY} must be a whole number of ms"))?;
            patch.revert_delay_ms = Some(ms);
        }
        KEY_SCENE_TARGET => patch.scene_target = target(value),
        KEY_TEXT_TARGET => patch.text_target = target(value),
        other => anyhow::bail!(
            "unknown key {other}; expected one of {KEY_PAGE_ID}, {KEY_STREAM_KEY}, {KEY_ADDRESS}, \
             {KEY_PASSWORD}, {KEY_REVERT_DELAY}, {KEY_SCENE_TARGET}, {KEY_TEXT_TARGET}"
        ),
    }
    Ok(patch)
}
