//! Monitor binary: read inverter traffic from a file, serial port, or
//! network listener and emit telemetry as NDJSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use semonitor::crypto::parse_device_key;
use semonitor::ndjson::SnapshotWriter;
use semonitor::seqfile::DEFAULT_SEQ_FILE;
use semonitor::session::{
    Command, Mode, SessionConfig, SessionController, read_mode,
};
use semonitor::transport::{self, FrameReader, SourceConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub mode: Mode,
    /// Hex device addresses to poll in master mode (exactly one in
    /// commanding mode).
    pub slaves: Vec<String>,
    /// Commands to issue in commanding mode, `<function>[,b<v>|h<v>|l<v>...]`.
    pub commands: Vec<String>,
    /// 32 hex chars: the pre-shared device key for session decryption.
    pub key: Option<String>,
    /// Telemetry output path; stdout when unset.
    pub output: Option<String>,
    /// Raw byte mirror of all traffic, for later replay.
    pub record_file: Option<String>,
    pub append: bool,
    /// Enables firmware reassembly; the image is written here on exit.
    pub update_file: Option<String>,
    /// Upgrade frame-parse errors to process exit.
    pub halt_on_error: bool,
    pub seq_file: String,
    pub key_cache_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            source: SourceConfig::Stdin,
            mode: Mode::Passive,
            slaves: Vec::new(),
            commands: Vec::new(),
            key: None,
            output: None,
            record_file: None,
            append: false,
            update_file: None,
            halt_on_error: false,
            seq_file: DEFAULT_SEQ_FILE.to_string(),
            key_cache_file: "last0503.msg".to_string(),
        }
    }
}

pub async fn parse_config(path: &str) -> anyhow::Result<Config> {
    if let Ok(config_file) = tokio::fs::read_to_string(path).await {
        toml::from_str(&config_file).with_context(|| format!("failed to parse config file {path}"))
    } else {
        warn!("unable to read config file, using default config");
        Ok(Config::default())
    }
}

/// Cross-check the mode against the source and lower the config into the
/// session's terms.
fn validate(config: &Config) -> anyhow::Result<SessionConfig> {
    let slaves = config
        .slaves
        .iter()
        .map(|s| u32::from_str_radix(s.trim(), 16).with_context(|| format!("invalid slave address {s:?}")))
        .collect::<anyhow::Result<Vec<u32>>>()?;
    let commands = config
        .commands
        .iter()
        .map(|c| Command::parse(c).with_context(|| format!("invalid command {c:?}")))
        .collect::<anyhow::Result<Vec<Command>>>()?;
    let device_key = config.key.as_deref().map(parse_device_key).transpose()?;

    match config.mode {
        Mode::Master => {
            if !config.source.is_rs485() {
                bail!("master mode is only allowed with an RS485 serial source");
            }
            if slaves.is_empty() {
                bail!("at least one slave address must be configured for master mode");
            }
        }
        Mode::Commanding => {
            if slaves.len() != 1 {
                bail!("exactly one slave address must be configured for commanding mode");
            }
            if commands.is_empty() {
                bail!("no commands configured for commanding mode");
            }
        }
        Mode::Server => {
            if !config.source.is_network() {
                bail!("server mode requires a network source");
            }
        }
        Mode::Passive => {}
    }

    Ok(SessionConfig {
        mode: config.mode,
        slaves,
        commands,
        device_key,
        update_path: config.update_file.as_ref().map(PathBuf::from),
        halt_on_error: config.halt_on_error,
        seq_path: PathBuf::from(&config.seq_file),
        key_cache_path: PathBuf::from(&config.key_cache_file),
        ..SessionConfig::default()
    })
}

/// The single command-line argument is the config file path; everything
/// else lives in the config.
fn config_path() -> anyhow::Result<String> {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "semonitor".to_string());
    let path = args
        .next()
        .with_context(|| format!("usage: {program} <config.toml>"))?;
    if args.next().is_some() {
        bail!("usage: {program} <config.toml>");
    }
    Ok(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = parse_config(&config_path()?).await?;
    let session_config = validate(&config)?;

    let record = match &config.record_file {
        Some(path) => Some(
            transport::open_record_file(path, config.append)
                .await
                .with_context(|| format!("failed to open record file {path}"))?,
        ),
        None => None,
    };
    let writer = match &config.output {
        Some(path) => SnapshotWriter::file(path)
            .await
            .with_context(|| format!("failed to open output file {path}"))?,
        None => SnapshotWriter::stdout(),
    };

    let (source, sink) = transport::open(&config.source, record.clone())
        .await
        .context("failed to open data source")?;
    let reader = FrameReader::new(
        source,
        read_mode(config.mode, &config.source),
        record.clone(),
    );
    let sink = Arc::new(Mutex::new(sink));

    let mut controller =
        SessionController::new(session_config, config.source.clone(), sink, writer, record);

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();
    controller.spawn_master(&tracker, token.clone());

    let shutdown_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            shutdown_token.cancel();
        }
    });

    let result = controller.run(reader, token.clone()).await;
    token.cancel();
    tracker.close();
    tracker.wait().await;
    result?;
    Ok(())
}
