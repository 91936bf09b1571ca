mod config;

use std::{
    collections::BTreeMap,
    path::PathBuf,
    str::FromStr,
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::Parser;
use dashling::{
    host::{simulated::simulated_host, MediaElement},
    request::HttpTransport,
    storage::FileStore,
    Dashling, SessionEvent, StreamType,
};
use fake_user_agent::get_chrome_rua;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, ClientBuilder,
};
use tokio::sync::broadcast::error::RecvError;

/// Plays an MPEG-DASH manifest headlessly and reports how the adaptation behaved.
#[derive(Parser, Debug, Clone)]
#[clap(name = "dashling", version)]
pub struct DashlingArgs {
    /// Debug output
    #[clap(long, short, alias = "debug")]
    verbose: bool,

    /// TOML file with session settings
    #[clap(long)]
    settings: Option<PathBuf>,

    /// Disable adaptive bitrate and stay at --quality
    #[clap(long)]
    no_abr: bool,

    /// Target quality index for both streams
    #[clap(long)]
    quality: Option<usize>,

    /// Seconds of media to buffer ahead of the playhead
    #[clap(long)]
    max_buffer: Option<f64>,

    /// Stop after this many seconds of wall clock time
    #[clap(long, default_value = "30")]
    play_seconds: u64,

    /// Per request timeout in seconds
    #[clap(long, default_value = "10")]
    timeout: u64,

    /// JSON file the measured bandwidth is persisted to between runs
    #[clap(long, env = "DASHLING_BANDWIDTH_FILE")]
    bandwidth_file: Option<PathBuf>,

    /// HTTP Header used to download
    ///
    /// Custom header. eg. "Referer: https://example.com/".
    #[clap(short = 'H', long)]
    headers: Vec<String>,

    /// Manifest URL
    url: String,
}

impl DashlingArgs {
    fn client(&self) -> anyhow::Result<Client> {
        let mut headers = HeaderMap::new();
        for header in &self.headers {
            let (key, value) = header
                .split_once(':')
                .with_context(|| format!("Invalid header: {header}"))?;
            headers.insert(
                HeaderName::from_str(key.trim())?,
                HeaderValue::from_str(value.trim())?,
            );
        }

        let client = ClientBuilder::new()
            .default_headers(headers)
            .user_agent(get_chrome_rua())
            .timeout(Duration::from_secs(self.timeout))
            .build()?;
        Ok(client)
    }

    fn settings(&self) -> anyhow::Result<dashling::Settings> {
        let mut settings = match &self.settings {
            Some(path) => config::load(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => dashling::Settings::default(),
        };

        if self.no_abr {
            settings.is_abr_enabled = false;
        }
        if let Some(quality) = self.quality {
            settings.target_quality.audio = quality;
            settings.target_quality.video = quality;
        }
        if let Some(max_buffer) = self.max_buffer {
            settings.max_buffer_seconds = max_buffer;
        }
        settings.request_timeout_ms = self.timeout * 1000;
        Ok(settings)
    }
}

#[derive(Debug, Default)]
struct Report {
    /// Measured downloads per stream and quality. Cache hits are not reported.
    downloads: BTreeMap<(StreamType, usize), usize>,
    bytes: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = DashlingArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .try_from_env()
                .unwrap_or_else(|_| {
                    if args.verbose {
                        "dashling=debug".into()
                    } else {
                        "dashling=info".into()
                    }
                }),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut session = Dashling::new(args.settings()?)
        .with_transport(HttpTransport::new(args.client()?));
    if let Some(path) = &args.bandwidth_file {
        session = session.with_store(FileStore::open(path)?);
    }

    let mut events = session.subscribe();
    let reporter = tokio::spawn(async move {
        let mut report = Report::default();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Skipped {skipped} session events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                SessionEvent::StateChange {
                    state,
                    error_message,
                    ..
                } => match error_message {
                    Some(message) => log::error!("State: {state} ({message})"),
                    None => log::info!("State: {state}"),
                },
                SessionEvent::Download(record) => {
                    if let (Some(stream_type), Some(quality)) = (record.stream_type, record.quality)
                    {
                        *report.downloads.entry((stream_type, quality)).or_default() += 1;
                    }
                    report.bytes += record.bytes;
                }
            }
        }
        report
    });

    let (host, element, media_source) = simulated_host();
    let player = {
        let session = session.clone();
        let play_for = Duration::from_secs(args.play_seconds);
        tokio::spawn(async move {
            let started_at = Instant::now();
            let mut tick = tokio::time::interval(Duration::from_millis(100));
            while !session.is_disposed() {
                tick.tick().await;
                element.advance(0.1);
                if element.has_ended() {
                    log::info!("Reached the end of the content");
                    session.dispose();
                } else if started_at.elapsed() >= play_for {
                    log::info!("Stopping after {}s", play_for.as_secs());
                    session.dispose();
                }
            }
            element
        })
    };

    let result = session.load(host, &args.url).await;
    session.dispose();
    let element = player.await?;
    drop(session);
    let report = reporter.await?;

    let summary = result?;
    println!("Played until {:.3}s", element.current_time());
    println!("Fragments appended: {}", summary.appended);
    println!("Stalls: {}", summary.stalls);
    if let Some(rate) = summary.buffer_rate {
        println!("Buffer rate: {rate:.2}x");
    }
    println!("Measured downloads ({} bytes):", report.bytes);
    for ((stream_type, quality), count) in &report.downloads {
        println!("  {stream_type} quality {quality}: {count}");
    }
    for buffer in media_source.source_buffers() {
        println!(
            "  {}: {} fragments, {} bytes appended",
            buffer.mime_codecs(),
            buffer.media_appends().len(),
            buffer.appended_bytes()
        );
    }

    Ok(())
}
