use std::path::{Path, PathBuf};

use bytes::Bytes;
use clap::{Parser, ValueEnum};
use futures_util::StreamExt;
use pixy_stream::{
    default_config_path, load_config, open_stream, text_stream, ByteSource, ChatDeltas,
    CompletionTokens, Extractor, FetchRequest, HttpFetch, PixyStreamConfig, RateLimitNotice,
    RawFrames, StreamMode, StreamOptions, TextStream,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

mod logging;

const REPLAY_CHANNEL_CAPACITY: usize = 8;

#[derive(Parser, Debug)]
#[command(
    name = "pixy-stream",
    version,
    about = "Stream text from an OpenAI-style server-sent-event endpoint"
)]
struct Cli {
    /// Endpoint to request.
    #[arg(long, required_unless_present = "replay", conflicts_with = "replay")]
    url: Option<String>,
    /// JSON file sent as the request body.
    #[arg(long)]
    body: Option<PathBuf>,
    /// Extra request header as `Name:Value`, repeatable.
    #[arg(long = "header", value_parser = parse_header)]
    headers: Vec<(String, String)>,
    /// Recorded SSE body to replay instead of sending a request.
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Replay chunk size in bytes.
    #[arg(long, default_value_t = 64)]
    chunk_size: usize,
    #[arg(long, value_enum, default_value_t = Endpoint::Chat)]
    endpoint: Endpoint,
    #[arg(long)]
    mode: Option<StreamMode>,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    initial_delay_ms: Option<u64>,
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Which payload shape to extract text from.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Chat,
    Completions,
    Raw,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path).map_err(|error| error.to_string())?;
    apply_overrides(&mut config, &cli);
    logging::init_tracing(&config.log);
    info!(config = %config_path.display(), endpoint = ?cli.endpoint, "pixy-stream starting");

    let stream = match cli.endpoint {
        Endpoint::Chat => open(&cli, &config, ChatDeltas).await?,
        Endpoint::Completions => open(&cli, &config, CompletionTokens).await?,
        Endpoint::Raw => open(&cli, &config, RawFrames).await?,
    };

    let mut stdout = tokio::io::stdout();
    write_stream(stream, &mut stdout).await
}

fn apply_overrides(config: &mut PixyStreamConfig, cli: &Cli) {
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    if let Some(max_retries) = cli.max_retries {
        config.retry.max_retries = max_retries;
    }
    if let Some(initial_delay_ms) = cli.initial_delay_ms {
        config.retry.initial_delay_ms = initial_delay_ms;
    }
}

async fn open<E>(cli: &Cli, config: &PixyStreamConfig, extractor: E) -> Result<TextStream, String>
where
    E: Extractor + 'static,
{
    let options = StreamOptions::from_config(config).on_rate_limited(|notice: RateLimitNotice| {
        eprintln!(
            "rate limited, retry {} in {} ms",
            notice.retries + 1,
            notice.delay.as_millis()
        );
    });

    if let Some(path) = &cli.replay {
        let body = tokio::fs::read(path)
            .await
            .map_err(|error| format!("read replay file {} failed: {error}", path.display()))?;
        debug!(bytes = body.len(), chunk_size = cli.chunk_size, "replaying recorded body");
        return Ok(text_stream(
            replay_source(Bytes::from(body), cli.chunk_size),
            extractor,
            options.mode,
            options.on_parse,
            options.on_done,
        ));
    }

    let url = cli
        .url
        .as_deref()
        .ok_or_else(|| "either --url or --replay is required".to_string())?;
    let request = build_request(url, cli.body.as_deref(), &cli.headers).await?;
    let fetch = HttpFetch::for_url(url);
    open_stream(Some(&fetch), &request, extractor, options)
        .await
        .map_err(|error| error.to_string())
}

async fn build_request(
    url: &str,
    body: Option<&Path>,
    headers: &[(String, String)],
) -> Result<FetchRequest, String> {
    let mut request = match body {
        Some(path) => {
            let raw = tokio::fs::read(path)
                .await
                .map_err(|error| format!("read body file {} failed: {error}", path.display()))?;
            let value = serde_json::from_slice(&raw)
                .map_err(|error| format!("body file {} is not JSON: {error}", path.display()))?;
            FetchRequest::post_json(url, value)
        }
        None => FetchRequest::get(url),
    };
    for (name, value) in headers {
        request = request.header(name.clone(), value.clone());
    }
    Ok(request)
}

/// Feeds `body` through a push source in `chunk_size` pieces from its own
/// task, the way a network producer would.
fn replay_source(body: Bytes, chunk_size: usize) -> ByteSource {
    let (sender, source) = ByteSource::push(REPLAY_CHANNEL_CAPACITY);
    let chunk_size = chunk_size.max(1);
    tokio::spawn(async move {
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk_size).min(body.len());
            if sender.send(Ok(body.slice(offset..end))).await.is_err() {
                return;
            }
            offset = end;
        }
    });
    source
}

async fn write_stream<W>(mut stream: TextStream, writer: &mut W) -> Result<(), String>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| error.to_string())?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|error| format!("write output failed: {error}"))?;
        writer
            .flush()
            .await
            .map_err(|error| format!("flush output failed: {error}"))?;
    }
    Ok(())
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("header '{raw}' must look like Name:Value"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header '{raw}' has an empty name"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
