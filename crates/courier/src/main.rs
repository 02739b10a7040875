//! Send an HTTP request through a courier session and print the response.
//!
//! # Examples
//!
//! ```sh
//! # Plain GET, body printed as text
//! courier https://httpbin.org/get
//!
//! # Query parameters, validated, printed as pretty JSON
//! courier https://httpbin.org/get --param q=rust --param page=2 --validate --as json
//!
//! # JSON body with a header and retries
//! courier https://httpbin.org/post -X POST --json --param name=courier \
//!   --header "Authorization: Bearer token" --retries 3
//!
//! # Download to a file
//! courier https://httpbin.org/bytes/1024 --output data.bin
//! ```

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use courier::encoding::{JsonEncoding, Parameters, UrlEncoding};
use courier::session::{RequestBuilder, RequestKind};
use courier::{
    Error, HttpMethod, Interceptor, LoggingMonitor, RetryPolicy, Session, SessionConfig,
};
use serde_json::Value;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Send an HTTP request and print the response body.
#[derive(Parser)]
#[command(name = "courier", version)]
struct Cli {
    /// Request URL
    url: String,

    // ── Request ────────────────────────────────────────────────
    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: HttpMethod,

    /// Header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Parameter as key=value (repeatable)
    #[arg(short = 'p', long = "param")]
    params: Vec<String>,

    /// Encode parameters as a JSON body instead of URL encoding
    #[arg(long)]
    json: bool,

    /// Request timeout in seconds
    #[arg(long, value_parser = parse_timeout)]
    timeout: Option<Duration>,

    // ── Pipeline ───────────────────────────────────────────────
    /// Retry transient failures up to this many times
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Require a 2xx status and a known content type
    #[arg(long)]
    validate: bool,

    // ── Output ─────────────────────────────────────────────────
    /// Write the body to this file instead of printing it
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// How to print the body
    #[arg(long = "as", value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Print status and headers before the body
    #[arg(short, long)]
    include: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace). COURIER_LOG
    /// overrides it with filter directives.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Bytes,
}

fn parse_timeout(raw: &str) -> Result<Duration, String> {
    let seconds: f64 = raw
        .parse()
        .map_err(|_| format!("timeout '{raw}' is not a number of seconds"))?;
    if seconds <= 0.0 {
        return Err(format!("timeout must be positive, got {raw}"));
    }
    Duration::try_from_secs_f64(seconds)
        .map_err(|e| format!("timeout '{raw}' is out of range: {e}"))
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("header '{raw}' must look like 'Name: value'"))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn parse_params(raw: &[String]) -> Result<Option<Parameters>, String> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut parameters = Parameters::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("parameter '{pair}' must look like key=value"))?;
        parameters.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(Some(parameters))
}

fn build_session(cli: &Cli) -> Result<Session, Error> {
    let mut config = SessionConfig::default();
    if let Some(timeout) = cli.timeout {
        config = config.with_timeout(timeout);
    }
    let mut builder = Session::builder().config(config).monitor(LoggingMonitor);
    if cli.retries > 0 {
        builder = builder
            .interceptor(Interceptor::new().with_retrier(RetryPolicy::with_retries(cli.retries)));
    }
    builder.build()
}

/// Apply the shared request flags to a builder of any kind.
fn configure<K: RequestKind>(
    builder: RequestBuilder<K>,
    cli: &Cli,
    parameters: Option<Parameters>,
) -> Result<RequestBuilder<K>, String> {
    let mut builder = builder.method(cli.method);
    for raw in &cli.headers {
        let (name, value) = parse_header(raw)?;
        builder = builder.header(name, value);
    }
    if let Some(parameters) = parameters {
        builder = builder.parameters(parameters);
        builder = if cli.json {
            builder.encoding(JsonEncoding::default())
        } else {
            builder.encoding(UrlEncoding::default())
        };
    }
    if cli.validate {
        builder = builder.validate();
    }
    Ok(builder)
}

async fn run(cli: &Cli) -> Result<String, String> {
    let session = build_session(cli).map_err(|e| e.to_string())?;
    let parameters = parse_params(&cli.params)?;

    if let Some(path) = &cli.output {
        let request = configure(session.download(cli.url.as_str()), cli, parameters)?
            .destination(path)
            .send();
        let response = request.response_url().await;
        if cli.include {
            eprintln!("{response}");
        }
        let path = response.into_result().map_err(|e| e.to_string())?;
        return Ok(format!("saved to {}", path.display()));
    }

    let request = configure(session.request(cli.url.as_str()), cli, parameters)?.send();
    let (head, body) = match cli.format {
        OutputFormat::Text => {
            let response = request.response_string().await;
            let head = response.to_string();
            (head, response.into_result().map_err(|e| e.to_string())?)
        }
        OutputFormat::Json => {
            let response = request.response_json().await;
            let head = response.to_string();
            let value = response.into_result().map_err(|e| e.to_string())?;
            let body = serde_json::to_string_pretty(&value)
                .map_err(|e| format!("failed to format response: {e}"))?;
            (head, body)
        }
        OutputFormat::Bytes => {
            let response = request.response_data().await;
            let head = response.to_string();
            let data = response.into_result().map_err(|e| e.to_string())?;
            (head, format!("{} bytes", data.len()))
        }
    };
    if cli.include {
        eprintln!("{head}");
    }
    Ok(body)
}

fn verbosity_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity_level(verbose).into())
        .with_env_var("COURIER_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(ChronoLocal::new("%H:%M:%S".to_string()))
                .with_target(true),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli).await {
        Ok(body) => println!("{body}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
