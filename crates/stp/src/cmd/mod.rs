use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Subcommand};
use stp_runtime::{
    connect_with_config, Connection, ConnectionListener, HandshakeConfig, RuntimeConfig,
    ScopeError, ServiceRequest,
};
use stp_transport::TransportError;
use tracing::debug;

use crate::exit::{scope_error, CliError, CliResult, TIMEOUT, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod events;
pub mod info;
pub mod version;

const DEFAULT_ADDR: &str = "127.0.0.1:7001";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect, negotiate services and print what the browser offers.
    Info(InfoArgs),
    /// Send a single command and print the response.
    Call(CallArgs),
    /// Subscribe to service events and print them as they arrive.
    Events(EventsArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Info(args) => info::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Events(args) => events::run(args, format),
        Command::Version(args) => version::run(args, format),
    }
}

/// How to reach the browser and what to negotiate with it.
#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Browser scope address (host:port).
    #[arg(long, short = 'a', env = "STP_ADDR", default_value = DEFAULT_ADDR)]
    pub addr: String,
    /// Listen on ADDR and wait for the browser to dial in.
    #[arg(long)]
    pub listen: bool,
    /// Connect and handshake timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Service to enable, optionally with a version (NAME or NAME@VERSION).
    /// Repeatable. Default: every advertised service.
    #[arg(long = "service", value_name = "NAME[@VERSION]")]
    pub services: Vec<String>,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Target service name.
    pub service: String,
    /// Command id within the service.
    pub command_id: u32,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Maximum time to wait for the response (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub call_timeout: String,
}

#[derive(Args, Debug)]
pub struct EventsArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Services whose events to print (comma-separated). Default: all negotiated.
    #[arg(long, value_delimiter = ',')]
    pub subscribe: Vec<String>,
    /// Exit after receiving N events.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Open a ready connection as described by `args`.
pub fn open_connection(args: &ConnectArgs) -> CliResult<Connection> {
    let timeout = parse_duration(&args.timeout)?;
    let requests = args
        .services
        .iter()
        .map(String::as_str)
        .map(parse_service_request)
        .collect::<CliResult<Vec<_>>>()?;

    let config = RuntimeConfig {
        connect_timeout: timeout,
        ..RuntimeConfig::default()
    }
    .with_handshake(
        HandshakeConfig::default()
            .with_timeout(timeout)
            .with_services(requests),
    );

    if args.listen {
        let listener = ConnectionListener::bind(args.addr.as_str())
            .map_err(|err| scope_error("bind failed", err))?
            .with_config(config);
        eprintln!("waiting for browser on {}", listener.local_addr());
        return listener
            .accept()
            .map_err(|err| scope_error("accept failed", err));
    }

    connect_with_retry(&args.addr, config, timeout)
}

fn connect_with_retry(
    addr: &str,
    config: RuntimeConfig,
    timeout: Duration,
) -> CliResult<Connection> {
    let start = Instant::now();
    loop {
        match connect_with_config(addr, config.clone()) {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                if !is_retryable_connect_error(&err) {
                    return Err(scope_error("connect failed", err));
                }
                if start.elapsed() >= timeout {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("connect to {addr} timed out after {timeout:?}"),
                    ));
                }
                debug!(%addr, error = %err, "browser not reachable yet, retrying");
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn is_retryable_connect_error(err: &ScopeError) -> bool {
    match err {
        ScopeError::Transport(TransportError::Connect { source, .. }) => {
            source.kind() == std::io::ErrorKind::ConnectionRefused
        }
        _ => false,
    }
}

/// Parse `NAME` or `NAME@VERSION`.
pub fn parse_service_request(arg: &str) -> CliResult<ServiceRequest> {
    let (name, version) = match arg.split_once('@') {
        Some((name, version)) => (name.trim(), Some(version.trim())),
        None => (arg.trim(), None),
    };
    if name.is_empty() {
        return Err(CliError::new(USAGE, format!("invalid service request: {arg:?}")));
    }

    let request = ServiceRequest::new(name);
    match version {
        Some("") => Err(CliError::new(USAGE, format!("missing version in {arg:?}"))),
        Some(version) => Ok(request.with_version(version)),
        None => Ok(request),
    }
}

/// Parse durations like `5s`, `150ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
