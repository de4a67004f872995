use std::time::{Duration, Instant};

use clap::{Args, Subcommand};
use eventwire_codec::CodecKind;
use eventwire_session::{
    connect_with_events, ChannelHandle, ClientConfig, LifecycleEvent, ReconnectPolicy, Server,
    ServerConfig, Socket, Value, DEFAULT_CHANNEL,
};
use eventwire_transport::{Endpoint, MessageConfig};
use tokio::sync::broadcast;

use crate::exit::{
    session_error, transport_error, CliError, CliResult, FAILURE, INTERNAL, PERMISSION_DENIED,
    TIMEOUT, USAGE,
};
use crate::output::OutputFormat;

pub mod call;
pub mod emit;
pub mod info;
pub mod listen;
pub mod serve;
pub mod version;

/// Delay between connect attempts when a command waits for a server to appear.
const RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an event server that echoes ack requests.
    Serve(ServeArgs),
    /// Send a single event.
    Emit(EmitArgs),
    /// Send an event and print the acknowledgement.
    Call(CallArgs),
    /// Accept clients and print the events they send.
    Listen(ListenArgs),
    /// Connect and print the negotiated session metadata.
    Info(InfoArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub async fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format).await,
        Command::Emit(args) => emit::run(args, format).await,
        Command::Call(args) => call::run(args, format).await,
        Command::Listen(args) => listen::run(args, format).await,
        Command::Info(args) => info::run(args, format).await,
        Command::Version(args) => version::run(args),
    }
}

/// Options shared by the client subcommands.
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Payload codec.
    #[arg(long, env = "EVENTWIRE_CODEC", default_value = "json")]
    pub codec: CodecKind,
    /// Token sent with the handshake and every channel join.
    #[arg(long, env = "EVENTWIRE_AUTH", hide_env_values = true)]
    pub auth: Option<String>,
}

/// Event arguments, given as JSON or as a single string.
#[derive(Args, Debug, Clone, Default)]
pub struct PayloadArgs {
    /// JSON arguments. An array is spread into one argument per element.
    #[arg(long, conflicts_with = "data")]
    pub json: Option<String>,
    /// A single string argument.
    #[arg(long, conflicts_with = "json")]
    pub data: Option<String>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Endpoint to bind (tcp://host:port, unix:///path, host:port or a path).
    pub endpoint: Endpoint,
    /// Events to answer (comma-separated).
    #[arg(long, value_delimiter = ',', default_value = "echo")]
    pub events: Vec<String>,
    /// Channels clients may join besides "/" (comma-separated). Default: any.
    #[arg(long, value_delimiter = ',')]
    pub channels: Option<Vec<String>>,
    /// Payload codec.
    #[arg(long, env = "EVENTWIRE_CODEC", default_value = "json")]
    pub codec: CodecKind,
}

#[derive(Args, Debug)]
pub struct EmitArgs {
    /// Endpoint to connect to.
    pub endpoint: Endpoint,
    /// Event name.
    pub event: String,
    /// Channel to emit on.
    #[arg(long, short = 'c', default_value = DEFAULT_CHANNEL)]
    pub channel: String,
    #[command(flatten)]
    pub payload: PayloadArgs,
    #[command(flatten)]
    pub client: ClientArgs,
    /// Maximum time to connect and flush (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Endpoint to connect to.
    pub endpoint: Endpoint,
    /// Event name.
    pub event: String,
    /// Channel to call on.
    #[arg(long, short = 'c', default_value = DEFAULT_CHANNEL)]
    pub channel: String,
    #[command(flatten)]
    pub payload: PayloadArgs,
    #[command(flatten)]
    pub client: ClientArgs,
    /// Maximum time to wait for the acknowledgement (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Endpoint to bind.
    pub endpoint: Endpoint,
    /// Events to print (comma-separated).
    #[arg(long, value_delimiter = ',', required = true)]
    pub events: Vec<String>,
    /// Channels to listen on besides "/" (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub channels: Option<Vec<String>>,
    /// Exit after printing N events.
    #[arg(long)]
    pub count: Option<usize>,
    /// Payload codec.
    #[arg(long, env = "EVENTWIRE_CODEC", default_value = "json")]
    pub codec: CodecKind,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Endpoint to connect to.
    pub endpoint: Endpoint,
    #[command(flatten)]
    pub client: ClientArgs,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `500ms`, `5s`, `2m` or a bare number of seconds.
pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, scale): (&str, fn(u64) -> Duration) = if let Some(num) = input.strip_suffix("ms") {
        (num, Duration::from_millis)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, Duration::from_secs)
    } else if let Some(num) = input.strip_suffix('m') {
        (num, |n| Duration::from_secs(n.saturating_mul(60)))
    } else {
        (input, Duration::from_secs)
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }
    Ok(scale(value))
}

pub(crate) fn resolve_args(payload: &PayloadArgs) -> CliResult<Vec<Value>> {
    if let Some(json) = &payload.json {
        let parsed: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
        return Ok(match parsed {
            serde_json::Value::Array(items) => items.into_iter().map(Value::from).collect(),
            other => vec![Value::from(other)],
        });
    }
    if let Some(data) = &payload.data {
        return Ok(vec![Value::from(data.as_str())]);
    }
    Ok(Vec::new())
}

/// A client socket whose target channel is joined.
pub(crate) struct Connected {
    pub socket: Socket,
    pub channel: ChannelHandle,
    pub elapsed: Duration,
}

/// Connect and wait until `channel` is open. With `retry`, failed attempts
/// are repeated until `timeout`; otherwise the first failure is final.
pub(crate) async fn open_client(
    endpoint: &Endpoint,
    client: &ClientArgs,
    channel: &str,
    timeout: Duration,
    retry: bool,
) -> CliResult<Connected> {
    let connector = endpoint
        .connector(MessageConfig::default())
        .map_err(|err| transport_error("connect failed", err))?;
    let reconnect = if retry {
        ReconnectPolicy::new(RETRY_DELAY, RETRY_DELAY).without_jitter()
    } else {
        ReconnectPolicy::disabled()
    };
    let mut config = ClientConfig::default()
        .with_codec_kind(client.codec)
        .with_reconnect(reconnect)
        .with_handshake_timeout(timeout);
    if let Some(token) = &client.auth {
        config = config.with_auth_token(token.clone());
    }

    let started = Instant::now();
    let (socket, mut events) = connect_with_events(connector, config);
    let handle = match socket.channel(channel) {
        Ok(handle) => handle,
        Err(err) => {
            socket.close();
            return Err(session_error("invalid channel", err));
        }
    };

    match tokio::time::timeout(timeout, wait_until_ready(&mut events, channel, retry)).await {
        Ok(Ok(())) => Ok(Connected {
            socket,
            channel: handle,
            elapsed: started.elapsed(),
        }),
        Ok(Err(err)) => {
            socket.close();
            Err(err)
        }
        Err(_) => {
            socket.close();
            Err(CliError::new(
                TIMEOUT,
                format!("connect to {endpoint} timed out after {timeout:?}"),
            ))
        }
    }
}

async fn wait_until_ready(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    channel: &str,
    retry: bool,
) -> CliResult<()> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return Err(CliError::new(FAILURE, "connection closed"));
            }
        };
        match event {
            LifecycleEvent::Connect { .. } if channel == DEFAULT_CHANNEL => return Ok(()),
            LifecycleEvent::ChannelConnect { channel: joined } if joined == channel => {
                return Ok(())
            }
            LifecycleEvent::ChannelError {
                channel: refused,
                message,
            } if refused == channel || refused == DEFAULT_CHANNEL => {
                return Err(CliError::new(
                    PERMISSION_DENIED,
                    format!("channel {refused} refused: {message}"),
                ));
            }
            LifecycleEvent::ConnectError { message } if !retry => {
                return Err(CliError::new(FAILURE, format!("connect failed: {message}")));
            }
            LifecycleEvent::ConnectError { message } => {
                tracing::debug!(%message, "connect attempt failed; retrying");
            }
            LifecycleEvent::ReconnectFailed { attempts } => {
                return Err(CliError::new(
                    FAILURE,
                    format!("gave up after {attempts} connect attempts"),
                ));
            }
            _ => {}
        }
    }
}

/// Close `socket` and wait (bounded) for its last frames to be written.
pub(crate) async fn close_and_flush(socket: &Socket, timeout: Duration) {
    socket.close();
    if tokio::time::timeout(timeout, socket.closed()).await.is_err() {
        tracing::warn!(?timeout, "timed out flushing the connection");
    }
}

/// Bind `endpoint` and build a server that serves "/" plus `channels`.
pub(crate) async fn bind_server(
    endpoint: &Endpoint,
    channels: Option<&[String]>,
    codec: CodecKind,
) -> CliResult<Server> {
    let acceptor = endpoint
        .bind(MessageConfig::default())
        .await
        .map_err(|err| transport_error("bind failed", err))?;
    let server = Server::from_boxed(acceptor, ServerConfig::default().with_codec_kind(codec));
    Ok(match channels {
        Some(channels) => {
            let names: Vec<&str> = channels.iter().map(String::as_str).collect();
            server.with_channels(&names)
        }
        None => server,
    })
}

/// "/" followed by `extra`, without duplicates.
pub(crate) fn served_channels(extra: Option<&[String]>) -> Vec<String> {
    let mut channels = vec![DEFAULT_CHANNEL.to_string()];
    for channel in extra.unwrap_or_default() {
        if !channels.contains(channel) {
            channels.push(channel.clone());
        }
    }
    channels
}

/// Resolve on Ctrl-C (or SIGTERM on unix).
pub(crate) async fn shutdown_signal() -> CliResult<()> {
    let setup = |err: std::io::Error| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate()).map_err(setup)?;
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => interrupted.map_err(setup),
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map_err(setup)
    }
}

pub(crate) fn join_error(err: tokio::task::JoinError) -> CliError {
    CliError::new(INTERNAL, format!("server task failed: {err}"))
}
