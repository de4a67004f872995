use eventwire_session::{Socket, Value};
use tracing::{info, warn};

use crate::cmd::{bind_server, join_error, served_channels, shutdown_signal, ServeArgs};
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

pub async fn run(args: ServeArgs, _format: OutputFormat) -> CliResult<i32> {
    let channels = served_channels(args.channels.as_deref());
    let events = args.events.clone();
    let server = bind_server(&args.endpoint, args.channels.as_deref(), args.codec)
        .await?
        .on_connection(move |socket| register_echo(&socket, &channels, &events));

    info!(
        endpoint = %args.endpoint,
        addr = %server.local_addr(),
        codec = %args.codec,
        events = ?args.events,
        "serving"
    );
    let handle = server.handle();
    let mut running = tokio::spawn(server.run());

    tokio::select! {
        signal = shutdown_signal() => signal?,
        finished = &mut running => {
            finished.map_err(join_error)?.map_err(|err| session_error("server failed", err))?;
            return Ok(SUCCESS);
        }
    }

    info!(connections = handle.connection_count(), "shutting down");
    handle.shutdown();
    running
        .await
        .map_err(join_error)?
        .map_err(|err| session_error("server failed", err))?;
    Ok(SUCCESS)
}

/// Answer every listed event on every served channel by echoing its arguments.
fn register_echo(socket: &Socket, channels: &[String], events: &[String]) {
    let peer = socket.id().unwrap_or_default();
    for channel in channels {
        let handle = match socket.channel(channel) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(peer = %peer, channel = %channel, error = %err, "cannot serve channel");
                continue;
            }
        };
        for event in events {
            let (peer, channel, name) = (peer.clone(), channel.clone(), event.clone());
            handle.on(event, move |args: Vec<Value>| {
                info!(peer = %peer, channel = %channel, event = %name, args = args.len(), "echoing event");
                args
            });
        }
    }
}
