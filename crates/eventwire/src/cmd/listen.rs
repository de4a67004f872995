use eventwire_session::{Socket, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cmd::{bind_server, served_channels, shutdown_signal, ListenArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_event, EventRecord, OutputFormat};

pub async fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let channels = served_channels(args.channels.as_deref());
    let events = args.events.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<EventRecord>();
    let server = bind_server(&args.endpoint, args.channels.as_deref(), args.codec)
        .await?
        .on_connection(move |socket| forward_events(&socket, &channels, &events, &tx));

    info!(endpoint = %args.endpoint, addr = %server.local_addr(), "listening");
    let handle = server.handle();
    let running = tokio::spawn(server.run());

    let mut printed = 0usize;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let record = tokio::select! {
            signal = &mut shutdown => {
                signal?;
                break;
            }
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        print_event(&record, format);
        printed = printed.saturating_add(1);
        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
    }

    handle.shutdown();
    if let Err(err) = running.await {
        warn!(error = %err, "server task ended abnormally");
    }
    Ok(SUCCESS)
}

fn forward_events(
    socket: &Socket,
    channels: &[String],
    events: &[String],
    tx: &mpsc::UnboundedSender<EventRecord>,
) {
    let peer = socket.id().unwrap_or_default();
    for channel in channels {
        let handle = match socket.channel(channel) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(peer = %peer, channel = %channel, error = %err, "cannot listen on channel");
                continue;
            }
        };
        for event in events {
            let (peer, channel, name, tx) = (peer.clone(), channel.clone(), event.clone(), tx.clone());
            handle.on(event, move |args: Vec<Value>| {
                let _ = tx.send(EventRecord::new(peer.clone(), &channel, &name, args));
            });
        }
    }
}
