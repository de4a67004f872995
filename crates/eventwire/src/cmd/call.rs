use std::time::Instant;

use crate::cmd::{close_and_flush, open_client, parse_duration, resolve_args, CallArgs};
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::{print_reply, OutputFormat};

pub async fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_args(&args.payload)?;
    let connected = open_client(&args.endpoint, &args.client, &args.channel, timeout, false).await?;

    let started = Instant::now();
    let outcome = connected.channel.call(&args.event, payload, timeout).await;
    let elapsed = started.elapsed();
    close_and_flush(&connected.socket, timeout).await;

    let reply = outcome.map_err(|err| session_error("call failed", err))?;
    print_reply(&args.channel, &args.event, &reply, elapsed, format);
    Ok(SUCCESS)
}
