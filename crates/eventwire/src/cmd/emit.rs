use crate::cmd::{close_and_flush, open_client, parse_duration, resolve_args, EmitArgs};
use crate::exit::{session_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

pub async fn run(args: EmitArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_args(&args.payload)?;
    let connected = open_client(&args.endpoint, &args.client, &args.channel, timeout, false).await?;

    let sent = connected.channel.emit(&args.event, payload);
    close_and_flush(&connected.socket, timeout).await;
    sent.map_err(|err| session_error("emit failed", err))?;

    if matches!(format, OutputFormat::Pretty) {
        println!("sent {} on {}", args.event, args.channel);
    }
    Ok(SUCCESS)
}
