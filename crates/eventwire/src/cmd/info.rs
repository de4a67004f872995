use crate::cmd::{close_and_flush, open_client, parse_duration, InfoArgs};
use crate::exit::{CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_session, OutputFormat, SessionOutput};
use eventwire_session::DEFAULT_CHANNEL;

pub async fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    // Retry until the timeout so `info` can wait for a server that is starting.
    let connected = open_client(&args.endpoint, &args.client, DEFAULT_CHANNEL, timeout, true).await?;

    let info = connected.socket.session_info();
    close_and_flush(&connected.socket, timeout).await;
    let info = info.ok_or_else(|| CliError::new(INTERNAL, "connected without session metadata"))?;

    let out = SessionOutput::new(args.endpoint.to_string(), info, connected.elapsed);
    print_session(&out, format);
    Ok(SUCCESS)
}
