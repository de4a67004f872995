use std::io::{IsTerminal, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use eventwire_session::{SessionInfo, Value};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One event seen by a server subcommand.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub peer: String,
    pub channel: String,
    pub event: String,
    pub args: Vec<Value>,
    pub timestamp: String,
}

impl EventRecord {
    pub fn new(peer: String, channel: &str, event: &str, args: Vec<Value>) -> Self {
        Self {
            peer,
            channel: channel.to_string(),
            event: event.to_string(),
            args,
            timestamp: now_unix_seconds(),
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    channel: &'a str,
    event: &'a str,
    reply: &'a [Value],
    round_trip_ms: f64,
}

#[derive(Serialize)]
pub struct SessionOutput {
    pub endpoint: String,
    pub sid: String,
    pub protocol_version: String,
    pub codec: &'static str,
    pub ping_interval_ms: Option<u64>,
    pub ping_timeout_ms: u64,
    pub connect_ms: f64,
    pub connected: bool,
}

impl SessionOutput {
    pub fn new(endpoint: String, info: SessionInfo, connect: Duration) -> Self {
        Self {
            endpoint,
            sid: info.sid,
            protocol_version: info.protocol_version,
            codec: info.codec,
            ping_interval_ms: info.ping_interval.map(whole_millis),
            ping_timeout_ms: whole_millis(info.ping_timeout),
            connect_ms: millis(connect),
            connected: true,
        }
    }
}

pub fn print_event(record: &EventRecord, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(record)),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHANNEL", "EVENT", "PEER", "ARGS"])
                .add_row(vec![
                    record.channel.clone(),
                    record.event.clone(),
                    record.peer.clone(),
                    to_json(&record.args),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "channel={} event={} peer={} args={}",
                record.channel,
                record.event,
                record.peer,
                to_json(&record.args)
            );
        }
        OutputFormat::Raw => print_raw(&record.args),
    }
}

pub fn print_reply(channel: &str, event: &str, reply: &[Value], elapsed: Duration, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                channel,
                event,
                reply,
                round_trip_ms: millis(elapsed),
            };
            println!("{}", to_json(&out));
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "VALUE"]);
            for (index, value) in reply.iter().enumerate() {
                table.add_row(vec![index.to_string(), to_json(value)]);
            }
            println!("{table}");
            println!("{event} on {channel} answered in {:.2}ms", millis(elapsed));
        }
        OutputFormat::Pretty => {
            println!(
                "channel={channel} event={event} rtt={:.2}ms reply={}",
                millis(elapsed),
                to_json(reply)
            );
        }
        OutputFormat::Raw => print_raw(reply),
    }
}

pub fn print_session(out: &SessionOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(out)),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Session Info:");
            println!("  Endpoint:       {}", out.endpoint);
            println!("  Session ID:     {}", out.sid);
            println!("  Protocol:       eventwire {}", out.protocol_version);
            println!("  Codec:          {}", out.codec);
            match out.ping_interval_ms {
                Some(ms) => println!("  Ping interval:  {ms}ms"),
                None => println!("  Ping interval:  disabled"),
            }
            println!("  Ping timeout:   {}ms", out.ping_timeout_ms);
            println!("  Connected in:   {:.2}ms", out.connect_ms);
        }
        OutputFormat::Raw => println!("{}", out.sid),
    }
}

fn print_raw(values: &[Value]) {
    let mut out = std::io::stdout();
    for value in values {
        let line = match value {
            Value::String(text) => text.clone(),
            Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            other => to_json(other),
        };
        let _ = writeln!(out, "{line}");
    }
    let _ = out.flush();
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn millis(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
