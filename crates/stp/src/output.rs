use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use stp_runtime::{Event, Response};

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

#[derive(Serialize)]
struct ResponseOutput<'a> {
    kind: &'static str,
    service: &'a str,
    command_id: u32,
    tag: u32,
    payload_size: usize,
    payload: serde_json::Value,
    elapsed_ms: f64,
}

#[derive(Serialize)]
struct EventOutput<'a> {
    kind: &'static str,
    service: &'a str,
    event_id: u32,
    payload_size: usize,
    payload: serde_json::Value,
    timestamp: String,
}

pub fn print_response(response: &Response, elapsed_ms: f64, format: OutputFormat) {
    let payload = response.payload.as_ref();
    match format {
        OutputFormat::Json => print_json(&ResponseOutput {
            kind: "response",
            service: &response.service,
            command_id: response.command_id,
            tag: response.tag,
            payload_size: payload.len(),
            payload: payload_value(payload),
            elapsed_ms,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "COMMAND", "TAG", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    response.service.clone(),
                    response.command_id.to_string(),
                    response.tag.to_string(),
                    payload.len().to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "service={} command={} tag={} size={} time={elapsed_ms:.2}ms payload={}",
                response.service,
                response.command_id,
                response.tag,
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

pub fn print_event(event: &Event, format: OutputFormat) {
    let payload = event.payload.as_ref();
    match format {
        OutputFormat::Json => print_json(&EventOutput {
            kind: "event",
            service: &event.service,
            event_id: event.command_id,
            payload_size: payload.len(),
            payload: payload_value(payload),
            timestamp: now_unix_seconds(),
        }),
        // One table per event would be unreadable in a stream.
        OutputFormat::Table | OutputFormat::Pretty => {
            println!(
                "{} event={} size={} payload={}",
                event.service,
                event.command_id,
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => {
            print_raw(payload);
            println!();
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// JSON payloads are embedded as-is; anything else becomes a string.
fn payload_value(payload: &[u8]) -> serde_json::Value {
    if payload.is_empty() {
        return serde_json::Value::Null;
    }
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| serde_json::Value::String(payload_preview(payload)))
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
