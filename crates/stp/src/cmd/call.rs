use std::time::Instant;

use tracing::debug;

use crate::cmd::{open_connection, parse_duration, CallArgs};
use crate::exit::{io_error, scope_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_response, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = read_payload(&args)?;
    let timeout = parse_duration(&args.call_timeout)?;

    let conn = open_connection(&args.connect)?;
    if !conn.registry().contains(&args.service) {
        // Raw calls may target services outside the negotiated set; the
        // browser decides whether to answer.
        debug!(service = %args.service, "calling a service that was not negotiated");
    }

    let started = Instant::now();
    let result = conn.call(&args.service, args.command_id, payload, timeout);
    let elapsed_ms = (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0;
    conn.close();

    let response = result.map_err(|err| scope_error("call failed", err))?;
    print_response(&response, elapsed_ms, format);
    Ok(SUCCESS)
}

fn read_payload(args: &CallArgs) -> CliResult<Vec<u8>> {
    if let Some(json) = &args.json {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| CliError::new(DATA_INVALID, format!("invalid --json payload: {err}")))?;
        return serde_json::to_vec(&value)
            .map_err(|err| CliError::new(DATA_INVALID, format!("json encode failed: {err}")));
    }

    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }

    if let Some(path) = &args.file {
        return std::fs::read(path)
            .map_err(|err| io_error(&format!("read {}", path.display()), err));
    }

    Ok(Vec::new())
}
