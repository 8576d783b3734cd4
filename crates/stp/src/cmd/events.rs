use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use stp_runtime::{Event, ScopeError};
use tracing::info;

use crate::cmd::{open_connection, EventsArgs};
use crate::exit::{scope_error, CliError, CliResult, INTERNAL, SUCCESS, TRANSPORT_ERROR};
use crate::output::{print_event, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(args: EventsArgs, format: OutputFormat) -> CliResult<i32> {
    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let conn = open_connection(&args.connect)?;
    let services: Vec<String> = if args.subscribe.is_empty() {
        conn.registry()
            .services()
            .map(|svc| svc.name().to_string())
            .collect()
    } else {
        args.subscribe.clone()
    };

    for service in &services {
        conn.registry()
            .require_service(service)
            .map_err(|err| scope_error("subscribe failed", err))?;
    }

    // Handlers only hold the sender; holding the connection would keep it
    // alive forever.
    let (tx, rx) = mpsc::channel::<Event>();
    for service in &services {
        let tx = tx.clone();
        conn.subscribe(service.clone(), move |event| {
            tx.send(event.clone())
                .map_err(|_| "event printer stopped".into())
        });
    }
    drop(tx);
    info!(services = ?services, "listening for events");

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                print_event(&event, format);
                printed = printed.saturating_add(1);
                if args.count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if conn.state().is_terminal() {
                    conn.close();
                    return Err(scope_error(
                        "event stream ended",
                        ScopeError::Disconnected("browser closed the connection".into()),
                    ));
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CliError::new(TRANSPORT_ERROR, "event stream ended"));
            }
        }
    }

    conn.close();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
