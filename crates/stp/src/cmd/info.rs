use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use stp_runtime::{Capability, Connection};
use stp_services::{BrowserInformation, CoreService};

use crate::cmd::{open_connection, InfoArgs};
use crate::exit::{service_error, CliResult, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct ServiceOutput {
    name: String,
    version: String,
}

#[derive(Serialize)]
struct InfoOutput {
    peer: Option<String>,
    state: &'static str,
    stp_version: u32,
    core_version: String,
    platform: String,
    operating_system: String,
    user_agent: String,
    services: Vec<ServiceOutput>,
    capabilities: Vec<&'static str>,
    browser: Option<BrowserInformation>,
}

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let conn = open_connection(&args.connect)?;
    let out = collect(&conn)?;
    conn.close();

    print_info(&out, format);
    Ok(SUCCESS)
}

fn collect(conn: &Connection) -> CliResult<InfoOutput> {
    let registry = conn.registry();
    let host = registry.host_info();

    let browser = if conn.has_capability(Capability::BrowserInformation) {
        let core = CoreService::new(conn.clone());
        Some(
            core.browser_information()
                .map_err(|err| service_error("browser information failed", err))?,
        )
    } else {
        None
    };

    Ok(InfoOutput {
        peer: conn.peer_addr().map(|addr| addr.to_string()),
        state: conn.state().name(),
        stp_version: host.stp_version,
        core_version: host.core_version.clone(),
        platform: host.platform.clone(),
        operating_system: host.operating_system.clone(),
        user_agent: host.user_agent.clone(),
        services: registry
            .services()
            .map(|svc| ServiceOutput {
                name: svc.name().to_string(),
                version: svc.version().to_string(),
            })
            .collect(),
        capabilities: registry.capabilities().iter().map(Capability::name).collect(),
        browser,
    })
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => {
            print_summary(out);
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "VERSION"]);
            for svc in &out.services {
                table.add_row(vec![svc.name.clone(), svc.version.clone()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            print_summary(out);
            let services = out
                .services
                .iter()
                .map(|s| format!("{} {}", s.name, s.version))
                .collect::<Vec<_>>()
                .join(", ");
            println!("  Services:         {services}");
        }
        OutputFormat::Raw => {
            for svc in &out.services {
                println!("{} {}", svc.name, svc.version);
            }
        }
    }
}

fn print_summary(out: &InfoOutput) {
    println!("Browser Info:");
    println!("  Peer:             {}", out.peer.as_deref().unwrap_or("unknown"));
    println!("  State:            {}", out.state);
    println!("  STP version:      {}", out.stp_version);
    println!("  Core version:     {}", out.core_version);
    println!("  Platform:         {}", out.platform);
    println!("  OS:               {}", out.operating_system);
    println!("  User agent:       {}", out.user_agent);
    if let Some(browser) = &out.browser {
        println!("  Product:          {}", browser.product);
        if let Some(pid) = browser.process_id {
            println!("  Process id:       {pid}");
        }
    }
    if out.capabilities.is_empty() {
        println!("  Capabilities:     none");
    } else {
        println!("  Capabilities:     {}", out.capabilities.join(", "));
    }
}
