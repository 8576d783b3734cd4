use serde::Serialize;
use stp_runtime::Capability;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_json, OutputFormat};

#[derive(Serialize)]
struct CapabilityOutput {
    name: &'static str,
    service: &'static str,
    min_version: String,
}

#[derive(Serialize)]
struct VersionOutput {
    name: &'static str,
    version: &'static str,
    target: &'static str,
    features: Vec<&'static str>,
    capabilities: Vec<CapabilityOutput>,
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    let out = VersionOutput {
        name: "stp",
        version: env!("CARGO_PKG_VERSION"),
        target: option_env!("STP_BUILD_TARGET").unwrap_or("unknown"),
        features: enabled_features(),
        capabilities: Capability::ALL
            .into_iter()
            .map(|capability| CapabilityOutput {
                name: capability.name(),
                service: capability.service(),
                min_version: capability.min_version().to_string(),
            })
            .collect(),
    };

    if matches!(format, OutputFormat::Json) {
        print_json(&out);
        return Ok(SUCCESS);
    }

    if !args.extended {
        println!("{} {}", out.name, out.version);
        return Ok(SUCCESS);
    }

    println!("name: {}", out.name);
    println!("version: {}", out.version);
    println!("target: {}", out.target);
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("features: {}", out.features.join(", "));
    for capability in &out.capabilities {
        println!(
            "capability: {} ({} >= {})",
            capability.name, capability.service, capability.min_version
        );
    }

    Ok(SUCCESS)
}

fn enabled_features() -> Vec<&'static str> {
    let mut features = vec!["cli"];
    if cfg!(feature = "services") {
        features.push("services");
    }
    if cfg!(feature = "async") {
        features.push("async");
    }
    features
}
