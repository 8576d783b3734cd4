use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;
use semver::Version;
use serde::{Deserialize, Serialize};
use stp_frame::SCOPE_SERVICE;
use tracing::{debug, info, warn};

use crate::connection::Runtime;
use crate::error::{Result, ScopeError};
use crate::message::{encode_payload, Message};
use crate::registry::{parse_service_version, HostInfo, ServiceDescriptor, ServiceRegistry};

/// Scope command: enable a service.
pub const ENABLE: u32 = 5;
/// Scope command: describe the host and its services.
pub const HOST_INFO: u32 = 10;

const MAX_SERVICE_NAME_LEN: usize = 64;
const MAX_VERSION_LEN: usize = 16;

/// Commands of the reserved `scope` service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeCommand {
    Enable,
    HostInfo,
}

impl Message for ScopeCommand {
    fn id(&self) -> u32 {
        match self {
            ScopeCommand::Enable => ENABLE,
            ScopeCommand::HostInfo => HOST_INFO,
        }
    }

    fn service_name(&self) -> &'static str {
        SCOPE_SERVICE
    }
}

/// Body of an ENABLE request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnableRequest {
    pub name: String,
    /// Version the client asks for; the browser picks when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Body of an ENABLE response: the version actually enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnableResponse {
    pub name: String,
    pub version: String,
}

/// A service the client wants enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub name: String,
    pub version: Option<String>,
}

impl ServiceRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    /// Ask for a specific version ("2.0").
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Configuration for service negotiation.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Timeout for each handshake command.
    pub timeout: Duration,
    /// Services to enable. Empty means every advertised service.
    pub services: Vec<ServiceRequest>,
    /// Fail when a requested service is not offered or cannot be enabled.
    pub require_services: bool,
    /// Upper bound on advertised services accepted from the host.
    pub max_services: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            services: Vec::new(),
            require_services: true,
            max_services: 256,
        }
    }
}

impl HandshakeConfig {
    pub fn with_services(mut self, services: impl IntoIterator<Item = ServiceRequest>) -> Self {
        self.services = services.into_iter().collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn require_services(mut self, require: bool) -> Self {
        self.require_services = require;
        self
    }
}

/// Query host info, enable services and freeze the result.
pub(crate) fn perform_handshake(
    runtime: &Runtime,
    config: &HandshakeConfig,
) -> Result<ServiceRegistry> {
    for request in &config.services {
        validate_service_name(&request.name)?;
        if let Some(version) = &request.version {
            validate_version(version)?;
        }
    }

    let host: HostInfo = runtime
        .call(SCOPE_SERVICE, HOST_INFO, Bytes::new(), config.timeout)
        .map_err(|err| handshake_failure("host info", err))?
        .decode()
        .map_err(|err| handshake_failure("host info", err))?;
    debug!(
        stp_version = host.stp_version,
        core_version = %host.core_version,
        advertised = host.services.len(),
        "received host info"
    );

    let advertised = normalize_services(&host, config.max_services)?;

    let targets: Vec<ServiceRequest> = if config.services.is_empty() {
        advertised
            .iter()
            .filter(|d| d.name() != SCOPE_SERVICE)
            .map(|d| ServiceRequest::new(d.name()))
            .collect()
    } else {
        let mut targets = Vec::with_capacity(config.services.len());
        for request in &config.services {
            if advertised.iter().any(|d| d.name() == request.name) {
                targets.push(request.clone());
            } else if config.require_services {
                return Err(ScopeError::HandshakeFailed(format!(
                    "service '{}' is not offered by the host",
                    request.name
                )));
            } else {
                warn!(service = %request.name, "requested service not offered; skipping");
            }
        }
        targets
    };

    let mut descriptors: Vec<ServiceDescriptor> = advertised
        .iter()
        .filter(|d| d.name() == SCOPE_SERVICE)
        .cloned()
        .collect();

    for request in &targets {
        if request.name == SCOPE_SERVICE {
            continue;
        }
        let descriptor = match enable_service(runtime, request, config.timeout) {
            Ok(descriptor) => descriptor,
            Err(err @ ScopeError::Remote { .. }) if !config.require_services => {
                warn!(service = %request.name, error = %err, "service could not be enabled; skipping");
                continue;
            }
            Err(err) => return Err(err),
        };
        if let Some(problem) = incompatibility(request, &descriptor)? {
            if config.require_services {
                return Err(ScopeError::HandshakeFailed(problem));
            }
            warn!(service = %request.name, %problem, "negotiated version not usable; skipping");
            continue;
        }
        descriptors.push(descriptor);
    }

    let registry = ServiceRegistry::new(host, descriptors);
    info!(services = registry.len(), "handshake complete");
    Ok(registry)
}

fn enable_service(
    runtime: &Runtime,
    request: &ServiceRequest,
    timeout: Duration,
) -> Result<ServiceDescriptor> {
    let body = encode_payload(&EnableRequest {
        name: request.name.clone(),
        version: request.version.clone(),
    })?;

    let response: EnableResponse = match runtime.call(SCOPE_SERVICE, ENABLE, body, timeout) {
        Ok(response) => response.decode()?,
        Err(err @ ScopeError::Remote { .. }) => return Err(err),
        Err(err) => return Err(handshake_failure("enable", err)),
    };

    if response.name != request.name {
        return Err(ScopeError::HandshakeFailed(format!(
            "enabled '{}' when '{}' was requested",
            response.name, request.name
        )));
    }

    validate_version(&response.version)?;
    let negotiated = parse_service_version(&response.version)
        .map_err(|err| ScopeError::HandshakeFailed(err.to_string()))?;

    debug!(service = %request.name, version = %negotiated, "service enabled");
    Ok(ServiceDescriptor::new(request.name.clone(), negotiated))
}

/// Why the negotiated version cannot serve the request, if it cannot.
fn incompatibility(
    request: &ServiceRequest,
    descriptor: &ServiceDescriptor,
) -> Result<Option<String>> {
    let Some(requested) = &request.version else {
        return Ok(None);
    };
    let requested = parse_service_version(requested)?;
    if is_version_compatible(&requested, descriptor.version()) {
        return Ok(None);
    }
    Ok(Some(format!(
        "incompatible {} version {} (requested {})",
        request.name,
        descriptor.version(),
        requested
    )))
}

/// Advertised services with duplicates dropped (first wins) and
/// unparsable versions skipped.
fn normalize_services(host: &HostInfo, max_services: usize) -> Result<Vec<ServiceDescriptor>> {
    if host.services.len() > max_services {
        return Err(ScopeError::HandshakeFailed(format!(
            "too many services advertised: {} (max {})",
            host.services.len(),
            max_services
        )));
    }

    let mut seen = HashSet::with_capacity(host.services.len());
    let mut out = Vec::with_capacity(host.services.len());

    for service in &host.services {
        validate_service_name(&service.name)?;
        if !seen.insert(service.name.as_str()) {
            continue;
        }
        match parse_service_version(&service.version) {
            Ok(version) => out.push(ServiceDescriptor::new(service.name.clone(), version)),
            Err(_) => {
                warn!(
                    service = %service.name,
                    version = %service.version,
                    "advertised service has an unparsable version; skipping"
                );
            }
        }
    }

    Ok(out)
}

/// Handshake-stage failures become `HandshakeFailed`; loss of the
/// connection stays `Disconnected`.
fn handshake_failure(stage: &str, err: ScopeError) -> ScopeError {
    match err {
        ScopeError::Disconnected(_) | ScopeError::Transport(_) | ScopeError::Io(_) => err,
        other => ScopeError::HandshakeFailed(format!("{stage}: {other}")),
    }
}

fn validate_service_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SERVICE_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid {
        return Err(ScopeError::HandshakeFailed(format!(
            "invalid service name '{name}'"
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(ScopeError::HandshakeFailed(format!(
            "invalid version length: {}",
            version.len()
        )));
    }
    parse_service_version(version)?;
    Ok(())
}

/// Same major, and the negotiated minor is not below the requested one.
fn is_version_compatible(requested: &Version, negotiated: &Version) -> bool {
    requested.major == negotiated.major && negotiated.minor >= requested.minor
}
