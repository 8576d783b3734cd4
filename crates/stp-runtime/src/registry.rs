use std::collections::{BTreeMap, HashSet};
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, ScopeError};

/// Service entry as advertised in the host info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
}

/// What the browser reports about itself during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    pub stp_version: u32,
    pub core_version: String,
    pub platform: String,
    pub operating_system: String,
    pub user_agent: String,
    pub services: Vec<ServiceInfo>,
}

/// A negotiated service and its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    name: String,
    version: Version,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Build a descriptor from the browser's version text ("2.0", "2.0.1").
    pub fn parse(name: impl Into<String>, version: &str) -> Result<Self> {
        Ok(Self::new(name, parse_service_version(version)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }
}

/// Parse a dotted service version, padding missing components with zero.
///
/// Browsers report "2.0" as often as "2.0.1"; both are accepted. Anything
/// else (empty, more than three parts, non-numeric) is `InvalidVersion`.
pub fn parse_service_version(text: &str) -> Result<Version> {
    let trimmed = text.trim();
    let invalid = || ScopeError::InvalidVersion(text.to_string());

    let parts: Vec<&str> = trimmed.split('.').collect();
    if trimmed.is_empty() || parts.len() > 3 {
        return Err(invalid());
    }

    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        *slot = part.parse().map_err(|_| invalid())?;
    }

    Ok(Version::new(numbers[0], numbers[1], numbers[2]))
}

/// Optional behaviours gated on negotiated service versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// exec can repeat a mouse action in one command (>= 2.2).
    MouseRepeatCount,
    /// exec's "Close page" action targets a window id (>= 2.0.1).
    WindowScopedClosePage,
    /// core answers browser information requests (>= 1.2).
    BrowserInformation,
}

struct Requirement {
    capability: Capability,
    name: &'static str,
    service: &'static str,
    min: (u64, u64, u64),
}

const REQUIREMENTS: &[Requirement] = &[
    Requirement {
        capability: Capability::MouseRepeatCount,
        name: "mouse-repeat-count",
        service: "exec",
        min: (2, 2, 0),
    },
    Requirement {
        capability: Capability::WindowScopedClosePage,
        name: "window-scoped-close-page",
        service: "exec",
        min: (2, 0, 1),
    },
    Requirement {
        capability: Capability::BrowserInformation,
        name: "browser-information",
        service: "core",
        min: (1, 2, 0),
    },
];

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::MouseRepeatCount,
        Capability::WindowScopedClosePage,
        Capability::BrowserInformation,
    ];

    fn requirement(self) -> &'static Requirement {
        // REQUIREMENTS lists every variant in declaration order.
        let requirement = &REQUIREMENTS[self as usize];
        debug_assert_eq!(requirement.capability, self);
        requirement
    }

    pub fn name(self) -> &'static str {
        self.requirement().name
    }

    /// Service whose version decides the capability.
    pub fn service(self) -> &'static str {
        self.requirement().service
    }

    pub fn min_version(self) -> Version {
        let (major, minor, patch) = self.requirement().min;
        Version::new(major, minor, patch)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capabilities available on a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet {
    enabled: HashSet<Capability>,
}

impl CapabilitySet {
    pub fn contains(&self, capability: Capability) -> bool {
        self.enabled.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL
            .into_iter()
            .filter(|capability| self.enabled.contains(capability))
    }

    pub fn len(&self) -> usize {
        self.enabled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }
}

/// Services negotiated during the handshake.
///
/// Built once when the handshake completes and never modified afterwards,
/// so reads need no locking.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    host: HostInfo,
    services: BTreeMap<String, ServiceDescriptor>,
    capabilities: CapabilitySet,
}

impl ServiceRegistry {
    pub fn new(host: HostInfo, services: impl IntoIterator<Item = ServiceDescriptor>) -> Self {
        let services: BTreeMap<String, ServiceDescriptor> = services
            .into_iter()
            .map(|descriptor| (descriptor.name.clone(), descriptor))
            .collect();

        let enabled = Capability::ALL
            .into_iter()
            .filter(|capability| {
                services
                    .get(capability.service())
                    .is_some_and(|d| d.version >= capability.min_version())
            })
            .collect();

        let registry = Self {
            host,
            services,
            capabilities: CapabilitySet { enabled },
        };
        debug!(
            services = registry.services.len(),
            capabilities = ?registry.capabilities.iter().map(Capability::name).collect::<Vec<_>>(),
            "service registry resolved"
        );
        registry
    }

    pub fn host_info(&self) -> &HostInfo {
        &self.host
    }

    pub fn get(&self, service: &str) -> Option<&ServiceDescriptor> {
        self.services.get(service)
    }

    pub fn version(&self, service: &str) -> Option<&Version> {
        self.services.get(service).map(|d| &d.version)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    /// Negotiated services, ordered by name.
    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// True when `service` was negotiated at `version` or newer.
    ///
    /// Unknown services and unparsable versions answer false.
    pub fn is_version_at_least(&self, service: &str, version: &str) -> bool {
        let Some(negotiated) = self.version(service) else {
            return false;
        };
        match parse_service_version(version) {
            Ok(wanted) => *negotiated >= wanted,
            Err(_) => {
                warn!(service, version, "ignoring unparsable version in comparison");
                false
            }
        }
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// `Ok` when `capability` is available, `FeatureUnavailable` otherwise.
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.has_capability(capability) {
            return Ok(());
        }
        Err(ScopeError::FeatureUnavailable {
            capability: capability.name(),
            service: capability.service(),
            required: capability.min_version().to_string(),
            negotiated: self.version(capability.service()).map(Version::to_string),
        })
    }

    /// `Ok` when `service` was negotiated, `UnknownService` otherwise.
    pub fn require_service(&self, service: &str) -> Result<&ServiceDescriptor> {
        self.get(service)
            .ok_or_else(|| ScopeError::UnknownService(service.to_string()))
    }
}
