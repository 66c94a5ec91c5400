//! The effective pod model.
//!
//! A [`Pod`] is what the loader produces after variable substitution,
//! extension resolution and image enrichment: every field is native-typed,
//! every mount references a declared volume, every service has a non-empty
//! entrypoint. The launcher treats it as frozen.

use indexmap::IndexMap;
use std::path::PathBuf;
use std::time::Duration;

/// A fully-resolved unit of co-located containers.
#[derive(Debug, Clone)]
pub struct Pod {
    /// Source descriptor path; relative volume sources resolve against it.
    pub file: PathBuf,
    /// DNS label naming the pod; doubles as the default hostname.
    pub name: String,
    pub hostname: String,
    pub domainname: String,
    pub net: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    /// Suppresses service-name entries in the generated hosts file.
    pub disable_hosts_injection: bool,
    /// Pod-level environment, passed to the runtime via `--set-env`.
    pub environment: IndexMap<String, String>,
    pub services: IndexMap<String, Service>,
    pub volumes: IndexMap<String, Volume>,
    /// KV entries published next to the service registration.
    pub shared_keys: IndexMap<String, String>,
    pub shared_keys_override_allowed: bool,
    /// Time between `rkt stop` and a forced kill.
    pub stop_grace_period: Duration,
}

/// One container specification inside a pod.
#[derive(Debug, Clone, Default)]
pub struct Service {
    /// Canonical image URI (`docker://…` or `local/…:tag`).
    pub image: String,
    /// Never empty; inherited from the image manifest when unset.
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub environment: IndexMap<String, String>,
    pub ports: Vec<PortBinding>,
    /// Absolute target path to volume name.
    pub mounts: IndexMap<String, String>,
    pub health_check: Option<HealthCheck>,
}

/// A published container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub target: u16,
    /// 0 lets the runtime pick (or mirrors the target).
    pub published: u16,
    pub ip: String,
    /// Lowercased, `tcp` or `udp`.
    pub protocol: String,
}

/// A named filesystem resource mountable into services.
#[derive(Debug, Clone)]
pub struct Volume {
    /// Absolute host path.
    pub source: String,
    pub kind: String,
    pub readonly: bool,
}

/// An exec-in-container health probe.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Probe argv run inside the container; empty disables the check.
    pub command: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    pub disable: bool,
}

impl Pod {
    /// The hostname entry for the hosts file, FQDN when a domain is set.
    pub fn fqdn(&self) -> String {
        let fqdn = format!("{}.{}", self.hostname, self.domainname);
        fqdn.trim_end_matches('.').to_string()
    }

    /// True when any service runs a converted Docker image, which requires
    /// relaxed image verification on the runtime.
    pub fn contains_docker_image(&self) -> bool {
        self.services
            .values()
            .any(|s| s.image.starts_with("docker://"))
    }
}
