//! Descriptor model: the on-disk pod description before any resolution.
//!
//! This is the shape both input dialects normalize into. Numeric and
//! boolean positions use [`NumberVal`] / [`BoolVal`] so that a variable
//! substitution expression (`"${HTTP_PORT}"`) can stand in for a native
//! value; they collapse to native types in the pod loader, after
//! substitution ran.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A parsed pod descriptor, normalized from JSON or the compose dialect.
///
/// Read-only once the loader returned it; extension resolution is the only
/// mutation pass and clears every `extends` field it consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodDescriptor {
    /// Source file, used to resolve relative paths. Not part of the wire format.
    #[serde(skip)]
    pub file: PathBuf,
    #[serde(default = "default_version")]
    pub version: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "dns_search")]
    pub dns_search: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domainname: String,
    #[serde(
        default,
        skip_serializing_if = "BoolVal::is_default",
        rename = "disable_hosts_injection"
    )]
    pub disable_hosts_injection: BoolVal,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,
    pub services: IndexMap<String, ServiceDescriptor>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub volumes: IndexMap<String, VolumeDescriptor>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty", rename = "shared_keys")]
    pub shared_keys: IndexMap<String, String>,
    #[serde(
        default,
        skip_serializing_if = "BoolVal::is_default",
        rename = "shared_keys_overridable"
    )]
    pub shared_keys_override_allowed: BoolVal,
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "stop_grace_period")]
    pub stop_grace_period: String,
}

fn default_version() -> u8 {
    1
}

impl PodDescriptor {
    pub fn new() -> Self {
        Self {
            file: PathBuf::new(),
            version: 1,
            name: String::new(),
            net: Vec::new(),
            dns: Vec::new(),
            dns_search: Vec::new(),
            hostname: String::new(),
            domainname: String::new(),
            disable_hosts_injection: BoolVal::default(),
            environment: IndexMap::new(),
            services: IndexMap::new(),
            volumes: IndexMap::new(),
            shared_keys: IndexMap::new(),
            shared_keys_override_allowed: BoolVal::default(),
            stop_grace_period: String::new(),
        }
    }

    /// Renders the effective descriptor as pretty-printed JSON, the format
    /// the `dump` command prints and the native dialect reads back.
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).expect("descriptor serialization cannot fail")
    }
}

impl Default for PodDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// One service entry inside a pod descriptor.
///
/// `entrypoint` and `command` distinguish "absent" (`None`, inheritable via
/// `extends`) from "explicitly empty" (`Some(vec![])`, which shadows the
/// base service).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<ServiceExtension>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<ServiceBuildDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "env_file")]
    pub env_file: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheckDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortBindingDescriptor>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub mounts: IndexMap<String, String>,
}

/// Build instructions for a locally built image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceBuildDescriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dockerfile: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, String>,
}

/// Reference to a base service this service inherits from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceExtension {
    /// Descriptor file holding the base service; empty means "this file".
    #[serde(default)]
    pub file: String,
    pub service: String,
}

/// One port binding before numeric resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortBindingDescriptor {
    pub target: NumberVal,
    #[serde(default, skip_serializing_if = "NumberVal::is_default")]
    pub published: NumberVal,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

/// A named filesystem resource mountable into services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeDescriptor {
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "BoolVal::is_default")]
    pub readonly: BoolVal,
}

/// An exec-in-container health probe before duration resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckDescriptor {
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "cmd")]
    pub command: Vec<String>,
    /// HTTP probes are not supported; kept so the loader can reject them
    /// explicitly instead of silently ignoring the field.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interval: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default, skip_serializing_if = "NumberVal::is_default")]
    pub retries: NumberVal,
    #[serde(default, skip_serializing_if = "BoolVal::is_default")]
    pub disable: BoolVal,
}

// =============================================================================
// Substitutable Scalars
// =============================================================================

/// A boolean position that may hold a substitution expression.
///
/// Serialization normalizes recognizable booleans back to JSON booleans;
/// anything else stays a quoted string so it survives until the loader
/// substitutes and parses it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BoolVal {
    Bool(bool),
    Expr(String),
}

impl serde::Serialize for BoolVal {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            BoolVal::Bool(b) => serializer.serialize_bool(*b),
            BoolVal::Expr(s) => match s.as_str() {
                "" | "false" => serializer.serialize_bool(false),
                "true" => serializer.serialize_bool(true),
                other => serializer.serialize_str(other),
            },
        }
    }
}

impl BoolVal {
    pub fn is_default(&self) -> bool {
        matches!(self, BoolVal::Bool(false))
    }

    /// The raw string content handed to variable substitution.
    pub fn raw(&self) -> String {
        match self {
            BoolVal::Bool(b) => b.to_string(),
            BoolVal::Expr(s) => s.clone(),
        }
    }
}

impl Default for BoolVal {
    fn default() -> Self {
        BoolVal::Bool(false)
    }
}

/// A numeric position that may hold a substitution expression.
///
/// Serialization normalizes integer-shaped content back to a JSON number;
/// non-integer string content (e.g. an unsubstituted `"${PORT}"`) writes
/// back as a quoted string. The type exists solely so substitution output
/// can occupy numeric positions; the loader collapses it to a native
/// integer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NumberVal {
    Int(u64),
    Expr(String),
}

impl serde::Serialize for NumberVal {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            NumberVal::Int(n) => serializer.serialize_u64(*n),
            NumberVal::Expr(s) => {
                if s.is_empty() {
                    serializer.serialize_u64(0)
                } else if let Ok(n) = s.parse::<u64>() {
                    serializer.serialize_u64(n)
                } else {
                    serializer.serialize_str(s)
                }
            }
        }
    }
}

impl NumberVal {
    pub fn is_default(&self) -> bool {
        matches!(self, NumberVal::Int(0)) || matches!(self, NumberVal::Expr(s) if s.is_empty())
    }

    /// The raw string content handed to variable substitution.
    pub fn raw(&self) -> String {
        match self {
            NumberVal::Int(n) => n.to_string(),
            NumberVal::Expr(s) => s.clone(),
        }
    }
}

impl Default for NumberVal {
    fn default() -> Self {
        NumberVal::Int(0)
    }
}

impl From<u16> for NumberVal {
    fn from(n: u16) -> Self {
        NumberVal::Int(u64::from(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_val_round_trips() {
        let native: BoolVal = serde_json::from_str("true").unwrap();
        assert_eq!(native, BoolVal::Bool(true));
        assert_eq!(serde_json::to_string(&native).unwrap(), "true");

        let expr: BoolVal = serde_json::from_str("\"${DISABLE}\"").unwrap();
        assert_eq!(expr, BoolVal::Expr("${DISABLE}".to_string()));
        assert_eq!(serde_json::to_string(&expr).unwrap(), "\"${DISABLE}\"");
    }

    #[test]
    fn number_val_round_trips() {
        let native: NumberVal = serde_json::from_str("8080").unwrap();
        assert_eq!(native, NumberVal::Int(8080));
        assert_eq!(serde_json::to_string(&native).unwrap(), "8080");

        let expr: NumberVal = serde_json::from_str("\"${PORT}\"").unwrap();
        assert_eq!(serde_json::to_string(&expr).unwrap(), "\"${PORT}\"");
    }

    #[test]
    fn minimal_descriptor_parses() {
        let json = r#"{"services": {"web": {"image": "docker://nginx"}}}"#;
        let d: PodDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.version, 1);
        assert_eq!(d.services.len(), 1);
        assert_eq!(d.services["web"].image, "docker://nginx");
        assert!(d.services["web"].entrypoint.is_none());
    }
}
