//! Descriptor loading, defaults, validation and extension resolution.
//!
//! [`Descriptors`] caches every loaded file by cleaned absolute path so that
//! cross-file `extends` chains and repeated loads hit the disk once.

use super::compose::transform_compose;
use super::model::{PodDescriptor, ServiceDescriptor, ServiceExtension};
use super::paths::{abs_path, rel_path};
use crate::constants::DESCRIPTOR_FILE_CANDIDATES;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Loader and cache for pod descriptors.
pub struct Descriptors {
    cache: HashMap<PathBuf, PodDescriptor>,
    default_volume_base_dir: String,
}

impl Descriptors {
    pub fn new(default_volume_base_dir: impl Into<String>) -> Self {
        Self {
            cache: HashMap::new(),
            default_volume_base_dir: default_volume_base_dir.into(),
        }
    }

    /// Loads the descriptor at `file` (or inside it, if a directory),
    /// normalized and validated but with extensions still unresolved.
    pub fn descriptor(&mut self, file: &Path) -> Result<PodDescriptor> {
        let file = std::path::absolute(file)?;
        let file = PathBuf::from(super::paths::clean(&file.to_string_lossy()));
        if let Some(cached) = self.cache.get(&file) {
            return Ok(cached.clone());
        }
        let resolved = resolve_descriptor_file(&file)?;
        let mut pod = self.read_file(&resolved)?;
        pod.file = resolved.clone();
        apply_defaults(&mut pod);
        validate(&pod)?;
        self.cache.insert(file.clone(), pod.clone());
        if resolved != file {
            // Directory lookups cache under both the directory and the file.
            self.cache.insert(resolved, pod.clone());
        }
        Ok(pod)
    }

    fn read_file(&self, file: &Path) -> Result<PodDescriptor> {
        let content = std::fs::read_to_string(file)?;
        let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("");
        if ext == "yml" || ext == "yaml" {
            let doc: serde_yaml::Value =
                serde_yaml::from_str(&content).map_err(|e| Error::Parse {
                    file: file.to_path_buf(),
                    reason: e.to_string(),
                })?;
            transform_compose(&doc, file, &self.default_volume_base_dir)
        } else {
            let mut pod: PodDescriptor =
                serde_json::from_str(&content).map_err(|e| Error::Parse {
                    file: file.to_path_buf(),
                    reason: e.to_string(),
                })?;
            pod.file = file.to_path_buf();
            Ok(pod)
        }
    }

    // =========================================================================
    // Extension Resolution
    // =========================================================================

    /// Resolves every `extends` reference in `pod`, merging base services
    /// into derived ones with derived precedence. Cycles across the chain of
    /// `<file>/<service>` keys are an error.
    pub fn resolve_extensions(&mut self, pod: &mut PodDescriptor) -> Result<()> {
        let keys: Vec<String> = pod.services.keys().cloned().collect();
        for key in keys {
            let mut service = pod.services[&key].clone();
            let mut visited = Vec::new();
            self.resolve_service(pod, &key, &mut service, &mut visited)?;
            pod.services[&key] = service;
        }
        Ok(())
    }

    fn resolve_service(
        &mut self,
        pod: &mut PodDescriptor,
        key: &str,
        service: &mut ServiceDescriptor,
        visited: &mut Vec<String>,
    ) -> Result<()> {
        let Some(ext) = service.extends.clone() else {
            return Ok(());
        };
        let pointer = format!(".services.{key}.extends");
        if ext.service.is_empty() {
            return Err(Error::config(&pod.file, format!("{pointer}.service"), "empty"));
        }

        if ext.file.is_empty() {
            let mut base = self.lookup_base(pod, &ext, &pointer)?;
            self.check_cycle(&pod.file, &ext.service, visited)?;
            let pod_file = pod.file.clone();
            self.resolve_service(pod, &ext.service, &mut base, visited)?;
            merge_service(service, &base, &pod_file, &pod_file);
        } else {
            let pod_file = pod.file.to_string_lossy().to_string();
            let base_file = abs_path(&ext.file, &pod_file);
            if !Path::new(&base_file).exists() {
                return Err(Error::config(
                    &pod.file,
                    format!("{pointer}.file"),
                    format!("file does not exist: {base_file}"),
                ));
            }
            let mut base_pod = self.descriptor(Path::new(&base_file))?;
            let mut base = self.lookup_base(&base_pod, &ext, &pointer)?;
            self.check_cycle(&base_pod.file, &ext.service, visited)?;
            self.resolve_service(&mut base_pod, &ext.service, &mut base, visited)?;
            merge_service(service, &base, &base_pod.file, &pod.file);
            if pod.hostname.is_empty() {
                pod.hostname = base_pod.hostname.clone();
            }
            if pod.domainname.is_empty() {
                pod.domainname = base_pod.domainname.clone();
            }
        }
        service.extends = None;
        Ok(())
    }

    fn lookup_base(
        &self,
        base_pod: &PodDescriptor,
        ext: &ServiceExtension,
        pointer: &str,
    ) -> Result<ServiceDescriptor> {
        base_pod.services.get(&ext.service).cloned().ok_or_else(|| {
            Error::config(
                &base_pod.file,
                format!("{pointer}.service"),
                format!("unresolvable: {}", ext.service),
            )
        })
    }

    fn check_cycle(&self, base_file: &Path, base_service: &str, visited: &mut Vec<String>) -> Result<()> {
        let ext_key = format!("{}/{base_service}", base_file.display());
        if visited.contains(&ext_key) {
            let mut keys = visited.clone();
            keys.push(ext_key);
            return Err(Error::CircularExtension { keys });
        }
        visited.push(ext_key);
        Ok(())
    }
}

/// Merges `base` into `derived`; derived fields win, relative paths in the
/// base are rewritten to stay valid from the derived descriptor's directory.
fn merge_service(
    derived: &mut ServiceDescriptor,
    base: &ServiceDescriptor,
    base_file: &Path,
    derived_file: &Path,
) {
    let base_file = base_file.to_string_lossy().to_string();
    let derived_file = derived_file.to_string_lossy().to_string();

    if derived.image.is_empty() {
        derived.image = base.image.clone();
    }
    if let Some(base_build) = &base.build {
        let build = derived.build.get_or_insert_with(Default::default);
        if build.context.is_empty() {
            build.context = rel_path(&abs_path(&base_build.context, &base_file), &derived_file);
        }
        if build.dockerfile.is_empty() {
            build.dockerfile = base_build.dockerfile.clone();
        }
        if build.args.is_empty() {
            build.args = base_build.args.clone();
        }
    }
    if derived.entrypoint.is_none() {
        derived.entrypoint = base.entrypoint.clone();
    }
    if derived.command.is_none() {
        derived.command = base.command.clone();
    }

    let mut env_files: Vec<String> = base
        .env_file
        .iter()
        .map(|f| rel_path(&abs_path(f, &base_file), &derived_file))
        .collect();
    env_files.append(&mut derived.env_file);
    derived.env_file = env_files;

    for (k, v) in &base.environment {
        if !derived.environment.contains_key(k) {
            derived.environment.insert(k.clone(), v.clone());
        }
    }

    derived.ports = {
        let taken: Vec<(String, String)> = derived
            .ports
            .iter()
            .map(|p| (p.target.raw(), port_protocol(&p.protocol)))
            .collect();
        let mut merged: Vec<_> = base
            .ports
            .iter()
            .filter(|p| !taken.contains(&(p.target.raw(), port_protocol(&p.protocol))))
            .cloned()
            .collect();
        merged.append(&mut derived.ports);
        merged
    };

    let mut mounts = IndexMap::new();
    for (target, value) in &base.mounts {
        mounts.insert(target.clone(), rebase_mount(value, &base_file, &derived_file));
    }
    for (target, value) in &derived.mounts {
        mounts.insert(target.clone(), value.clone());
    }
    derived.mounts = mounts;

    if derived.healthcheck.is_none() {
        derived.healthcheck = base.healthcheck.clone();
    }
}

fn port_protocol(protocol: &str) -> String {
    if protocol.is_empty() {
        "tcp".to_string()
    } else {
        protocol.to_string()
    }
}

/// Volume names pass through; path-shaped mount values are rewritten
/// relative to the derived descriptor.
fn rebase_mount(value: &str, base_file: &str, derived_file: &str) -> String {
    if super::paths::is_path(value) {
        rel_path(&abs_path(value, base_file), derived_file)
    } else {
        value.to_string()
    }
}

// =============================================================================
// Defaults and Validation
// =============================================================================

fn apply_defaults(pod: &mut PodDescriptor) {
    for service in pod.services.values_mut() {
        if let Some(hc) = &mut service.healthcheck {
            if hc.interval.is_empty() {
                hc.interval = "10s".to_string();
            }
            if hc.timeout.is_empty() {
                hc.timeout = hc.interval.clone();
            }
        }
    }
    for volume in pod.volumes.values_mut() {
        if volume.kind.is_empty() {
            volume.kind = "host".to_string();
        }
    }
    if pod.stop_grace_period.is_empty() {
        pod.stop_grace_period = "10s".to_string();
    }
}

fn validate(pod: &PodDescriptor) -> Result<()> {
    if pod.services.is_empty() {
        return Err(Error::config(&pod.file, ".services", "empty"));
    }
    for (name, service) in &pod.services {
        let pointer = format!(".services.{name}");
        if !is_valid_id(name) {
            return Err(Error::config(&pod.file, pointer, "invalid service name"));
        }
        if service.image.is_empty() && service.build.is_none() && service.extends.is_none() {
            return Err(Error::config(
                &pod.file,
                format!("{pointer}.{{image|build|extends}}"),
                "empty",
            ));
        }
        if let Some(build) = &service.build {
            if build.context.is_empty() {
                return Err(Error::config(&pod.file, format!("{pointer}.build.context"), "empty"));
            }
        }
        if let Some(ext) = &service.extends {
            if ext.service.is_empty() {
                return Err(Error::config(
                    &pod.file,
                    format!("{pointer}.extends.service"),
                    "empty",
                ));
            }
        }
    }
    for (name, volume) in &pod.volumes {
        if volume.source.is_empty() {
            return Err(Error::config(&pod.file, format!(".volumes.{name}.source"), "empty"));
        }
    }
    Ok(())
}

fn is_valid_id(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Resolves a directory argument to the descriptor file inside it.
fn resolve_descriptor_file(file: &Path) -> Result<PathBuf> {
    let meta = std::fs::metadata(file).map_err(|_| Error::DescriptorNotFound {
        path: file.to_path_buf(),
    })?;
    if !meta.is_dir() {
        return Ok(file.to_path_buf());
    }
    for candidate in DESCRIPTOR_FILE_CANDIDATES {
        let candidate = file.join(candidate);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(Error::DescriptorNotFound {
        path: file.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ids() {
        assert!(is_valid_id("web"));
        assert!(is_valid_id("db-1"));
        assert!(!is_valid_id("Web"));
        assert!(!is_valid_id("a_b"));
        assert!(!is_valid_id(""));
    }
}
