//! Pod loading: descriptor to effective model.
//!
//! The [`Loader`] substitutes variables into every string field, resolves
//! service extensions, enriches services from their image manifests,
//! synthesizes volumes for path mounts and image mount points, and collapses
//! the substitutable scalar wrappers to native types.

use crate::constants::{DEFAULT_CHECK_INTERVAL, DEFAULT_STOP_GRACE_PERIOD};
use crate::descriptor::paths::{abs_path, is_path, rel_path, to_id};
use crate::descriptor::{
    BoolVal, Descriptors, HealthCheckDescriptor, NumberVal, PodDescriptor,
    PortBindingDescriptor, ServiceDescriptor,
};
use crate::error::{Error, Result};
use crate::image::ImageResolver;
use crate::pod::{HealthCheck, Pod, PortBinding, Service, Volume};
use crate::substitution::Substitutes;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Builds effective [`Pod`]s from normalized descriptors.
pub struct Loader<'a> {
    descriptors: &'a mut Descriptors,
    images: &'a dyn ImageResolver,
    default_volume_base_dir: String,
    substitutes: Substitutes,
}

impl<'a> Loader<'a> {
    /// Creates a loader whose substitution environment is the process
    /// environment overlaid by a `.env` file in the working directory
    /// (file entries win).
    pub fn new(
        descriptors: &'a mut Descriptors,
        images: &'a dyn ImageResolver,
        default_volume_base_dir: impl Into<String>,
    ) -> Result<Self> {
        let env = substitution_env(Path::new("."))?;
        Ok(Self {
            descriptors,
            images,
            default_volume_base_dir: default_volume_base_dir.into(),
            substitutes: Substitutes::new(env),
        })
    }

    /// Creates a loader with an explicit substitution environment instead
    /// of the process environment.
    pub fn with_substitutes(
        descriptors: &'a mut Descriptors,
        images: &'a dyn ImageResolver,
        default_volume_base_dir: impl Into<String>,
        substitutes: Substitutes,
    ) -> Self {
        Self {
            descriptors,
            images,
            default_volume_base_dir: default_volume_base_dir.into(),
            substitutes,
        }
    }

    /// Resolves `descriptor` into a frozen [`Pod`].
    pub async fn load_pod(&mut self, descriptor: &PodDescriptor) -> Result<Pod> {
        let mut d = descriptor.clone();
        self.descriptors.resolve_extensions(&mut d)?;
        let file = d.file.to_string_lossy().to_string();

        let name = self.string(&d.name);
        let mut hostname = self.string(&d.hostname);
        let mut domainname = self.string(&d.domainname);
        if hostname.is_empty() {
            hostname = name.clone();
        }
        // A dotted hostname carries the domain with it.
        if let Some(dot) = hostname.find('.') {
            domainname = hostname[dot + 1..].to_string();
            hostname = hostname[..dot].to_string();
        }

        let mut services = IndexMap::new();
        for (key, svc) in &d.services {
            services.insert(key.clone(), self.load_service(svc, &file).await?);
        }

        let mut volumes = IndexMap::new();
        for (key, vol) in &d.volumes {
            let kind = if vol.kind.is_empty() { "host" } else { &vol.kind };
            volumes.insert(
                key.clone(),
                Volume {
                    source: abs_path(&self.string(&vol.source), &file),
                    kind: kind.to_string(),
                    readonly: self.bool(&vol.readonly)?,
                },
            );
        }

        let mut pod = Pod {
            file: PathBuf::from(&file),
            name,
            hostname,
            domainname,
            net: self.string_seq(&d.net),
            dns: self.string_seq(&d.dns),
            dns_search: self.string_seq(&d.dns_search),
            disable_hosts_injection: self.bool(&d.disable_hosts_injection)?,
            environment: self.string_map(&d.environment),
            services,
            volumes,
            shared_keys: self.string_map(&d.shared_keys),
            shared_keys_override_allowed: self.bool(&d.shared_keys_override_allowed)?,
            stop_grace_period: self.duration(&d.stop_grace_period, DEFAULT_STOP_GRACE_PERIOD)?,
        };

        self.file_mounts_to_volumes(&mut pod);
        self.add_image_volumes(&mut pod).await?;
        Ok(pod)
    }

    async fn load_service(&self, svc: &ServiceDescriptor, file: &str) -> Result<Service> {
        let mut image = self.string(&svc.image);

        // Locally built images are named after their Dockerfile so rebuilds
        // with a newer Dockerfile get a fresh tag.
        if let Some(build) = &svc.build {
            let context = abs_path(&self.string(&build.context), file);
            let mut dockerfile = self.string(&build.dockerfile);
            if dockerfile.is_empty() {
                dockerfile = "Dockerfile".to_string();
            }
            let dockerfile = abs_path(&dockerfile, &format!("{context}/"));
            if image.is_empty() {
                image = generated_image_name(&dockerfile)?;
            }
            self.images.build_image(&image, &dockerfile, &context).await?;
        }
        if image.is_empty() {
            return Err(Error::config(file, ".services", "service has no image"));
        }
        let img = self.images.image(&image).await?;

        let mut entrypoint = svc
            .entrypoint
            .as_deref()
            .map(|e| self.string_seq(e))
            .unwrap_or_default();
        let mut command = svc
            .command
            .as_deref()
            .map(|c| self.string_seq(c))
            .unwrap_or_default();
        if entrypoint.is_empty() {
            let first = img.exec.first().ok_or_else(|| Error::Image {
                name: image.clone(),
                reason: "image manifest declares no exec command".to_string(),
            })?;
            entrypoint = vec![first.clone()];
            if command.is_empty() {
                command = img.exec[1..].to_vec();
            }
        }

        let mut environment = IndexMap::new();
        for env_file in &svc.env_file {
            let env_file = abs_path(&self.string(env_file), file);
            read_env_file(Path::new(&env_file), &mut environment)?;
        }
        for (k, v) in &svc.environment {
            environment.insert(k.clone(), self.string(v));
        }

        let mut ports: Vec<PortBinding> = Vec::new();
        for p in &svc.ports {
            let binding = self.port_binding(p, file)?;
            match ports
                .iter_mut()
                .find(|e| e.target == binding.target && e.protocol == binding.protocol)
            {
                Some(existing) => *existing = binding,
                None => ports.push(binding),
            }
        }

        let mut mounts = IndexMap::new();
        for (target, value) in &svc.mounts {
            mounts.insert(abs_path(&self.string(target), "/"), self.string(value));
        }

        Ok(Service {
            image,
            entrypoint,
            command,
            environment,
            ports,
            mounts,
            health_check: self.health_check(svc.healthcheck.as_ref(), file)?,
        })
    }

    fn port_binding(&self, p: &PortBindingDescriptor, file: &str) -> Result<PortBinding> {
        let target = self.u16(&p.target)?;
        if target == 0 {
            return Err(Error::config(file, ".ports", "invalid target port: 0"));
        }
        let protocol = {
            let proto = self.string(&p.protocol).to_lowercase();
            if proto.is_empty() { "tcp".to_string() } else { proto }
        };
        Ok(PortBinding {
            target,
            published: self.u16(&p.published)?,
            ip: self.string(&p.ip),
            protocol,
        })
    }

    fn health_check(
        &self,
        hc: Option<&HealthCheckDescriptor>,
        file: &str,
    ) -> Result<Option<HealthCheck>> {
        let Some(hc) = hc else { return Ok(None) };
        if !hc.http.is_empty() {
            return Err(Error::config(file, ".healthcheck.http", "HTTP health check unsupported"));
        }
        let interval = self.duration(&hc.interval, DEFAULT_CHECK_INTERVAL)?;
        Ok(Some(HealthCheck {
            command: self.string_seq(&hc.command),
            interval,
            timeout: self.duration(&hc.timeout, interval)?,
            retries: self.u32(&hc.retries)?,
            disable: self.bool(&hc.disable)?,
        }))
    }

    /// Replaces path-shaped mount values with synthesized host volumes.
    fn file_mounts_to_volumes(&self, pod: &mut Pod) {
        let file = pod.file.to_string_lossy().to_string();
        let Pod {
            services, volumes, ..
        } = pod;
        for service in services.values_mut() {
            for value in service.mounts.values_mut() {
                if is_path(value) {
                    let vol_name = to_id(&rel_path(value, &file));
                    let source = abs_path(value, &file);
                    *value = vol_name.clone();
                    volumes.entry(vol_name).or_insert(Volume {
                        source,
                        kind: "host".to_string(),
                        readonly: false,
                    });
                }
            }
        }
    }

    /// Gives every image mount point without a pod volume a host directory
    /// under the default volume base dir.
    async fn add_image_volumes(&self, pod: &mut Pod) -> Result<()> {
        let file = pod.file.to_string_lossy().to_string();
        let Pod {
            services, volumes, ..
        } = pod;
        for service in services.values() {
            let img = self.images.image(&service.image).await?;
            for vol_name in img.mount_points.keys() {
                if !volumes.contains_key(vol_name) {
                    let source =
                        abs_path(&format!("{}/{vol_name}", self.default_volume_base_dir), &file);
                    volumes.insert(
                        vol_name.clone(),
                        Volume {
                            source,
                            kind: "host".to_string(),
                            readonly: false,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Effective Values
    // =========================================================================

    fn string(&self, v: &str) -> String {
        self.substitutes.substitute(v)
    }

    fn string_seq(&self, vs: &[String]) -> Vec<String> {
        vs.iter().map(|v| self.string(v)).collect()
    }

    fn string_map(&self, m: &IndexMap<String, String>) -> IndexMap<String, String> {
        m.iter().map(|(k, v)| (k.clone(), self.string(v))).collect()
    }

    fn bool(&self, v: &BoolVal) -> Result<bool> {
        match v {
            BoolVal::Bool(b) => Ok(*b),
            BoolVal::Expr(s) => {
                let s = self.string(s);
                if s.is_empty() {
                    return Ok(false);
                }
                s.parse().map_err(|_| Error::Value {
                    value: s.clone(),
                    reason: "invalid bool".to_string(),
                })
            }
        }
    }

    fn u32(&self, v: &NumberVal) -> Result<u32> {
        match v {
            NumberVal::Int(n) => u32::try_from(*n).map_err(|_| invalid_number(&n.to_string())),
            NumberVal::Expr(s) => {
                let s = self.string(s);
                if s.is_empty() {
                    return Ok(0);
                }
                s.parse().map_err(|_| invalid_number(&s))
            }
        }
    }

    fn u16(&self, v: &NumberVal) -> Result<u16> {
        let n = self.u32(v)?;
        u16::try_from(n).map_err(|_| invalid_number(&n.to_string()))
    }

    fn duration(&self, v: &str, default: Duration) -> Result<Duration> {
        let v = self.string(v);
        if v.is_empty() {
            return Ok(default);
        }
        humantime::parse_duration(&v).map_err(|e| Error::Duration {
            value: v.clone(),
            reason: e.to_string(),
        })
    }
}

fn invalid_number(value: &str) -> Error {
    Error::Value {
        value: value.to_string(),
        reason: "invalid unsigned integer".to_string(),
    }
}

/// Names a built image after its Dockerfile, tagged with the file's mtime so
/// an edited Dockerfile produces a new tag.
fn generated_image_name(dockerfile: &str) -> Result<String> {
    let meta = std::fs::metadata(dockerfile).map_err(|e| Error::Build {
        name: dockerfile.to_string(),
        reason: format!("cannot access dockerfile: {e}"),
    })?;
    let mtime = meta
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    Ok(format!("local/{}:{}", to_id(dockerfile), mtime))
}

/// The substitution environment: the process environment overlaid by a
/// `.env` file in `work_dir` (file entries win).
pub fn substitution_env(work_dir: &Path) -> Result<IndexMap<String, String>> {
    let mut env: IndexMap<String, String> = std::env::vars().collect();
    let env_file = work_dir.join(".env");
    match std::fs::metadata(&env_file) {
        Ok(_) => read_env_file(&env_file, &mut env)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("cannot access .env file: {e}"),
    }
    Ok(env)
}

/// Reads `KEY=VALUE` lines into `env`; blank and `#`-commented lines are
/// skipped, anything else without `=` is an error naming the line.
pub fn read_env_file(file: &Path, env: &mut IndexMap<String, String>) -> Result<()> {
    let content = std::fs::read_to_string(file).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("cannot open env file {}: {e}", file.display()),
        ))
    })?;
    for (idx, line) in content.lines().enumerate() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            return Err(Error::EnvFile {
                file: file.to_path_buf(),
                line: idx,
            });
        };
        env.insert(k.to_string(), v.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_file_parses_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.env");
        std::fs::write(&good, "# comment\n\nA=1\nB=x=y\n").unwrap();
        let mut env = IndexMap::new();
        read_env_file(&good, &mut env).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");

        let bad = dir.path().join("bad.env");
        std::fs::write(&bad, "A=1\nBROKEN\n").unwrap();
        let err = read_env_file(&bad, &mut IndexMap::new()).unwrap_err();
        assert!(matches!(err, Error::EnvFile { line: 1, .. }));
    }
}
