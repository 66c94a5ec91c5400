//! Image resolution through the external container runtime.
//!
//! [`Images`] fetches images with `rkt fetch`, reads their manifests with
//! `rkt image cat-manifest` and memoizes the resulting [`ImageMetadata`]
//! per image name for the process lifetime. Locally built services go
//! through `docker build`, `docker save`, the external `docker2aci`
//! converter and an import into the runtime's store.

use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

/// When the runtime may hit the network for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    /// Use only the local store.
    Never,
    /// Fetch when the image is not in the store yet.
    New,
    /// Always check the remote for a newer version.
    Update,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Never => "never",
            PullPolicy::New => "new",
            PullPolicy::Update => "update",
        }
    }
}

impl std::fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alternative uid/gid images are fetched with, so an unprivileged member
/// of the rkt group can perform fetches.
#[derive(Debug, Clone, Copy)]
pub struct FetchUser {
    pub uid: u32,
    pub gid: u32,
}

/// Everything the pod loader needs to know about an image.
#[derive(Debug, Clone, Default)]
pub struct ImageMetadata {
    pub name: String,
    /// Entrypoint and default arguments; non-empty for runnable images.
    pub exec: Vec<String>,
    pub working_directory: String,
    /// Mount point name to in-container path.
    pub mount_points: IndexMap<String, String>,
    pub ports: IndexMap<String, ImagePort>,
    pub environment: IndexMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ImagePort {
    pub protocol: String,
    pub port: u16,
}

/// Seam between the pod loader and the runtime-backed image store.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    /// Fetches `name` with the configured pull policy and returns its metadata.
    async fn image(&self, name: &str) -> Result<ImageMetadata>;

    /// Ensures a locally built image exists under `name`, building and
    /// importing it when missing.
    async fn build_image(&self, name: &str, dockerfile: &str, context: &str)
    -> Result<ImageMetadata>;
}

/// Runtime-backed image resolver with a per-process metadata cache.
pub struct Images {
    pull_policy: PullPolicy,
    fetch_as: Option<FetchUser>,
    cache: Mutex<HashMap<String, ImageMetadata>>,
}

impl Images {
    pub fn new(pull_policy: PullPolicy, fetch_as: Option<FetchUser>) -> Self {
        Self {
            pull_policy,
            fetch_as,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_image(&self, name: &str, policy: PullPolicy) -> Result<ImageMetadata> {
        debug!("fetching image {name:?} with pull policy {policy}");
        // Docker images carry no signature the runtime could verify.
        let insecure = if name.starts_with("docker://") { "image" } else { "" };
        let mut cmd = Command::new("rkt");
        cmd.arg("fetch")
            .arg(format!("--pull-policy={policy}"))
            .arg(format!("--insecure-options={insecure}"))
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped());
        if policy == PullPolicy::Never {
            cmd.stderr(Stdio::piped());
        } else {
            // Let fetch progress reach the terminal.
            cmd.stderr(Stdio::inherit());
        }
        if let Some(user) = self.fetch_as {
            cmd.uid(user.uid).gid(user.gid);
        }
        let out = cmd.output().await.map_err(|e| Error::Image {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        if !out.status.success() {
            return Err(Error::Image {
                name: name.to_string(),
                reason: format!(
                    "rkt fetch: {}. {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
            });
        }
        let id = String::from_utf8_lossy(&out.stdout)
            .trim_end_matches('\n')
            .to_string();

        let manifest = run_captured(Command::new("rkt").args(["image", "cat-manifest"]).arg(&id))
            .await
            .map_err(|reason| Error::Image {
                name: name.to_string(),
                reason: format!("cannot load image manifest: {reason}"),
            })?;
        let manifest: AciManifest =
            serde_json::from_str(&manifest).map_err(|e| Error::Image {
                name: name.to_string(),
                reason: format!("cannot unmarshal image manifest: {e}"),
            })?;

        let app = manifest.app.unwrap_or_default();
        Ok(ImageMetadata {
            name: name.to_string(),
            exec: app.exec,
            working_directory: app.working_directory,
            mount_points: app.mount_points.into_iter().map(|m| (m.name, m.path)).collect(),
            ports: app
                .ports
                .into_iter()
                .map(|p| {
                    (
                        p.name,
                        ImagePort {
                            protocol: p.protocol,
                            port: p.port,
                        },
                    )
                })
                .collect(),
            environment: app.environment.into_iter().map(|e| (e.name, e.value)).collect(),
        })
    }

    /// Builds the Docker image, converts it to the runtime's native format
    /// and imports it into the local store.
    async fn build_and_import(&self, name: &str, dockerfile: &str, context: &str) -> Result<()> {
        debug!("building docker image {name:?} from {dockerfile:?}");
        let build_dir = Path::new(dockerfile)
            .parent()
            .unwrap_or_else(|| Path::new(context));
        let status = Command::new("docker")
            .args(["build", "-t", name, "--rm"])
            .arg(build_dir)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| build_error(name, e))?;
        if !status.success() {
            return Err(build_error(name, format!("docker build: {status}")));
        }

        let tarball = tempfile::Builder::new()
            .prefix("docker-image-")
            .tempfile()
            .map_err(|e| build_error(name, e))?;
        let tarball_path = tarball.path().to_string_lossy().to_string();
        run_captured(
            Command::new("docker")
                .args(["save", "--output"])
                .arg(&tarball_path)
                .arg(name),
        )
        .await
        .map_err(|reason| build_error(name, format!("cannot export docker image: {reason}")))?;

        // docker2aci drops the converted image into its working directory.
        let convert_dir = tempfile::tempdir().map_err(|e| build_error(name, e))?;
        run_captured(
            Command::new("docker2aci")
                .arg(&tarball_path)
                .current_dir(convert_dir.path()),
        )
        .await
        .map_err(|reason| build_error(name, format!("cannot convert docker image: {reason}")))?;
        let aci = find_aci(convert_dir.path())
            .ok_or_else(|| build_error(name, "converter produced no ACI file"))?;

        // Import by preparing and immediately discarding a pod.
        let uuid = run_captured(
            Command::new("rkt")
                .args(["prepare", "--quiet=true", "--insecure-options=image"])
                .arg(&aci),
        )
        .await
        .map_err(|reason| build_error(name, format!("cannot import converted image: {reason}")))?;
        let uuid = uuid.trim_end_matches('\n');
        run_captured(Command::new("rkt").args(["rm", uuid]))
            .await
            .map_err(|reason| {
                build_error(name, format!("cannot remove import pod {uuid:?}: {reason}"))
            })?;
        Ok(())
    }
}

#[async_trait]
impl ImageResolver for Images {
    async fn image(&self, name: &str) -> Result<ImageMetadata> {
        let mut cache = self.cache.lock().await;
        if let Some(img) = cache.get(name) {
            return Ok(img.clone());
        }
        let img = self.fetch_image(name, self.pull_policy).await?;
        cache.insert(name.to_string(), img.clone());
        Ok(img)
    }

    async fn build_image(
        &self,
        name: &str,
        dockerfile: &str,
        context: &str,
    ) -> Result<ImageMetadata> {
        let mut cache = self.cache.lock().await;
        if let Some(img) = cache.get(name) {
            return Ok(img.clone());
        }
        // A previous run may have imported this build already.
        let img = match self.fetch_image(name, PullPolicy::Never).await {
            Ok(img) => img,
            Err(_) => {
                self.build_and_import(name, dockerfile, context).await?;
                self.fetch_image(name, PullPolicy::Never).await?
            }
        };
        cache.insert(name.to_string(), img.clone());
        Ok(img)
    }
}

fn build_error(name: &str, reason: impl std::fmt::Display) -> Error {
    Error::Build {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Runs a command, returning stdout on success and a message including the
/// captured stderr on failure.
async fn run_captured(cmd: &mut Command) -> std::result::Result<String, String> {
    let out = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if !out.status.success() {
        return Err(format!(
            "{}. {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

fn find_aci(dir: &Path) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("aci") {
            return Some(path.to_string_lossy().to_string());
        }
    }
    None
}

// =============================================================================
// Manifest Wire Format
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct AciManifest {
    #[serde(default)]
    app: Option<AciApp>,
}

#[derive(Debug, Default, Deserialize)]
struct AciApp {
    #[serde(default)]
    exec: Vec<String>,
    #[serde(default, rename = "workingDirectory")]
    working_directory: String,
    #[serde(default, rename = "mountPoints")]
    mount_points: Vec<AciMountPoint>,
    #[serde(default)]
    ports: Vec<AciPort>,
    #[serde(default)]
    environment: Vec<AciEnvVar>,
}

#[derive(Debug, Deserialize)]
struct AciMountPoint {
    name: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct AciPort {
    name: String,
    #[serde(default)]
    protocol: String,
    #[serde(default)]
    port: u16,
}

#[derive(Debug, Deserialize)]
struct AciEnvVar {
    name: String,
    #[serde(default)]
    value: String,
}
