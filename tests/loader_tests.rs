//! Integration tests for the pod loader: substitution, image enrichment and
//! volume synthesis.

use async_trait::async_trait;
use indexmap::IndexMap;
use rktpod::Substitutes;
use rktpod::descriptor::Descriptors;
use rktpod::image::{ImageMetadata, ImageResolver};
use rktpod::loader::{Loader, substitution_env};
use std::fs;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Test Doubles
// =============================================================================

/// Resolver serving canned metadata; records build requests.
#[derive(Default)]
struct FakeImages {
    images: std::sync::Mutex<std::collections::HashMap<String, ImageMetadata>>,
}

impl FakeImages {
    fn with(mut self, name: &str, exec: &[&str], mount_points: &[(&str, &str)]) -> Self {
        let meta = ImageMetadata {
            name: name.to_string(),
            exec: exec.iter().map(|s| s.to_string()).collect(),
            working_directory: String::new(),
            mount_points: mount_points
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ports: IndexMap::new(),
            environment: IndexMap::new(),
        };
        self.images.get_mut().unwrap().insert(name.to_string(), meta);
        self
    }
}

#[async_trait]
impl ImageResolver for FakeImages {
    async fn image(&self, name: &str) -> rktpod::Result<ImageMetadata> {
        self.images
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| rktpod::Error::Image {
                name: name.to_string(),
                reason: "not staged in test".to_string(),
            })
    }

    async fn build_image(
        &self,
        name: &str,
        _dockerfile: &str,
        _context: &str,
    ) -> rktpod::Result<ImageMetadata> {
        self.image(name).await
    }
}

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn test_env(vars: &[(&str, &str)]) -> Substitutes {
    Substitutes::new(
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

// =============================================================================
// Loading
// =============================================================================

#[tokio::test]
async fn load_pod_resolves_substitution_and_images() {
    let dir = tempfile::tempdir().unwrap();
    let file = write(
        dir.path(),
        "pod.json",
        r#"{
  "name": "mypod",
  "hostname": "${HOST_NAME}",
  "disable_hosts_injection": "${DISABLE:-false}",
  "services": {
    "app": {
      "image": "docker://busybox",
      "mounts": {"/data": "./data", "/shared": "sharedvol"},
      "ports": [{"target": "${APP_PORT}", "published": 8080}],
      "healthcheck": {"cmd": ["true"], "interval": "5s"}
    }
  },
  "volumes": {"sharedvol": {"source": "./shared"}}
}"#,
    );
    let images = FakeImages::default().with(
        "docker://busybox",
        &["/bin/sh", "-c", "httpd"],
        &[("cache", "/var/cache")],
    );
    let mut descriptors = Descriptors::new("./volumes");
    let descriptor = descriptors.descriptor(&file).unwrap();
    let mut loader = Loader::with_substitutes(
        &mut descriptors,
        &images,
        "./volumes",
        test_env(&[("HOST_NAME", "web.example.org"), ("APP_PORT", "80")]),
    );
    let pod = loader.load_pod(&descriptor).await.unwrap();

    // Dotted hostname promotes the domain part.
    assert_eq!(pod.hostname, "web");
    assert_eq!(pod.domainname, "example.org");
    assert!(!pod.disable_hosts_injection);
    assert_eq!(pod.stop_grace_period, Duration::from_secs(10));

    let app = &pod.services["app"];
    // Entrypoint comes from the image; the rest of exec becomes the command.
    assert_eq!(app.entrypoint, vec!["/bin/sh"]);
    assert_eq!(app.command, vec!["-c", "httpd"]);
    assert_eq!(app.ports.len(), 1);
    assert_eq!(app.ports[0].target, 80);
    assert_eq!(app.ports[0].published, 8080);
    assert_eq!(app.ports[0].protocol, "tcp");

    let hc = app.health_check.as_ref().unwrap();
    assert_eq!(hc.interval, Duration::from_secs(5));
    assert_eq!(hc.timeout, Duration::from_secs(5), "timeout defaults to interval");

    // The path mount became an anonymous volume.
    assert_eq!(app.mounts["/data"], "data");
    assert_eq!(app.mounts["/shared"], "sharedvol");
    let expect = |suffix: &str| format!("{}/{suffix}", dir.path().to_string_lossy());
    assert_eq!(pod.volumes["data"].source, expect("data"));
    assert_eq!(pod.volumes["sharedvol"].source, expect("shared"));

    // The image mount point got a default-base-dir volume.
    assert_eq!(pod.volumes["cache"].source, expect("volumes/cache"));
    assert_eq!(pod.volumes["cache"].kind, "host");
}

#[tokio::test]
async fn explicit_entrypoint_keeps_command_empty() {
    let dir = tempfile::tempdir().unwrap();
    let file = write(
        dir.path(),
        "pod.json",
        r#"{
  "name": "p",
  "services": {
    "app": {"image": "docker://busybox", "entrypoint": ["/bin/custom"]}
  }
}"#,
    );
    let images = FakeImages::default().with("docker://busybox", &["/bin/sh", "-c", "httpd"], &[]);
    let mut descriptors = Descriptors::new("./volumes");
    let descriptor = descriptors.descriptor(&file).unwrap();
    let mut loader =
        Loader::with_substitutes(&mut descriptors, &images, "./volumes", test_env(&[]));
    let pod = loader.load_pod(&descriptor).await.unwrap();
    let app = &pod.services["app"];
    assert_eq!(app.entrypoint, vec!["/bin/custom"]);
    assert!(app.command.is_empty(), "command must not inherit from the image");
}

#[tokio::test]
async fn hostname_defaults_to_pod_name() {
    let dir = tempfile::tempdir().unwrap();
    let file = write(
        dir.path(),
        "pod.json",
        r#"{"name": "mypod", "services": {"app": {"image": "docker://busybox"}}}"#,
    );
    let images = FakeImages::default().with("docker://busybox", &["/bin/sh"], &[]);
    let mut descriptors = Descriptors::new("./volumes");
    let descriptor = descriptors.descriptor(&file).unwrap();
    let mut loader =
        Loader::with_substitutes(&mut descriptors, &images, "./volumes", test_env(&[]));
    let pod = loader.load_pod(&descriptor).await.unwrap();
    assert_eq!(pod.hostname, "mypod");
    assert_eq!(pod.domainname, "");
}

#[tokio::test]
async fn http_health_checks_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let file = write(
        dir.path(),
        "pod.json",
        r#"{
  "name": "p",
  "services": {
    "app": {
      "image": "docker://busybox",
      "healthcheck": {"http": "http://localhost/health"}
    }
  }
}"#,
    );
    let images = FakeImages::default().with("docker://busybox", &["/bin/sh"], &[]);
    let mut descriptors = Descriptors::new("./volumes");
    let descriptor = descriptors.descriptor(&file).unwrap();
    let mut loader =
        Loader::with_substitutes(&mut descriptors, &images, "./volumes", test_env(&[]));
    let err = loader.load_pod(&descriptor).await.unwrap_err();
    assert!(err.to_string().contains("HTTP health check unsupported"));
}

// =============================================================================
// Substitution Environment
// =============================================================================

#[test]
fn env_file_wins_over_process_environment() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), ".env", "PATH=/only/from/env/file\nEXTRA_TEST_VAR=42\n");
    let env = substitution_env(dir.path()).unwrap();
    assert_eq!(env["PATH"], "/only/from/env/file");
    assert_eq!(env["EXTRA_TEST_VAR"], "42");
}

#[test]
fn missing_env_file_falls_back_to_process_environment() {
    let dir = tempfile::tempdir().unwrap();
    let env = substitution_env(dir.path()).unwrap();
    assert!(env.contains_key("PATH"));
}
