//! Pod lifecycle supervision on top of the rkt CLI.
//!
//! [`PodLauncher`] drives the prepare → run → await-ready → notify-listener
//! pipeline, owns the run process, and guarantees teardown ordering: the
//! lifecycle listener is terminated exactly once per start/stop cycle,
//! whether the pod exits on its own or `stop` is called.

use crate::constants::{
    STATUS_POLL_ATTEMPTS, STATUS_POLL_INTERVAL, STATUS_WAIT_READY, VOLUME_DIR_MODE,
};
use crate::descriptor::paths::to_id;
use crate::error::{Error, Result};
use crate::pod::Pod;
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, warn};

// =============================================================================
// Lifecycle Listener
// =============================================================================

/// Observer of the pod lifecycle, e.g. a service registry binding.
///
/// `start` runs once the pod is running and has an IP; `terminate` is
/// invoked exactly once per start/stop cycle, from whichever of pod-exit or
/// [`PodLauncher::stop`] happens first.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn start(&self, pod_uuid: &str, pod_ip: &str) -> Result<()>;
    async fn terminate(&self) -> Result<()>;
}

/// Listener used when no service discovery is configured.
pub struct NilListener;

#[async_trait]
impl LifecycleListener for NilListener {
    async fn start(&self, _pod_uuid: &str, _pod_ip: &str) -> Result<()> {
        Ok(())
    }
    async fn terminate(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Runtime Status Wire Format
// =============================================================================

/// `rkt status --format=json` payload.
#[derive(Debug, Default, Deserialize)]
pub struct ContainerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub networks: Vec<ContainerNetwork>,
    #[serde(default)]
    pub app_names: Vec<String>,
    #[serde(default)]
    pub started_at: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContainerNetwork {
    #[serde(default, rename = "netName")]
    pub network_name: String,
    #[serde(default, rename = "netConf")]
    pub config_file: String,
    #[serde(default, rename = "pluginPath")]
    pub plugin_path: String,
    #[serde(default, rename = "ifName")]
    pub interface_name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub mask: String,
}

// =============================================================================
// Launcher
// =============================================================================

/// Launcher configuration.
pub struct LauncherConfig {
    pub pod: Pod,
    /// When set, the pod UUID is persisted here and the previous pod is
    /// removed on the next start.
    pub uuid_file: Option<PathBuf>,
    /// IP used to publish ports that do not name one themselves.
    pub default_publish_ip: String,
    pub listener: Arc<dyn LifecycleListener>,
}

#[derive(Default)]
struct Inner {
    pod_uuid: String,
    /// Process-group leader of the run process, once spawned.
    pid: Option<i32>,
    spawned: bool,
    done_rx: Option<watch::Receiver<bool>>,
}

/// Supervises one pod through its whole lifecycle.
pub struct PodLauncher {
    pod: Pod,
    uuid_file: Option<PathBuf>,
    default_publish_ip: String,
    listener: Arc<dyn LifecycleListener>,
    /// Armed at the end of a successful start; consumed (swapped to false)
    /// by whichever termination path runs first.
    listener_armed: Arc<AtomicBool>,
    run_error: Arc<std::sync::Mutex<Option<String>>>,
    state: Mutex<Inner>,
}

impl PodLauncher {
    pub fn new(cfg: LauncherConfig) -> Result<Self> {
        let uuid_file = match cfg.uuid_file {
            Some(f) => Some(std::path::absolute(&f).map_err(|e| {
                Error::runtime("uuid-file", format!("invalid pod UUID file: {e}"))
            })?),
            None => None,
        };
        Ok(Self {
            pod: cfg.pod,
            uuid_file,
            default_publish_ip: cfg.default_publish_ip,
            listener: cfg.listener,
            listener_armed: Arc::new(AtomicBool::new(false)),
            run_error: Arc::new(std::sync::Mutex::new(None)),
            state: Mutex::new(Inner::default()),
        })
    }

    /// Prepares and starts the pod, waits for it to report running with a
    /// network, and notifies the lifecycle listener. Every step unwinds the
    /// previous ones on failure.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.state.lock().await;
        if !inner.pod_uuid.is_empty() {
            return Err(Error::AlreadyRunning {
                uuid: inner.pod_uuid.clone(),
            });
        }
        self.run_error.lock().expect("run error lock").take();
        match self.start_steps(&mut inner).await {
            Ok(()) => {
                self.listener_armed.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                if let Err(te) = self.terminate_locked(&mut inner).await {
                    error!("{te}");
                }
                Err(e)
            }
        }
    }

    async fn start_steps(&self, inner: &mut Inner) -> Result<()> {
        let run_args = build_run_args(&self.pod);
        self.create_volume_directories()?;

        let hosts_file = write_hosts_file(&self.pod)?;
        let hosts_path = hosts_file.path().to_string_lossy().to_string();
        let hosts_volume = to_id(
            &hosts_file
                .path()
                .file_name()
                .expect("temp file has a name")
                .to_string_lossy(),
        );

        self.remove_last_pod().await;
        self.prepare(inner, &hosts_volume, &hosts_path).await?;

        let mut run_args = run_args;
        run_args.push(inner.pod_uuid.clone());
        debug!("starting pod: rkt {}", run_args.join(" "));
        let mut cmd = Command::new("rkt");
        cmd.args(&run_args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0);
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::runtime("run", format!("cannot start rkt: {e}")))?;
        inner.pid = child.id().map(|p| p as i32);
        inner.spawned = true;

        let (done_tx, done_rx) = watch::channel(false);
        inner.done_rx = Some(done_rx);
        let run_error = Arc::clone(&self.run_error);
        let armed = Arc::clone(&self.listener_armed);
        let listener = Arc::clone(&self.listener);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    run_error
                        .lock()
                        .expect("run error lock")
                        .replace(status.to_string());
                }
                Err(e) => {
                    run_error
                        .lock()
                        .expect("run error lock")
                        .replace(e.to_string());
                }
            }
            if armed.swap(false, Ordering::SeqCst) {
                if let Err(e) = listener.terminate().await {
                    error!("{e}");
                }
            }
            let _ = done_tx.send(true);
        });

        let info = match self.container_info(&inner.pod_uuid).await {
            Ok(info) => info,
            Err(e) => {
                // A dead run process explains the status failure better.
                let run_err = self.run_error.lock().expect("run error lock").clone();
                return Err(match run_err {
                    Some(r) => Error::runtime("rkt run", r),
                    None => Error::runtime("start status", e),
                });
            }
        };
        let pod_ip = info
            .networks
            .first()
            .map(|n| n.ip.clone())
            .unwrap_or_default();
        if let Err(e) = self.listener.start(&inner.pod_uuid, &pod_ip).await {
            return Err(Error::runtime("start listener", e));
        }
        // The hosts file stays alive until the pod bind-mounted it, which
        // the status poll above has confirmed.
        drop(hosts_file);
        Ok(())
    }

    /// Stops the pod: listener teardown, `rkt stop`, forced kill after the
    /// grace period, and collection of the run process result.
    pub async fn stop(&self) -> Result<()> {
        debug!("stopping pod");
        let mut inner = self.state.lock().await;
        if self.listener_armed.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.listener.terminate().await {
                error!("{e}");
            }
        }
        let term_result = self.terminate_locked(&mut inner).await;
        inner.pod_uuid.clear();
        inner.pid = None;
        inner.spawned = false;
        let done_rx = inner.done_rx.take();
        drop(inner);

        if let Some(rx) = done_rx {
            wait_done(rx).await;
        }
        let run_err = self.run_error.lock().expect("run error lock").take();
        match (term_result, run_err) {
            (Ok(()), None) => Ok(()),
            (Ok(()), Some(r)) => Err(Error::runtime("rkt run", r)),
            (Err(e), None) => Err(e),
            (Err(e), Some(r)) => Err(Error::runtime("stop", format!("{e}. rkt run: {r}"))),
        }
    }

    /// Blocks until the run process exited and returns its captured error.
    pub async fn wait(&self) -> Result<()> {
        let done_rx = self.state.lock().await.done_rx.clone();
        if let Some(rx) = done_rx {
            wait_done(rx).await;
        }
        match self.run_error.lock().expect("run error lock").clone() {
            Some(r) => Err(Error::runtime("rkt run", r)),
            None => Ok(()),
        }
    }

    /// Flags exited pods for garbage collection; failures are only logged.
    pub async fn mark_garbage_containers_quiet(&self) {
        debug!("marking garbage collectable pods");
        match Command::new("rkt").args(["gc", "--mark-only"]).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => error!("rkt gc: {status}"),
            Err(e) => error!("rkt gc: {e}"),
        }
    }

    // =========================================================================
    // Pipeline Steps
    // =========================================================================

    fn create_volume_directories(&self) -> Result<()> {
        debug!("creating volume directories");
        for volume in self.pod.volumes.values() {
            let path = PathBuf::from(&volume.source);
            match std::fs::metadata(&path) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    create_dir_with_mode(&path).map_err(|e| {
                        Error::runtime("volumes", format!("cannot create volume directory: {e}"))
                    })?;
                }
                Err(e) => {
                    return Err(Error::runtime("volumes", format!("cannot access volume: {e}")));
                }
            }
        }
        Ok(())
    }

    /// Removes the previously started pod recorded in the UUID file.
    async fn remove_last_pod(&self) {
        let Some(uuid_file) = &self.uuid_file else { return };
        if !uuid_file.exists() {
            return;
        }
        debug!("removing last pod");
        let result = Command::new("rkt")
            .arg("rm")
            .arg(format!("--uuid-file={}", uuid_file.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("could not remove last pod: {status}"),
            Err(e) => warn!("could not remove last pod: {e}"),
        }
    }

    async fn prepare(&self, inner: &mut Inner, hosts_volume: &str, hosts_path: &str) -> Result<()> {
        let args = build_prepare_args(&self.pod, hosts_volume, hosts_path, &self.default_publish_ip)?;
        debug!("preparing pod: rkt {}", args.join(" "));
        let out = Command::new("rkt")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .output()
            .await
            .map_err(|e| Error::runtime("prepare", format!("cannot run rkt: {e}")))?;
        if !out.status.success() {
            return Err(Error::runtime(
                "prepare",
                format!("failed to prepare pod: {}", out.status),
            ));
        }
        inner.pod_uuid = String::from_utf8_lossy(&out.stdout)
            .trim_end_matches('\n')
            .to_string();

        if let Some(uuid_file) = &self.uuid_file {
            if let Err(e) = std::fs::write(uuid_file, &inner.pod_uuid) {
                let _ = Command::new("rkt")
                    .arg("rm")
                    .arg(&inner.pod_uuid)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                return Err(Error::runtime(
                    "prepare",
                    format!("cannot write pod UUID file: {e}"),
                ));
            }
        }
        Ok(())
    }

    /// Polls the runtime until the pod reports running with a network.
    async fn container_info(&self, pod_uuid: &str) -> std::result::Result<ContainerInfo, String> {
        debug!("awaiting pod start");
        let mut info = ContainerInfo::default();
        // The first status calls may list no networks yet.
        for _ in 0..STATUS_POLL_ATTEMPTS {
            let out = Command::new("rkt")
                .args(["status", "--format=json"])
                .arg(format!("--wait-ready={STATUS_WAIT_READY}"))
                .arg(pod_uuid)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| format!("failed to request pod status: {e}"))?;
            if !out.status.success() {
                return Err(format!(
                    "failed to request pod status: {}. {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ));
            }
            info = serde_json::from_slice(&out.stdout)
                .map_err(|e| format!("cannot unmarshal pod status: {e}"))?;
            if info.state == "running" && !info.networks.is_empty() {
                return Ok(info);
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
        if info.state == "running" {
            Err("pod has no network".to_string())
        } else {
            Err("pod did not start".to_string())
        }
    }

    /// Stops the run process: `rkt stop`, then a grace period, then a
    /// process-group kill. An already-gone process group counts as success.
    async fn terminate_locked(&self, inner: &mut Inner) -> Result<()> {
        if !inner.spawned {
            return Ok(());
        }
        debug!("terminating rkt process");
        let stop_status = Command::new("rkt")
            .arg("stop")
            .arg(&inner.pod_uuid)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        let stop_ok = matches!(&stop_status, Ok(status) if status.success());
        if !stop_ok {
            error!("killing pod since termination failed");
            return kill_group(inner.pid);
        }
        if let Some(rx) = inner.done_rx.clone() {
            let graceful = tokio::time::timeout(self.pod.stop_grace_period, wait_done(rx)).await;
            if graceful.is_err() {
                error!("killing pod since stop timeout exceeded");
                kill_group(inner.pid)?;
                if let Some(rx) = inner.done_rx.clone() {
                    wait_done(rx).await;
                }
            }
        }
        Ok(())
    }
}

async fn wait_done(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn kill_group(pid: Option<i32>) -> Result<()> {
    let Some(pid) = pid else { return Ok(()) };
    let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(Error::runtime("stop", format!("failed to kill rkt process: {err}")));
        }
    }
    Ok(())
}

fn create_dir_with_mode(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(VOLUME_DIR_MODE)
        .create(path)
}

// =============================================================================
// Argument Vectors
// =============================================================================

/// `rkt run-prepared` arguments, without the trailing pod UUID.
fn build_run_args(pod: &Pod) -> Vec<String> {
    let mut args = vec![
        "run-prepared".to_string(),
        format!("--hostname={}", pod.hostname),
    ];
    for net in &pod.net {
        args.push(format!("--net={net}"));
    }
    for dns in &pod.dns {
        args.push(format!("--dns={dns}"));
    }
    for search in &pod.dns_search {
        args.push(format!("--dns-search={search}"));
    }
    args
}

/// `rkt prepare` arguments covering volumes, ports and per-app sections.
fn build_prepare_args(
    pod: &Pod,
    hosts_volume: &str,
    hosts_path: &str,
    default_publish_ip: &str,
) -> Result<Vec<String>> {
    let mut args = vec!["prepare".to_string(), "--quiet=true".to_string()];
    if pod.contains_docker_image() {
        args.push("--insecure-options=image".to_string());
    }
    for (k, v) in &pod.environment {
        args.push(format!("--set-env={k}={v}"));
    }
    for (name, volume) in &pod.volumes {
        args.push(format!(
            "--volume={name},source={},kind={},readOnly={}",
            volume.source, volume.kind, volume.readonly
        ));
    }
    args.push(format!(
        "--volume={hosts_volume},kind=host,source={hosts_path},readOnly=true"
    ));
    for service in pod.services.values() {
        for port in &service.ports {
            let mut arg = format!("--port={}-{}", port.target, port.protocol);
            let ip = if port.ip.is_empty() { default_publish_ip } else { &port.ip };
            if !ip.is_empty() {
                arg.push_str(&format!(":{ip}"));
            }
            if port.published > 0 {
                arg.push_str(&format!(":{}", port.published));
            }
            args.push(arg);
        }
    }
    for (name, service) in &pod.services {
        args.push(service.image.clone());
        args.push(format!("--name={name}"));
        for (k, v) in &service.environment {
            args.push(format!("--environment={k}={v}"));
        }
        for (target, volume) in &service.mounts {
            args.push(format!("--mount=volume={volume},target={target}"));
        }
        args.push(format!("--mount=volume={hosts_volume},target=/etc/hosts"));
        let Some(exec) = service.entrypoint.first() else {
            return Err(Error::runtime(
                "prepare",
                format!("missing entrypoint in service {name:?}"),
            ));
        };
        args.push(format!("--exec={exec}"));
        args.push("--".to_string());
        args.extend(service.entrypoint[1..].iter().cloned());
        args.extend(service.command.iter().cloned());
        args.push("---".to_string());
    }
    Ok(args)
}

// =============================================================================
// Hosts File
// =============================================================================

/// Writes the generated hosts file to a temp location; it is bind-mounted
/// into every app at `/etc/hosts` and removed once the pod is up.
fn write_hosts_file(pod: &Pod) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("pod-hosts-")
        .tempfile()
        .map_err(|e| Error::runtime("hosts", format!("cannot create temporary hosts file: {e}")))?;
    file.write_all(hosts_file_content(pod).as_bytes())
        .map_err(|e| Error::runtime("hosts", format!("cannot write temporary hosts file: {e}")))?;
    file.flush()
        .map_err(|e| Error::runtime("hosts", format!("cannot write temporary hosts file: {e}")))?;
    Ok(file)
}

fn hosts_file_content(pod: &Pod) -> String {
    let fqdn = pod.fqdn();
    let mut names = fqdn.clone();
    if names != pod.hostname {
        names.push(' ');
        names.push_str(&pod.hostname);
    }
    if !pod.disable_hosts_injection {
        for name in pod.services.keys() {
            if *name != pod.hostname {
                names.push(' ');
                names.push_str(name);
            }
        }
    }
    let mut hosts = String::new();
    hosts.push_str("# Generated by rktpod\n");
    hosts.push_str(&format!(
        "127.0.0.1 {names} localhost localhost.domain localhost4 localhost4.localdomain4\n\n"
    ));
    hosts.push_str("::1 ip6-localhost ip6-loopback localhost6 localhost6.localdomain6\n");
    hosts.push_str("fe00::0 ip6-localnet\nff00::0 ip6-mcastprefix\nff02::1 ip6-allnodes\n");
    hosts.push_str("ff02::2 ip6-allrouters\nff02::3 ip6-allhosts\n");
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::{PortBinding, Service, Volume};
    use indexmap::IndexMap;
    use std::time::Duration;

    fn test_pod() -> Pod {
        let mut services = IndexMap::new();
        services.insert(
            "web".to_string(),
            Service {
                image: "docker://nginx:1.25".to_string(),
                entrypoint: vec!["/usr/sbin/nginx".to_string()],
                command: vec!["-g".to_string(), "daemon off;".to_string()],
                environment: [("MODE".to_string(), "prod".to_string())].into_iter().collect(),
                ports: vec![PortBinding {
                    target: 80,
                    published: 8080,
                    ip: String::new(),
                    protocol: "tcp".to_string(),
                }],
                mounts: [("/var/www".to_string(), "wwwdata".to_string())]
                    .into_iter()
                    .collect(),
                health_check: None,
            },
        );
        let mut volumes = IndexMap::new();
        volumes.insert(
            "wwwdata".to_string(),
            Volume {
                source: "/pods/app/www".to_string(),
                kind: "host".to_string(),
                readonly: false,
            },
        );
        Pod {
            file: "/pods/app/pod.json".into(),
            name: "app".to_string(),
            hostname: "app".to_string(),
            domainname: "example.org".to_string(),
            net: vec!["default".to_string()],
            dns: vec!["10.0.0.2".to_string()],
            dns_search: vec!["example.org".to_string()],
            disable_hosts_injection: false,
            environment: [("GLOBAL".to_string(), "1".to_string())].into_iter().collect(),
            services,
            volumes,
            shared_keys: IndexMap::new(),
            shared_keys_override_allowed: false,
            stop_grace_period: Duration::from_secs(10),
        }
    }

    #[test]
    fn run_args_cover_network_options() {
        let args = build_run_args(&test_pod());
        assert_eq!(
            args,
            vec![
                "run-prepared",
                "--hostname=app",
                "--net=default",
                "--dns=10.0.0.2",
                "--dns-search=example.org",
            ]
        );
    }

    #[test]
    fn prepare_args_cover_volumes_ports_and_app_section() {
        let args =
            build_prepare_args(&test_pod(), "pod-hosts-x", "/tmp/pod-hosts-x", "").unwrap();
        assert_eq!(args[0], "prepare");
        assert_eq!(args[1], "--quiet=true");
        assert!(args.contains(&"--insecure-options=image".to_string()));
        assert!(args.contains(&"--set-env=GLOBAL=1".to_string()));
        assert!(
            args.contains(
                &"--volume=wwwdata,source=/pods/app/www,kind=host,readOnly=false".to_string()
            )
        );
        assert!(args.contains(&"--port=80-tcp:8080".to_string()));
        assert!(args.contains(&"--mount=volume=wwwdata,target=/var/www".to_string()));
        assert!(args.contains(&"--mount=volume=pod-hosts-x,target=/etc/hosts".to_string()));
        let exec_pos = args.iter().position(|a| a == "--exec=/usr/sbin/nginx").unwrap();
        assert_eq!(args[exec_pos + 1], "--");
        assert_eq!(args[exec_pos + 2], "-g");
        assert_eq!(args[exec_pos + 3], "daemon off;");
        assert_eq!(args[exec_pos + 4], "---");
    }

    #[test]
    fn prepare_args_use_default_publish_ip() {
        let args = build_prepare_args(&test_pod(), "h", "/tmp/h", "192.168.0.10").unwrap();
        assert!(args.contains(&"--port=80-tcp:192.168.0.10:8080".to_string()));
    }

    #[test]
    fn hosts_file_lists_fqdn_and_services() {
        let pod = test_pod();
        let hosts = hosts_file_content(&pod);
        assert!(hosts.contains("127.0.0.1 app.example.org app web localhost"));
        assert!(hosts.contains("::1 ip6-localhost"));

        let mut quiet = pod.clone();
        quiet.disable_hosts_injection = true;
        quiet.services.insert("db".to_string(), Service::default());
        let hosts = hosts_file_content(&quiet);
        assert!(!hosts.contains(" db "));
    }

    #[test]
    fn missing_entrypoint_is_rejected() {
        let mut pod = test_pod();
        pod.services["web"].entrypoint.clear();
        assert!(build_prepare_args(&pod, "h", "/tmp/h", "").is_err());
    }
}
