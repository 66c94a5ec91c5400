//! Consul-backed pod lifecycle listener.
//!
//! Registers the pod as a service with a TTL check when it starts, publishes
//! its shared KV entries, bridges aggregated health reports into TTL check
//! updates, and deregisters on termination.

use super::client::{ConsulClient, ConsulService, Health, HeartBeat};
use crate::constants::CONSUL_AVAILABILITY_RETRIES;
use crate::error::{Error, Result};
use crate::health::{
    CommandIndicator, HealthCheckTask, HealthChecks, HealthReport, HealthReporter,
};
use crate::launcher::LifecycleListener;
use crate::pod::Pod;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Builds per-pod lifecycle listeners against one Consul agent.
///
/// Construction verifies the agent is reachable so a dead registry fails the
/// launch before any container starts.
pub struct ConsulLifecycleFactory {
    client: Arc<ConsulClient>,
    check_ttl: Duration,
}

impl ConsulLifecycleFactory {
    pub async fn new(address: impl Into<String>, check_ttl: Duration) -> Result<Self> {
        let client = ConsulClient::new(address)?;
        if !client.check_availability(CONSUL_AVAILABILITY_RETRIES).await {
            return Err(Error::Registry("unavailable".to_string()));
        }
        Ok(Self {
            client: Arc::new(client),
            check_ttl,
        })
    }

    /// Creates the listener for one pod. Health checks run in this process
    /// so probe commands can be executed inside the containers.
    pub fn listener(&self, pod: &Pod) -> ConsulLifecycle {
        ConsulLifecycle {
            client: Arc::clone(&self.client),
            check_ttl: self.check_ttl,
            min_report_interval: self.check_ttl / 2,
            pod: pod.clone(),
            state: Mutex::new(None),
        }
    }
}

struct Registered {
    service_id: String,
    checks: HealthChecks,
}

/// Lifecycle listener bound to one pod.
pub struct ConsulLifecycle {
    client: Arc<ConsulClient>,
    check_ttl: Duration,
    min_report_interval: Duration,
    pod: Pod,
    state: Mutex<Option<Registered>>,
}

impl ConsulLifecycle {
    fn service(&self, service_id: &str, pod_ip: &str) -> ConsulService {
        let notes = format!(
            "Aggregated checks (Interval: {}, TTL: {})",
            humantime::format_duration(self.min_report_interval),
            humantime::format_duration(self.check_ttl),
        );
        ConsulService {
            id: service_id.to_string(),
            name: self.pod.name.clone(),
            address: pod_ip.to_string(),
            tags: self.pod.services.keys().cloned().collect(),
            enable_tag_override: false,
            check: HeartBeat {
                notes,
                ttl: humantime::format_duration(self.check_ttl).to_string(),
            },
        }
    }

    /// Publishes the pod's shared keys, refusing to overwrite foreign values
    /// unless the pod allows it.
    async fn publish_shared_keys(&self) -> Result<()> {
        for (key, value) in &self.pod.shared_keys {
            let existing = self.client.get_key(key).await?;
            if existing == *value {
                continue;
            }
            if !existing.is_empty() && !self.pod.shared_keys_override_allowed {
                return Err(Error::SharedKeyConflict { key: key.clone() });
            }
            debug!("setting shared key {key:?}");
            self.client.set_key(key, value).await?;
        }
        Ok(())
    }

    fn health_checks(&self, pod_uuid: &str, service_id: &str) -> HealthChecks {
        let mut tasks = Vec::new();
        for (name, service) in &self.pod.services {
            let Some(hc) = &service.health_check else { continue };
            if hc.disable || hc.command.is_empty() {
                continue;
            }
            let mut argv = vec![
                "rkt".to_string(),
                "enter".to_string(),
                format!("--app={name}"),
                pod_uuid.to_string(),
            ];
            argv.extend(hc.command.iter().cloned());
            tasks.push(HealthCheckTask::new(
                name.clone(),
                hc.interval,
                Arc::new(CommandIndicator::new(argv, hc.timeout)),
            ));
        }
        let reporter = Arc::new(ConsulReporter {
            client: Arc::clone(&self.client),
            check_id: format!("service:{service_id}"),
        });
        HealthChecks::new(reporter, self.min_report_interval, tasks)
    }
}

#[async_trait]
impl LifecycleListener for ConsulLifecycle {
    async fn start(&self, pod_uuid: &str, pod_ip: &str) -> Result<()> {
        let service_id = format!("rkt-{pod_uuid}");
        let service = self.service(&service_id, pod_ip);
        debug!(
            "registering consul service {:?} with address {pod_ip}",
            self.pod.name
        );
        self.client.register_service(&service).await?;

        if let Err(e) = self.publish_shared_keys().await {
            if let Err(de) = self.client.deregister_service(&service_id).await {
                error!("cannot deregister service after failed key publication: {de}");
            }
            return Err(e);
        }

        let mut checks = self.health_checks(pod_uuid, &service_id);
        checks.start().await;
        *self.state.lock().await = Some(Registered { service_id, checks });
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        let Some(mut registered) = self.state.lock().await.take() else {
            return Ok(());
        };
        // Emits one final critical heartbeat before the service goes away.
        registered.checks.stop().await;
        debug!("deregistering consul service {:?}", self.pod.name);
        self.client
            .deregister_service(&registered.service_id)
            .await
            .map_err(|_| Error::Registry(format!("failed to deregister service {:?}", self.pod.name)))
    }
}

struct ConsulReporter {
    client: Arc<ConsulClient>,
    check_id: String,
}

#[async_trait]
impl HealthReporter for ConsulReporter {
    async fn report(&self, report: &HealthReport) -> Result<()> {
        debug!("reporting status {}", report.status);
        self.client
            .report_health(
                &self.check_id,
                &Health {
                    status: report.status.as_str().to_string(),
                    output: report.output.clone(),
                },
            )
            .await
    }
}
