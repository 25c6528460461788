//! Stop/start/health contract for the services that depend on the database.

use crate::config::ServicesConfig;
use crate::utils::errors::{OrchestratorError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    async fn stop(&self, service: &str) -> Result<()>;

    async fn start(&self, service: &str) -> Result<()>;

    /// Whether the service currently reports healthy.
    async fn health_check(&self, service: &str) -> Result<bool>;
}

pub fn from_config(config: &ServicesConfig) -> Arc<dyn ServiceSupervisor> {
    match config.supervisor.as_str() {
        "systemd" => Arc::new(SystemdSupervisor),
        _ => Arc::new(NoopSupervisor),
    }
}

/// Drives units through `systemctl`.
pub struct SystemdSupervisor;

impl SystemdSupervisor {
    async fn systemctl(args: &[&str]) -> Result<std::process::ExitStatus> {
        Command::new("systemctl")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| OrchestratorError::Service(format!("cannot run systemctl: {}", e)))
    }
}

#[async_trait]
impl ServiceSupervisor for SystemdSupervisor {
    async fn stop(&self, service: &str) -> Result<()> {
        let status = Self::systemctl(&["stop", service]).await?;
        if !status.success() {
            return Err(OrchestratorError::Service(format!("systemctl stop {} exited with {}", service, status)));
        }
        Ok(())
    }

    async fn start(&self, service: &str) -> Result<()> {
        let status = Self::systemctl(&["start", service]).await?;
        if !status.success() {
            return Err(OrchestratorError::Service(format!("systemctl start {} exited with {}", service, status)));
        }
        Ok(())
    }

    async fn health_check(&self, service: &str) -> Result<bool> {
        Ok(Self::systemctl(&["is-active", "--quiet", service]).await?.success())
    }
}

/// For hosts where nothing needs quiescing.
pub struct NoopSupervisor;

#[async_trait]
impl ServiceSupervisor for NoopSupervisor {
    async fn stop(&self, _service: &str) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _service: &str) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self, _service: &str) -> Result<bool> {
        Ok(true)
    }
}

/// The dependent services of the database, stopped and started together.
#[derive(Clone)]
pub struct ServiceGroup {
    supervisor: Arc<dyn ServiceSupervisor>,
    services: Vec<String>,
    health_timeout: Duration,
    poll_interval: Duration,
}

impl ServiceGroup {
    pub fn new(supervisor: Arc<dyn ServiceSupervisor>, services: Vec<String>, health_timeout: Duration) -> Self {
        Self {
            supervisor,
            services,
            health_timeout,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Build the group from config. Without a real supervisor there is
    /// nothing to stop, so configured dependents are ignored.
    pub fn from_config(config: &ServicesConfig) -> Self {
        let services = if config.supervisor == "none" {
            if !config.dependents.is_empty() {
                warn!(
                    "services.dependents is set but services.supervisor is none; dependents will not be quiesced"
                );
            }
            Vec::new()
        } else {
            config.dependents.clone()
        };
        Self::new(
            from_config(config),
            services,
            Duration::from_secs(config.health_timeout_secs),
        )
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    /// Stop every service and wait until none reports healthy.
    pub async fn stop_all(&self) -> Result<()> {
        for service in &self.services {
            info!(service = %service, "Stopping dependent service");
            self.supervisor.stop(service).await?;
        }
        for service in &self.services {
            self.wait_for(service, false).await?;
        }
        Ok(())
    }

    /// Start every service (in reverse stop order) and wait until each is healthy.
    pub async fn start_all(&self) -> Result<()> {
        let mut first_error = None;
        for service in self.services.iter().rev() {
            info!(service = %service, "Starting dependent service");
            if let Err(e) = self.supervisor.start(service).await {
                warn!(service = %service, "Start failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        for service in self.services.iter().rev() {
            self.wait_for(service, true).await?;
        }
        Ok(())
    }

    async fn wait_for(&self, service: &str, healthy: bool) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.health_timeout;
        loop {
            if self.supervisor.health_check(service).await? == healthy {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::Service(format!(
                    "{} did not become {} within {:?}",
                    service,
                    if healthy { "healthy" } else { "unhealthy" },
                    self.health_timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
