//! Host platform capabilities used by fix execution:
//! privilege probe, restore checkpoints, and the system restore handoff.

use crate::shell::{ShellRunner, ShellError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlatformError {
    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("{0}")]
    Failed(String),
}

impl From<ShellError> for PlatformError {
    fn from(e: ShellError) -> Self {
        PlatformError::Failed(e.to_string())
    }
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// True when the process may perform administrative changes
    async fn is_elevated(&self) -> bool;

    /// Create a restore point labelled `description`
    async fn create_checkpoint(&self, description: &str) -> Result<(), PlatformError>;

    /// Hand control to the platform's system restore tool
    async fn launch_system_restore(&self) -> Result<(), PlatformError>;

    /// How to relaunch with elevated rights
    fn elevation_hint(&self) -> String;
}

/// The machine we are running on
pub struct HostPlatform {
    shell: Arc<dyn ShellRunner>,
}

impl HostPlatform {
    pub fn new(shell: Arc<dyn ShellRunner>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl Platform for HostPlatform {
    #[cfg(unix)]
    async fn is_elevated(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    #[cfg(not(unix))]
    async fn is_elevated(&self) -> bool {
        // `net session` only succeeds from an elevated prompt
        match self.shell.run("net session", PROBE_TIMEOUT).await {
            Ok(output) => output.success(),
            Err(e) => {
                tracing::debug!("Elevation probe failed: {}", e);
                false
            }
        }
    }

    async fn create_checkpoint(&self, description: &str) -> Result<(), PlatformError> {
        if !cfg!(windows) {
            return Err(PlatformError::Unsupported("restore checkpoints"));
        }
        let command = format!(
            "Checkpoint-Computer -Description '{}' -RestorePointType MODIFY_SETTINGS",
            description.replace('\'', "''")
        );
        let output = self.shell.run(&command, CHECKPOINT_TIMEOUT).await?;
        if output.success() {
            Ok(())
        } else {
            Err(PlatformError::Failed(output.combined()))
        }
    }

    async fn launch_system_restore(&self) -> Result<(), PlatformError> {
        if !cfg!(windows) {
            return Err(PlatformError::Unsupported(
                "system restore (use your distribution's snapshot tooling)",
            ));
        }
        let output = self
            .shell
            .run("Start-Process rstrui.exe", PROBE_TIMEOUT)
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(PlatformError::Failed(output.combined()))
        }
    }

    fn elevation_hint(&self) -> String {
        if cfg!(windows) {
            "Administrator rights are required. Right-click your terminal, choose \
             \"Run as administrator\", then run the command again."
                .to_string()
        } else {
            "Root privileges are required. Run the command again with sudo.".to_string()
        }
    }
}

/// Scriptable platform for tests
#[derive(Default)]
pub struct FakePlatform {
    elevated: bool,
    checkpoint_error: Option<PlatformError>,
    restore_error: Option<PlatformError>,
    checkpoints: Mutex<Vec<String>>,
    restores: AtomicUsize,
}

impl FakePlatform {
    /// Elevated, with working checkpoints and restore
    pub fn new() -> Self {
        Self {
            elevated: true,
            ..Default::default()
        }
    }

    pub fn unelevated(mut self) -> Self {
        self.elevated = false;
        self
    }

    pub fn failing_checkpoints(mut self) -> Self {
        self.checkpoint_error = Some(PlatformError::Failed("restore points are disabled".to_string()));
        self
    }

    pub fn failing_restore(mut self, error: PlatformError) -> Self {
        self.restore_error = Some(error);
        self
    }

    pub fn checkpoints(&self) -> Vec<String> {
        self.checkpoints.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn restore_count(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn is_elevated(&self) -> bool {
        self.elevated
    }

    async fn create_checkpoint(&self, description: &str) -> Result<(), PlatformError> {
        if let Ok(mut checkpoints) = self.checkpoints.lock() {
            checkpoints.push(description.to_string());
        }
        match &self.checkpoint_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn launch_system_restore(&self) -> Result<(), PlatformError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        match &self.restore_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn elevation_hint(&self) -> String {
        "Run again as administrator.".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::FakeShell;

    #[tokio::test]
    async fn test_fake_platform_records_calls() {
        let platform = FakePlatform::new().failing_checkpoints();
        assert!(platform.is_elevated().await);
        assert!(platform.create_checkpoint("before fix").await.is_err());
        assert_eq!(platform.checkpoints(), vec!["before fix".to_string()]);
        assert!(platform.launch_system_restore().await.is_ok());
        assert_eq!(platform.restore_count(), 1);
        assert!(!FakePlatform::new().unelevated().is_elevated().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_host_checkpoint_unsupported_on_unix() {
        let platform = HostPlatform::new(Arc::new(FakeShell::new()));
        assert!(matches!(
            platform.create_checkpoint("x").await,
            Err(PlatformError::Unsupported(_))
        ));
        assert!(platform.elevation_hint().contains("sudo"));
    }
}
