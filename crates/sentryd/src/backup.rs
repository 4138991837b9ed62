//! Backup collaborators.
//!
//! The engine decides *that* a backup should run, never performs it.
//! `request_backup` returning Ok is the acknowledgment that the transfer
//! started; completion comes back asynchronously as a `BackupOutcome` on
//! the channel handed to the executor at construction.

use sentry_common::SentryError;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Completion report from the backup collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOutcome {
    pub device: String,
    pub success: bool,
}

pub trait BackupExecutor: Send + Sync {
    /// Dispatch a backup for the device. Ok means the collaborator
    /// accepted and started the transfer.
    fn request_backup(&self, device: &str) -> Result<(), SentryError>;
}

/// Shells out to a configured command template (`{device}` substituted)
/// in a detached task and reports the exit status. With no command
/// configured, requests are acknowledged and immediately reported
/// successful, which keeps the decision machine exercisable on a box with
/// no backup tooling yet.
pub struct CommandBackupExecutor {
    command: Option<String>,
    outcomes: mpsc::UnboundedSender<BackupOutcome>,
}

impl CommandBackupExecutor {
    pub fn new(
        command: Option<String>,
        outcomes: mpsc::UnboundedSender<BackupOutcome>,
    ) -> Self {
        Self { command, outcomes }
    }
}

impl BackupExecutor for CommandBackupExecutor {
    fn request_backup(&self, device: &str) -> Result<(), SentryError> {
        if self.outcomes.is_closed() {
            return Err(SentryError::BackupDispatch {
                device: device.to_string(),
                reason: "backup outcome channel closed".to_string(),
            });
        }

        let Some(template) = &self.command else {
            info!(device, "no backup command configured, acknowledging as no-op");
            let _ = self.outcomes.send(BackupOutcome {
                device: device.to_string(),
                success: true,
            });
            return Ok(());
        };

        let command = template.replace("{device}", device);
        let device = device.to_string();
        let outcomes = self.outcomes.clone();

        info!(%device, %command, "dispatching backup");
        tokio::spawn(async move {
            let status = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .status()
                .await;

            let success = match status {
                Ok(status) => status.success(),
                Err(e) => {
                    error!(%device, "backup command failed to spawn: {}", e);
                    false
                }
            };
            let _ = outcomes.send(BackupOutcome { device, success });
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_command_acknowledges_and_completes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = CommandBackupExecutor::new(None, tx);

        executor.request_backup("/dev/sda").unwrap();
        let outcome = rx.recv().await.unwrap();
        assert_eq!(
            outcome,
            BackupOutcome {
                device: "/dev/sda".to_string(),
                success: true
            }
        );
    }

    #[tokio::test]
    async fn test_command_reports_exit_status() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = CommandBackupExecutor::new(Some("true # {device}".to_string()), tx);

        executor.request_backup("/dev/sda").unwrap();
        let outcome = rx.recv().await.unwrap();
        assert!(outcome.success);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = CommandBackupExecutor::new(Some("false".to_string()), tx);
        executor.request_backup("/dev/sdb").unwrap();
        let outcome = rx.recv().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.device, "/dev/sdb");
    }

    #[tokio::test]
    async fn test_closed_channel_is_a_dispatch_failure() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let executor = CommandBackupExecutor::new(None, tx);
        let err = executor.request_backup("/dev/sda").unwrap_err();
        assert!(matches!(err, SentryError::BackupDispatch { .. }));
    }
}
