//! Push-Benachrichtigung für nicht erreichbare Angerufene
//!
//! Wird ausgelöst, sobald der Relay die Zustellung von `initiate` bestätigt
//! (`delivered`). Fehler sind rein diagnostisch und beenden keinen Anruf.

use crate::signaling::SessionId;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("Push rejected: {0}")]
    Rejected(String),

    #[error("Push service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PushNotifier: Send + Sync + 'static {
    async fn notify(&self, target: &str, session_id: &SessionId) -> Result<(), PushError>;
}

/// Standard: kein Push-Dienst konfiguriert
#[derive(Debug, Clone, Default)]
pub struct NoPush;

#[async_trait]
impl PushNotifier for NoPush {
    async fn notify(&self, target: &str, session_id: &SessionId) -> Result<(), PushError> {
        tracing::debug!("No push service, skipping notification to {} ({})", target, session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_push_succeeds() {
        let result = NoPush.notify("bob", &SessionId::from("s-1")).await;
        assert_eq!(result, Ok(()));
    }
}
