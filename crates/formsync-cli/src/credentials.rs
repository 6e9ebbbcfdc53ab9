use async_trait::async_trait;
use chrono::{DateTime, Utc};
use formsync_core::contracts::{CredentialError, CredentialProvider, SessionToken};
use std::sync::Mutex;
use tracing::debug;

/// Fixed token for local backends. `refresh` only restamps the issue time.
pub struct StaticCredentials {
    value: String,
    issued_at: Mutex<DateTime<Utc>>,
}

impl StaticCredentials {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            issued_at: Mutex::new(Utc::now()),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn token(&self) -> Result<SessionToken, CredentialError> {
        let issued_at = *self
            .issued_at
            .lock()
            .map_err(|_| CredentialError::Unavailable("token state poisoned".to_string()))?;
        Ok(SessionToken {
            value: self.value.clone(),
            issued_at,
        })
    }

    async fn refresh(&self) -> Result<(), CredentialError> {
        let mut issued_at = self
            .issued_at
            .lock()
            .map_err(|_| CredentialError::Refresh("token state poisoned".to_string()))?;
        *issued_at = Utc::now();
        debug!(event = "credentials_refreshed");
        Ok(())
    }
}
