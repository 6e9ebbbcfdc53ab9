use formsync_core::contracts::{CredentialProvider, TargetError, TargetSessionFactory, TargetStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// A worker's own target session. Reopened in place after connection-class failures.
pub struct WorkerSession {
    factory: Arc<dyn TargetSessionFactory>,
    current: Mutex<Arc<dyn TargetStore>>,
}

impl WorkerSession {
    pub fn open(factory: Arc<dyn TargetSessionFactory>) -> Result<Self, TargetError> {
        let store = factory.open_session()?;
        Ok(Self {
            factory,
            current: Mutex::new(store),
        })
    }

    pub fn store(&self) -> Arc<dyn TargetStore> {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reopen(&self) -> Result<(), TargetError> {
        let fresh = self.factory.open_session()?;
        match self.current.lock() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        Ok(())
    }
}

/// Keeps credentials fresh across a long run: proactively once the interval has elapsed, and on
/// demand after entity-level failures.
pub struct SessionRefresher {
    credentials: Arc<dyn CredentialProvider>,
    interval: Duration,
    last_refresh: Mutex<Instant>,
}

impl SessionRefresher {
    pub fn new(credentials: Arc<dyn CredentialProvider>, interval: Duration) -> Self {
        Self {
            credentials,
            interval,
            last_refresh: Mutex::new(Instant::now()),
        }
    }

    fn last(&self) -> Instant {
        match self.last_refresh.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn mark_refreshed(&self) {
        let now = Instant::now();
        match self.last_refresh.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn is_due(&self) -> bool {
        self.last().elapsed() >= self.interval
    }

    pub async fn refresh_if_due(&self) -> bool {
        if !self.is_due() {
            return false;
        }
        self.force_refresh().await
    }

    pub async fn force_refresh(&self) -> bool {
        match self.credentials.refresh().await {
            Ok(()) => {
                self.mark_refreshed();
                info!(event = "credentials_refreshed");
                true
            }
            Err(err) => {
                warn!(event = "credentials_refresh_failed", error = %err);
                false
            }
        }
    }
}
