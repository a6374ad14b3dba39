use crate::errors::Result;
use crate::metrics::{ALERTS_TOTAL, NOTIFY_FAILURES_TOTAL};
use crate::model::{Alert, AlertKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Alerts kept by the local monitor.
pub const LOCAL_ALERT_CAP: usize = 50;
/// Alerts kept by the ingestion service.
pub const SERVER_ALERT_CAP: usize = 100;

/// Insertion-ordered alert history that drops the oldest entries once full.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertLog {
    cap: usize,
    entries: VecDeque<Alert>,
}

impl AlertLog {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: VecDeque::with_capacity(cap),
        }
    }

    pub fn from_alerts(cap: usize, alerts: impl IntoIterator<Item = Alert>) -> Self {
        let mut log = Self::new(cap);
        log.extend(alerts);
        log
    }

    pub fn extend(&mut self, alerts: impl IntoIterator<Item = Alert>) {
        self.entries.extend(alerts);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The newest `limit` alerts, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn all(&self) -> Vec<Alert> {
        self.entries.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    High,
}

impl From<AlertKind> for Priority {
    fn from(kind: AlertKind) -> Self {
        match kind {
            AlertKind::Speeding => Priority::High,
            AlertKind::Stagnation => Priority::Normal,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert, priority: Priority) -> Result<()>;
}

/// Writes every alert to the log at a level matching its priority.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert, priority: Priority) -> Result<()> {
        match priority {
            Priority::High => warn!(
                kind = alert.kind.as_str(),
                vehicle = %alert.vehicle_name,
                "Vehicle alert: {}",
                alert.message
            ),
            Priority::Normal => tracing::info!(
                kind = alert.kind.as_str(),
                vehicle = %alert.vehicle_name,
                "Vehicle alert: {}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Owns the alert log and fans committed alerts out to notifier and subscribers.
pub struct AlertSink {
    log: Mutex<AlertLog>,
    notifier: Arc<dyn Notifier>,
    updates: broadcast::Sender<Vec<Alert>>,
}

impl AlertSink {
    pub fn new(cap: usize, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_log(AlertLog::new(cap), notifier)
    }

    pub fn with_log(log: AlertLog, notifier: Arc<dyn Notifier>) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            log: Mutex::new(log),
            notifier,
            updates,
        }
    }

    /// Live feed of committed alert batches.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<Alert>> {
        self.updates.subscribe()
    }

    pub async fn commit(&self, alerts: Vec<Alert>) {
        if alerts.is_empty() {
            return;
        }

        self.with_log_mut(|log| log.extend(alerts.iter().cloned()));
        for alert in &alerts {
            ALERTS_TOTAL.with_label_values(&[alert.kind.as_str()]).inc();
        }

        for alert in &alerts {
            if let Err(e) = self.notifier.notify(alert, Priority::from(alert.kind)).await {
                NOTIFY_FAILURES_TOTAL.inc();
                error!("Failed to send notification for {}: {}", alert.vehicle_id, e);
            }
        }

        // Nobody listening is fine.
        if self.updates.send(alerts).is_err() {
            debug!("No live alert subscribers");
        }
    }

    pub fn len(&self) -> usize {
        self.with_log_mut(|log| log.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.with_log_mut(|log| log.recent(limit))
    }

    pub fn snapshot(&self) -> AlertLog {
        self.with_log_mut(|log| log.clone())
    }

    fn with_log_mut<T>(&self, f: impl FnOnce(&mut AlertLog) -> T) -> T {
        match self.log.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}
