//! Data-store collaborator used by job handlers.
//!
//! The relational store lives outside this subsystem; handlers see it only
//! through [`DataStore`]. Every write is keyed so that replaying a handler
//! converges on the same state.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use labflow_core::{OrganizationId, UserId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub organization_id: OrganizationId,
    pub name: String,
    pub status: DeviceStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: String,
    pub device_id: String,
    pub received_at: DateTime<Utc>,
    pub battery: Option<f64>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: String,
    pub experiment_id: String,
    pub metric: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub experiment_id: String,
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Csv,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub experiment_id: String,
    pub task_id: String,
    pub format: ReportFormat,
    pub content: String,
    pub rows: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDelivery {
    pub notification_id: String,
    pub user_id: UserId,
    pub delivered_at: DateTime<Utc>,
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn get_device(&self, device_id: &str) -> Result<Option<Device>, StoreError>;

    async fn upsert_device(&self, device: Device) -> Result<(), StoreError>;

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError>;

    /// Returns `false` when a heartbeat with the same id already exists.
    async fn insert_heartbeat(&self, heartbeat: Heartbeat) -> Result<bool, StoreError>;

    async fn insert_measurement(&self, measurement: Measurement) -> Result<(), StoreError>;

    async fn measurements_for(&self, experiment_id: &str) -> Result<Vec<Measurement>, StoreError>;

    async fn purge_measurements_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn upsert_summary(&self, summary: ExperimentSummary) -> Result<(), StoreError>;

    async fn get_summary(&self, experiment_id: &str) -> Result<Option<ExperimentSummary>, StoreError>;

    async fn upsert_report(&self, report: Report) -> Result<(), StoreError>;

    async fn get_report(&self, report_id: &str) -> Result<Option<Report>, StoreError>;

    async fn notification_delivered(&self, notification_id: &str) -> Result<bool, StoreError>;

    /// Returns `false` when the notification was already recorded.
    async fn record_notification(&self, delivery: NotificationDelivery) -> Result<bool, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    devices: HashMap<String, Device>,
    heartbeats: HashMap<String, Heartbeat>,
    measurements: HashMap<String, Measurement>,
    summaries: HashMap<String, ExperimentSummary>,
    reports: HashMap<String, Report>,
    notifications: HashMap<String, NotificationDelivery>,
}

/// In-memory data store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    tables: RwLock<Tables>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.tables.read().heartbeats.len()
    }

    pub fn measurement_count(&self) -> usize {
        self.tables.read().measurements.len()
    }

    pub fn notification_count(&self) -> usize {
        self.tables.read().notifications.len()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn get_device(&self, device_id: &str) -> Result<Option<Device>, StoreError> {
        Ok(self.tables.read().devices.get(device_id).cloned())
    }

    async fn upsert_device(&self, device: Device) -> Result<(), StoreError> {
        self.tables.write().devices.insert(device.id.clone(), device);
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let mut devices: Vec<Device> = self.tables.read().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn insert_heartbeat(&self, heartbeat: Heartbeat) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        if tables.heartbeats.contains_key(&heartbeat.id) {
            return Ok(false);
        }
        tables.heartbeats.insert(heartbeat.id.clone(), heartbeat);
        Ok(true)
    }

    async fn insert_measurement(&self, measurement: Measurement) -> Result<(), StoreError> {
        self.tables
            .write()
            .measurements
            .insert(measurement.id.clone(), measurement);
        Ok(())
    }

    async fn measurements_for(&self, experiment_id: &str) -> Result<Vec<Measurement>, StoreError> {
        let mut rows: Vec<Measurement> = self
            .tables
            .read()
            .measurements
            .values()
            .filter(|m| m.experiment_id == experiment_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn purge_measurements_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.tables.write();
        let before = tables.measurements.len();
        tables.measurements.retain(|_, m| m.recorded_at >= cutoff);
        Ok(before - tables.measurements.len())
    }

    async fn upsert_summary(&self, summary: ExperimentSummary) -> Result<(), StoreError> {
        self.tables
            .write()
            .summaries
            .insert(summary.experiment_id.clone(), summary);
        Ok(())
    }

    async fn get_summary(&self, experiment_id: &str) -> Result<Option<ExperimentSummary>, StoreError> {
        Ok(self.tables.read().summaries.get(experiment_id).cloned())
    }

    async fn upsert_report(&self, report: Report) -> Result<(), StoreError> {
        self.tables.write().reports.insert(report.id.clone(), report);
        Ok(())
    }

    async fn get_report(&self, report_id: &str) -> Result<Option<Report>, StoreError> {
        Ok(self.tables.read().reports.get(report_id).cloned())
    }

    async fn notification_delivered(&self, notification_id: &str) -> Result<bool, StoreError> {
        Ok(self.tables.read().notifications.contains_key(notification_id))
    }

    async fn record_notification(&self, delivery: NotificationDelivery) -> Result<bool, StoreError> {
        let mut tables = self.tables.write();
        if tables.notifications.contains_key(&delivery.notification_id) {
            return Ok(false);
        }
        tables
            .notifications
            .insert(delivery.notification_id.clone(), delivery);
        Ok(true)
    }
}
