//! Job handler implementations.
//!
//! Every handler here is idempotent: running the same envelope twice leaves
//! the data store, the notifier and the event stream exactly as one run
//! would.

pub mod data_processing;
pub mod maintenance;
pub mod notification;
pub mod report;

use crate::jobs::{QueueClass, TaskRegistryBuilder};
use crate::scheduler::ScheduleEntry;

pub use data_processing::{
    ComputeExperimentSummary, ComputeSummaryArgs, HeartbeatArgs, ProcessDeviceHeartbeat,
};
pub use maintenance::{
    MarkStaleDevicesOffline, PurgeDeadLetters, PurgeDeadLettersArgs, PurgeExpiredMeasurements,
    PurgeMeasurementsArgs, StaleDevicesArgs,
};
pub use notification::{SendNotification, SendNotificationArgs};
pub use report::{GenerateExperimentReport, ReportArgs};

/// Register every built-in handler.
pub fn register_all(builder: TaskRegistryBuilder) -> TaskRegistryBuilder {
    builder
        .register_typed(ProcessDeviceHeartbeat)
        .register_typed(ComputeExperimentSummary)
        .register_typed(SendNotification)
        .register_typed(GenerateExperimentReport)
        .register_typed(MarkStaleDevicesOffline)
        .register_typed(PurgeExpiredMeasurements)
        .register_typed(PurgeDeadLetters)
}

/// Built-in periodic maintenance.
pub fn default_schedules() -> Vec<ScheduleEntry> {
    use crate::jobs::TypedJob;

    vec![
        ScheduleEntry::new("devices.mark-stale", "* * * * *", MarkStaleDevicesOffline::NAME)
            .with_queue(QueueClass::Scheduled),
        ScheduleEntry::new("measurements.purge", "0 3 * * *", PurgeExpiredMeasurements::NAME)
            .with_queue(QueueClass::Scheduled),
        ScheduleEntry::new("dead-letters.purge", "30 3 * * *", PurgeDeadLetters::NAME)
            .with_queue(QueueClass::Scheduled),
    ]
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::TaskRegistry;

    #[test]
    fn registers_all_handlers_and_schedule_targets() {
        let registry = register_all(TaskRegistry::builder()).build().unwrap();
        assert_eq!(registry.len(), 7);
        registry
            .validate_targets(default_schedules().iter().map(|e| e.target_job.as_str()))
            .unwrap();
        assert!(registry.registrations().all(|r| r.idempotent));
        for entry in default_schedules() {
            entry.cron().unwrap();
        }
    }
}
