use crate::backup::result_error::result::Result;

use bon::Builder;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use std::sync::Arc;

/// Lifecycle stage of an observed operation.
#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    #[display("started")]
    Started,
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
}

/// Which operation the event belongs to.
#[derive(Clone, Copy, Debug, Display, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    #[display("backup")]
    Backup,
    #[display("restore")]
    Restore,
    #[display("delete")]
    Delete,
    #[display("scheduled_run")]
    ScheduledRun,
}

/// One lifecycle event handed to every configured notification sink.
#[skip_serializing_none]
#[derive(Clone, Debug, Builder, Getters, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct BackupEvent {
    kind: EventKind,
    operation: Operation,
    timestamp: DateTime<Utc>,
    #[builder(into)]
    detail: Option<String>,
}

impl BackupEvent {
    pub fn now(kind: EventKind, operation: Operation) -> Self {
        BackupEvent::builder()
            .kind(kind)
            .operation(operation)
            .timestamp(Utc::now())
            .build()
    }

    pub fn now_with_detail<S: Into<String>>(
        kind: EventKind,
        operation: Operation,
        detail: S,
    ) -> Self {
        BackupEvent::builder()
            .kind(kind)
            .operation(operation)
            .timestamp(Utc::now())
            .detail(detail.into())
            .build()
    }
}

/// Receives lifecycle events. Implementations must tolerate concurrent
/// callers.
pub trait Notification: Send + Sync {
    fn notify(&self, event: &BackupEvent) -> Result<()>;
}

/// Sink that forwards events to the tracing subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotification;

impl Notification for LogNotification {
    fn notify(&self, event: &BackupEvent) -> Result<()> {
        match event.kind() {
            EventKind::Failed => tracing::warn!(
                "{} {} at {}{}",
                event.operation(),
                event.kind(),
                event.timestamp(),
                format_detail(event)
            ),
            _ => tracing::info!(
                "{} {} at {}{}",
                event.operation(),
                event.kind(),
                event.timestamp(),
                format_detail(event)
            ),
        }
        Ok(())
    }
}

fn format_detail(event: &BackupEvent) -> String {
    event
        .detail()
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

/// Fans an event out to every sink. A failing sink is logged and skipped,
/// it never aborts the operation that emitted the event.
pub fn emit(sinks: &[Arc<dyn Notification>], event: &BackupEvent) {
    for sink in sinks {
        if let Err(e) = sink.notify(event) {
            tracing::warn!(
                "Notification sink failed for {} event: {}",
                event.operation(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::error::Error;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<BackupEvent>>,
    }

    impl Notification for CollectingSink {
        fn notify(&self, event: &BackupEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl Notification for FailingSink {
        fn notify(&self, _event: &BackupEvent) -> Result<()> {
            Err(Error::not_found("sink is offline"))
        }
    }

    #[test]
    fn emit_reaches_every_sink() {
        let sink = Arc::new(CollectingSink::default());
        let sinks: Vec<Arc<dyn Notification>> = vec![Arc::new(FailingSink), sink.clone()];

        emit(&sinks, &BackupEvent::now(EventKind::Started, Operation::Backup));
        emit(
            &sinks,
            &BackupEvent::now_with_detail(EventKind::Failed, Operation::Backup, "disk on fire"),
        );

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(*events[0].kind(), EventKind::Started);
        assert_eq!(*events[1].kind(), EventKind::Failed);
        assert_eq!(events[1].detail().as_deref(), Some("disk on fire"));
    }

    #[test]
    fn events_serialize_without_null_detail() {
        let event = BackupEvent::builder()
            .kind(EventKind::Succeeded)
            .operation(Operation::Restore)
            .timestamp(Utc::now())
            .build();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"succeeded\""));
        assert!(json.contains("\"restore\""));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(Operation::ScheduledRun.to_string(), "scheduled_run");
        assert_eq!(EventKind::Failed.to_string(), "failed");
    }
}
