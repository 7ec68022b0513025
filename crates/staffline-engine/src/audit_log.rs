use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use staffline_core::event::{EventBus, WorkflowEvent};

/// JSONL audit logger.
///
/// Subscribes to the EventBus and appends one JSON object per engine event
/// to `{audit_dir}/{YYYYMMDD}.jsonl`. Lines are flushed as they are written,
/// so a crash never loses an already logged event.
pub struct AuditLogger {
    audit_dir: PathBuf,
    level: u8,
}

/// A single audit line.
#[derive(Serialize)]
struct AuditEntry {
    timestamp: String,
    instance_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor: Option<String>,
    detail: serde_json::Value,
}

impl AuditLogger {
    /// `level` controls verbosity: 1 = instance lifecycle and exceptions,
    /// 2 = + step transitions, 3 = + every integration attempt.
    pub fn new(audit_dir: PathBuf, level: u8) -> Self {
        Self { audit_dir, level }
    }

    /// Run the logger as a background task until cancelled or the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.audit_dir).await {
            error!(error = %e, "Failed to create audit directory");
            return;
        }

        let mut rx = event_bus.subscribe();
        let mut current: Option<(String, tokio::io::BufWriter<tokio::fs::File>)> = None;
        info!(dir = %self.audit_dir.display(), level = self.level, "Audit logger started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Audit logger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&event) else {
                                continue;
                            };
                            let day = Utc::now().format("%Y%m%d").to_string();
                            if current.as_ref().map(|(d, _)| d != &day).unwrap_or(true) {
                                if let Some((_, mut old)) = current.take() {
                                    old.flush().await.ok();
                                }
                                match open_day_file(&self.audit_dir, &day).await {
                                    Some(w) => current = Some((day, w)),
                                    None => continue,
                                }
                            }
                            let Some((_, writer)) = current.as_mut() else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write audit entry");
                                    break;
                                }
                                // Flush after each entry for crash resilience
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush audit log");
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            error!(skipped = n, "Audit logger lagged, events were not recorded");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, audit logger stopping");
                            break;
                        }
                    }
                }
            }
        }

        if let Some((_, mut writer)) = current {
            writer.flush().await.ok();
        }
        debug!("Audit logger finished");
    }

    /// Convert an event to an audit entry (None if filtered by level).
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<AuditEntry> {
        let min_level = match event {
            WorkflowEvent::InstanceCreated { .. }
            | WorkflowEvent::InstanceStatusChanged { .. }
            | WorkflowEvent::InstanceCancelled { .. }
            | WorkflowEvent::ExceptionOpened { .. }
            | WorkflowEvent::ExceptionClosed { .. } => 1,
            WorkflowEvent::StepTransitioned { .. } => 2,
            WorkflowEvent::IntegrationAttempted { .. }
            | WorkflowEvent::IntegrationSucceeded { .. }
            | WorkflowEvent::IntegrationFailed { .. } => 3,
        };
        if self.level < min_level {
            return None;
        }

        let mut detail = serde_json::to_value(event).ok()?;
        let event_type = detail
            .as_object_mut()
            .and_then(|o| {
                o.remove("instance_id");
                o.remove("type")
            })
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default();
        let actor = detail
            .as_object_mut()
            .and_then(|o| o.remove("actor"))
            .and_then(|v| v.as_str().map(String::from));

        Some(AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            instance_id: event.instance_id().to_string(),
            event_type,
            actor,
            detail,
        })
    }
}

async fn open_day_file(dir: &Path, day: &str) -> Option<tokio::io::BufWriter<tokio::fs::File>> {
    let path = dir.join(format!("{}.jsonl", day));
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => Some(tokio::io::BufWriter::new(f)),
        Err(e) => {
            error!(error = %e, path = %path.display(), "Failed to open audit file");
            None
        }
    }
}
