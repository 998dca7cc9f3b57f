//! Progress and status notifications for interested clients.
//!
//! The pipeline only publishes; delivery to browsers or other transports is
//! up to whoever subscribes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::domain::{JobStage, JobStatus};

/// Advisory details attached to a progress event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    /// Estimated seconds until the job finishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressDetails {
    pub fn task(task: impl Into<String>) -> Self {
        Self {
            current_task: Some(task.into()),
            ..Default::default()
        }
    }
}

/// Wire form of a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        video_id: String,
        progress: u8,
        stage: JobStage,
        #[serde(flatten)]
        details: ProgressDetails,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        video_id: String,
        status: JobStatus,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn video_id(&self) -> &str {
        match self {
            Self::Progress { video_id, .. } | Self::Status { video_id, .. } => video_id,
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Fire-and-forget sink for job notifications.
///
/// Implementations must not block; a slow or absent subscriber never
/// affects the pipeline.
pub trait Broadcaster: Send + Sync {
    fn broadcast_progress(
        &self,
        job_id: &str,
        percent: u8,
        stage: JobStage,
        details: ProgressDetails,
    );

    fn broadcast_status(&self, job_id: &str, status: JobStatus);
}

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Fans events out over a tokio broadcast channel.
///
/// Lagging subscribers lose the oldest events.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<PipelineEvent>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn publish(&self, event: PipelineEvent) {
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast_progress(
        &self,
        job_id: &str,
        percent: u8,
        stage: JobStage,
        details: ProgressDetails,
    ) {
        self.publish(PipelineEvent::Progress {
            video_id: job_id.to_string(),
            progress: percent,
            stage,
            details,
            timestamp: Utc::now(),
        });
    }

    fn broadcast_status(&self, job_id: &str, status: JobStatus) {
        self.publish(PipelineEvent::Status {
            video_id: job_id.to_string(),
            status,
            timestamp: Utc::now(),
        });
    }
}

/// Writes every event to the log and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingBroadcaster;

impl Broadcaster for TracingBroadcaster {
    fn broadcast_progress(
        &self,
        job_id: &str,
        percent: u8,
        stage: JobStage,
        details: ProgressDetails,
    ) {
        debug!(
            job_id,
            percent,
            %stage,
            task = details.current_task.as_deref().unwrap_or(""),
            eta_secs = details.eta_secs,
            "Job progress"
        );
    }

    fn broadcast_status(&self, job_id: &str, status: JobStatus) {
        info!(job_id, %status, "Job status changed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_event_json_shape() {
        let event = PipelineEvent::Progress {
            video_id: "abc".to_string(),
            progress: 42,
            stage: JobStage::Transcoding,
            details: ProgressDetails {
                current_task: Some("720p variant (40%)".to_string()),
                eta_secs: Some(12),
                error: None,
            },
            timestamp: Utc::now(),
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["videoId"], "abc");
        assert_eq!(json["progress"], 42);
        assert_eq!(json["stage"], "transcoding");
        assert_eq!(json["currentTask"], "720p variant (40%)");
        assert_eq!(json["etaSecs"], 12);
        assert!(json.get("error").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_status_event_json_shape() {
        let event = PipelineEvent::Status {
            video_id: "abc".to_string(),
            status: JobStatus::Ready,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "ready");
        assert_eq!(event.video_id(), "abc");
    }

    #[tokio::test]
    async fn test_channel_broadcaster_fan_out() {
        let broadcaster = ChannelBroadcaster::new();
        // Publishing without subscribers is a no-op.
        broadcaster.broadcast_status("x", JobStatus::Processing);

        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 2);

        broadcaster.broadcast_progress(
            "job",
            10,
            JobStage::Transcoding,
            ProgressDetails::default(),
        );
        broadcaster.broadcast_status("job", JobStatus::Ready);

        for rx in [&mut a, &mut b] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                PipelineEvent::Progress { progress: 10, .. }
            ));
            assert!(matches!(
                rx.recv().await.unwrap(),
                PipelineEvent::Status {
                    status: JobStatus::Ready,
                    ..
                }
            ));
        }
    }
}
