use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionTask {
    pub user_id: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running { attempt: u32 },
    Succeeded { attempts: u32 },
    Failed { attempts: u32, error: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub task: ExtractionTask,
    #[serde(flatten)]
    pub status: TaskStatus,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddTurnRequest {
    pub user_id: String,
    pub text: String,
    #[serde(default)]
    pub era: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddTurnResponse {
    pub session_id: String,
    pub utterances: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_task_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateBookRequest {
    #[serde(default)]
    pub relaxed: bool,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter_order: Option<u32>,
    pub retryable: bool,
}
