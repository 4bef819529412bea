use serde::{Deserialize, Serialize};
use std::fmt;

use crate::question_gen::types::{Difficulty, QuestionType};

// ============================================================================
// 结构化错误处理
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppErrorType {
    Validation,
    Database,
    Llm,
    NotFound,
    Configuration,
    Network,
    Cancelled,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub error_type: AppErrorType,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(error_type: AppErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error_type: AppErrorType,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Validation, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Database, message)
    }

    pub fn llm(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Llm, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::NotFound, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Configuration, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Network, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Unknown, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::validation(message)
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::validation(message.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::database(e.to_string())
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

// ============================================================================
// 生成任务实体
// ============================================================================

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => TaskStatus::Pending,
            "processing" => TaskStatus::Processing,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }

    /// 终态任务不可再变更
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// 出题任务实体
///
/// 由调用方创建后仅由编排器（GenerationService）变更，进入终态后不可再变。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationTask {
    pub id: String,
    pub material_id: String,
    pub requested_count: u32,
    pub question_types: Vec<QuestionType>,
    pub difficulty: Difficulty,
    pub knowledge_points: Vec<String>,
    pub status: TaskStatus,
    /// 已接受的题目数（0 ≤ accepted ≤ requested，单调递增直到终态）
    pub accepted_count: u32,
    pub generated_count: u32,
    pub success_rate: f64,
    /// 每个槽位消耗的重试次数（下标 = 槽位序号）
    pub slot_retries: Vec<u32>,
    /// 任务创建时快照的模型配置 ID（见 llm_manager 的快照策略）
    pub provider_config_id: Option<String>,
    /// 降级到本地模拟生成器时为 true
    pub simulated: bool,
    pub created_by: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl GenerationTask {
    /// 结果摘要（进入终态后有意义）
    pub fn result_summary(&self) -> TaskResultSummary {
        TaskResultSummary {
            generated_count: self.generated_count,
            success_rate: self.success_rate,
            slot_retries: self.slot_retries.clone(),
        }
    }
}

/// 创建任务请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub material_id: String,
    pub count: u32,
    pub question_types: Vec<QuestionType>,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub knowledge_points: Vec<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    /// 任务级墙钟预算（秒），缺省使用全局配置
    #[serde(default)]
    pub time_budget_secs: Option<u64>,
}

/// 任务进度（accepted / requested）
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub accepted: u32,
    pub requested: u32,
}

/// 任务结果摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultSummary {
    pub generated_count: u32,
    pub success_rate: f64,
    pub slot_retries: Vec<u32>,
}

/// `get_task_status` 返回的视图
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: TaskProgress,
    pub generated_count: u32,
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatusView {
    pub fn from_task(task: &GenerationTask) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            progress: TaskProgress {
                accepted: task.accepted_count,
                requested: task.requested_count,
            },
            generated_count: task.generated_count,
            success_rate: task.success_rate,
            error: task.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_app_error_helpers() {
        let err = AppError::llm("模型调用失败");
        assert_eq!(err.error_type, AppErrorType::Llm);
        assert_eq!(err.to_string(), "模型调用失败");
    }
}
