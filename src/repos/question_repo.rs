//! 题目表 CRUD 与审核状态流转
//!
//! 题目由编排器在接受候选题时创建（初始 ai_reviewing），此后只通过
//! `transition_status` 沿固定的单向路径流转，任何状态都不会被重入：
//!
//! ```text
//! ai_reviewing ─┬─> ai_approved ──> pending ─┬─> approved
//!               └─> ai_rejected              └─> rejected
//! ```
//!
//! 人工审核队列的读取路径只返回 pending 状态的题目。

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::models::AppError;
use crate::question_gen::types::{
    AnswerAnalysis, QuestionOption, QuestionType, RepairAction,
};

/// Log row-parse errors instead of silently discarding them.
fn log_and_skip_err<T>(result: Result<T, rusqlite::Error>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("[QuestionRepo] Row parse error (skipped): {}", e);
            None
        }
    }
}

// ============================================================================
// 审核状态
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    AiReviewing,
    AiApproved,
    AiRejected,
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::AiReviewing => "ai_reviewing",
            ReviewStatus::AiApproved => "ai_approved",
            ReviewStatus::AiRejected => "ai_rejected",
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ai_reviewing" => ReviewStatus::AiReviewing,
            "ai_approved" => ReviewStatus::AiApproved,
            "ai_rejected" => ReviewStatus::AiRejected,
            "pending" => ReviewStatus::Pending,
            "approved" => ReviewStatus::Approved,
            "rejected" => ReviewStatus::Rejected,
            _ => ReviewStatus::AiReviewing,
        }
    }

    /// 终态（ai_rejected 仅能通过“重新提交为新候选题”离开，自身不再流转）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReviewStatus::AiRejected | ReviewStatus::Approved | ReviewStatus::Rejected
        )
    }

    /// 单向流转边
    pub fn can_transition(from: ReviewStatus, to: ReviewStatus) -> bool {
        matches!(
            (from, to),
            (ReviewStatus::AiReviewing, ReviewStatus::AiApproved)
                | (ReviewStatus::AiReviewing, ReviewStatus::AiRejected)
                | (ReviewStatus::AiApproved, ReviewStatus::Pending)
                | (ReviewStatus::Pending, ReviewStatus::Approved)
                | (ReviewStatus::Pending, ReviewStatus::Rejected)
        )
    }
}

// ============================================================================
// 题目实体
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub task_id: String,
    pub question_type: QuestionType,
    pub stem: String,
    pub options: Vec<QuestionOption>,
    pub correct_answer: String,
    pub analysis: AnswerAnalysis,
    pub quality_score: i32,
    pub status: ReviewStatus,
    pub issues: Vec<String>,
    pub reviewer_comment: Option<String>,
    /// 候选题入库前经过了确定性修复
    pub repaired: bool,
    pub repair_actions: Vec<RepairAction>,
    /// 模拟生成器产出
    pub simulated: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// 题目创建参数
#[derive(Debug, Clone)]
pub struct CreateQuestionParams {
    pub task_id: String,
    pub question_type: QuestionType,
    pub stem: String,
    pub options: Vec<QuestionOption>,
    pub correct_answer: String,
    pub analysis: AnswerAnalysis,
    pub quality_score: i32,
    pub repair_actions: Vec<RepairAction>,
    pub simulated: bool,
}

/// 状态流转时的增量更新
#[derive(Debug, Clone, Default)]
pub struct ReviewUpdate {
    pub quality_score: Option<i32>,
    pub issues: Option<Vec<String>>,
    pub reviewer_comment: Option<String>,
}

// ============================================================================
// 题目表 Repo
// ============================================================================

pub struct QuestionRepo;

impl QuestionRepo {
    /// 创建题目（初始状态 ai_reviewing）
    pub fn create_question(
        db: &Database,
        params_in: &CreateQuestionParams,
    ) -> Result<Question, AppError> {
        let conn = db.get_conn_safe()?;
        Self::create_question_with_conn(&conn, params_in)
    }

    pub fn create_question_with_conn(
        conn: &Connection,
        params_in: &CreateQuestionParams,
    ) -> Result<Question, AppError> {
        let id = format!("q_{}", nanoid::nanoid!(10));
        let now = chrono::Utc::now().to_rfc3339();

        let options_json =
            serde_json::to_string(&params_in.options).unwrap_or_else(|_| "[]".to_string());
        let analysis_json =
            serde_json::to_string(&params_in.analysis).unwrap_or_else(|_| "{}".to_string());
        let actions_json =
            serde_json::to_string(&params_in.repair_actions).unwrap_or_else(|_| "[]".to_string());
        let repaired = !params_in.repair_actions.is_empty();

        conn.execute(
            r#"
            INSERT INTO questions (
                id, task_id, question_type, stem, options_json, correct_answer,
                analysis_json, quality_score, status, issues, reviewer_comment,
                repaired, repair_actions, simulated, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'ai_reviewing', '[]', NULL,
                ?9, ?10, ?11, ?12, ?12
            )
            "#,
            params![
                id,
                params_in.task_id,
                params_in.question_type.as_str(),
                params_in.stem,
                options_json,
                params_in.correct_answer,
                analysis_json,
                params_in.quality_score,
                repaired,
                actions_json,
                params_in.simulated,
                now,
            ],
        )?;

        debug!("[QuestionRepo] Created question id={} task={}", id, params_in.task_id);

        Self::get_question_with_conn(conn, &id)?
            .ok_or_else(|| AppError::database(format!("题目创建后读取失败: {}", id)))
    }

    pub fn get_question(db: &Database, question_id: &str) -> Result<Option<Question>, AppError> {
        let conn = db.get_conn_safe()?;
        Self::get_question_with_conn(&conn, question_id)
    }

    pub fn get_question_with_conn(
        conn: &Connection,
        question_id: &str,
    ) -> Result<Option<Question>, AppError> {
        let question = conn
            .query_row(
                "SELECT * FROM questions WHERE id = ?1",
                params![question_id],
                Self::map_question_row,
            )
            .optional()?;
        Ok(question)
    }

    /// 沿单向路径流转题目状态
    ///
    /// `from` 不匹配当前状态、或边不在流转图中时返回校验错误，
    /// 保证任何状态都不会被重入。
    pub fn transition_status(
        db: &Database,
        question_id: &str,
        from: ReviewStatus,
        to: ReviewStatus,
        update: &ReviewUpdate,
    ) -> Result<Question, AppError> {
        if !ReviewStatus::can_transition(from, to) {
            return Err(AppError::validation(format!(
                "非法状态流转: {} -> {}",
                from.as_str(),
                to.as_str()
            )));
        }

        let conn = db.get_conn_safe()?;
        let now = chrono::Utc::now().to_rfc3339();
        let issues_json = update
            .issues
            .as_ref()
            .map(|i| serde_json::to_string(i).unwrap_or_else(|_| "[]".to_string()));

        let changed = conn.execute(
            "UPDATE questions
             SET status = ?3,
                 quality_score = COALESCE(?4, quality_score),
                 issues = COALESCE(?5, issues),
                 reviewer_comment = COALESCE(?6, reviewer_comment),
                 updated_at = ?7
             WHERE id = ?1 AND status = ?2",
            params![
                question_id,
                from.as_str(),
                to.as_str(),
                update.quality_score,
                issues_json,
                update.reviewer_comment,
                now,
            ],
        )?;

        if changed == 0 {
            return match Self::get_question_with_conn(&conn, question_id)? {
                None => Err(AppError::not_found(format!("题目不存在: {}", question_id))),
                Some(current) => Err(AppError::validation(format!(
                    "题目 {} 当前状态为 {}，无法执行 {} -> {}",
                    question_id,
                    current.status.as_str(),
                    from.as_str(),
                    to.as_str()
                ))),
            };
        }

        info!(
            "[QuestionRepo] Question {} 状态流转 {} -> {}",
            question_id,
            from.as_str(),
            to.as_str()
        );

        Self::get_question_with_conn(&conn, question_id)?
            .ok_or_else(|| AppError::database(format!("题目流转后读取失败: {}", question_id)))
    }

    /// 人工审核队列读取路径
    ///
    /// 只返回 pending 状态的题目，ai_reviewing / ai_rejected 永远不会出现。
    pub fn list_pending_review(
        db: &Database,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Question>, AppError> {
        let conn = db.get_conn_safe()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM questions WHERE status = 'pending'
             ORDER BY created_at ASC LIMIT ?1 OFFSET ?2",
        )?;
        let questions = stmt
            .query_map(params![limit, offset], Self::map_question_row)?
            .filter_map(log_and_skip_err)
            .collect();
        Ok(questions)
    }

    pub fn list_by_task(db: &Database, task_id: &str) -> Result<Vec<Question>, AppError> {
        let conn = db.get_conn_safe()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM questions WHERE task_id = ?1 ORDER BY created_at ASC",
        )?;
        let questions = stmt
            .query_map(params![task_id], Self::map_question_row)?
            .filter_map(log_and_skip_err)
            .collect();
        Ok(questions)
    }

    fn map_question_row(row: &Row<'_>) -> Result<Question, rusqlite::Error> {
        let question_type: String = row.get("question_type")?;
        let options_json: String = row.get("options_json")?;
        let analysis_json: String = row.get("analysis_json")?;
        let issues_json: String = row.get("issues")?;
        let actions_json: String = row.get("repair_actions")?;
        let status: String = row.get("status")?;

        Ok(Question {
            id: row.get("id")?,
            task_id: row.get("task_id")?,
            question_type: QuestionType::from_str(&question_type)
                .unwrap_or(QuestionType::SingleChoice),
            stem: row.get("stem")?,
            options: serde_json::from_str(&options_json).unwrap_or_default(),
            correct_answer: row.get("correct_answer")?,
            analysis: serde_json::from_str(&analysis_json).unwrap_or_default(),
            quality_score: row.get("quality_score")?,
            status: ReviewStatus::from_str(&status),
            issues: serde_json::from_str(&issues_json).unwrap_or_default(),
            reviewer_comment: row.get("reviewer_comment")?,
            repaired: row.get("repaired")?,
            repair_actions: serde_json::from_str(&actions_json).unwrap_or_default(),
            simulated: row.get("simulated")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}
