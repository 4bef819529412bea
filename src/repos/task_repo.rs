//! 生成任务表 CRUD
//!
//! 进度更新采用单写者约束：`increment_accepted` 用带守卫的条件 UPDATE
//! 保证 `0 ≤ accepted ≤ requested` 且单调递增；终态写入同样带守卫，
//! 任务一旦进入终态便不可再变。

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::database::Database;
use crate::models::{AppError, GenerationTask, TaskStatus};
use crate::question_gen::types::{Difficulty, QuestionType};

/// Log row-parse errors instead of silently discarding them.
fn log_and_skip_err<T>(result: Result<T, rusqlite::Error>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("[TaskRepo] Row parse error (skipped): {}", e);
            None
        }
    }
}

/// 生成任务表 Repo
pub struct TaskRepo;

impl TaskRepo {
    /// 创建任务（初始状态 pending）
    pub fn create_task(
        db: &Database,
        material_id: &str,
        requested_count: u32,
        question_types: &[QuestionType],
        difficulty: Difficulty,
        knowledge_points: &[String],
        provider_config_id: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<GenerationTask, AppError> {
        let conn = db.get_conn_safe()?;
        let id = format!("task_{}", uuid::Uuid::new_v4().simple());
        let now = chrono::Utc::now().to_rfc3339();

        let types_json = serde_json::to_string(
            &question_types.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());
        let kps_json =
            serde_json::to_string(knowledge_points).unwrap_or_else(|_| "[]".to_string());
        let retries_json = serde_json::to_string(&vec![0u32; requested_count as usize])
            .unwrap_or_else(|_| "[]".to_string());

        conn.execute(
            r#"
            INSERT INTO generation_tasks (
                id, material_id, requested_count, question_types, difficulty,
                knowledge_points, status, accepted_count, generated_count,
                success_rate, slot_retries, provider_config_id, simulated,
                created_by, error, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, 0, 0, ?7, ?8, 0, ?9, NULL, ?10, ?10
            )
            "#,
            params![
                id,
                material_id,
                requested_count,
                types_json,
                difficulty.as_str(),
                kps_json,
                retries_json,
                provider_config_id,
                created_by,
                now,
            ],
        )?;

        info!("[TaskRepo] Created task id={} requested={}", id, requested_count);

        Self::get_task_with_conn(&conn, &id)?
            .ok_or_else(|| AppError::database(format!("任务创建后读取失败: {}", id)))
    }

    pub fn get_task(db: &Database, task_id: &str) -> Result<Option<GenerationTask>, AppError> {
        let conn = db.get_conn_safe()?;
        Self::get_task_with_conn(&conn, task_id)
    }

    pub fn get_task_with_conn(
        conn: &Connection,
        task_id: &str,
    ) -> Result<Option<GenerationTask>, AppError> {
        let task = conn
            .query_row(
                "SELECT * FROM generation_tasks WHERE id = ?1",
                params![task_id],
                Self::map_task_row,
            )
            .optional()?;
        Ok(task)
    }

    /// pending -> processing
    pub fn mark_processing(db: &Database, task_id: &str) -> Result<bool, AppError> {
        let conn = db.get_conn_safe()?;
        let now = chrono::Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE generation_tasks SET status = 'processing', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![task_id, now],
        )?;
        Ok(changed > 0)
    }

    /// 带守卫的进度自增
    ///
    /// 仅在任务仍为 processing 且 accepted < requested 时生效，返回自增后
    /// 的 accepted 值；守卫未命中返回 None（并发下不会丢失或越界）。
    pub fn increment_accepted(db: &Database, task_id: &str) -> Result<Option<u32>, AppError> {
        let conn = db.get_conn_safe()?;
        if !Self::increment_accepted_with_conn(&conn, task_id)? {
            return Ok(None);
        }
        let accepted = conn.query_row(
            "SELECT accepted_count FROM generation_tasks WHERE id = ?1",
            params![task_id],
            |row| row.get::<_, u32>(0),
        )?;
        Ok(Some(accepted))
    }

    /// 进度自增（事务内复用），返回守卫是否命中
    pub fn increment_accepted_with_conn(
        conn: &Connection,
        task_id: &str,
    ) -> Result<bool, AppError> {
        let now = chrono::Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE generation_tasks
             SET accepted_count = accepted_count + 1, updated_at = ?2
             WHERE id = ?1 AND status = 'processing'
               AND accepted_count < requested_count",
            params![task_id, now],
        )?;
        Ok(changed > 0)
    }

    /// 写入终态与结果摘要
    ///
    /// 守卫 `status IN ('pending','processing')`：已终态的任务不可再变。
    /// 返回是否实际写入。
    #[allow(clippy::too_many_arguments)]
    pub fn finalize(
        db: &Database,
        task_id: &str,
        status: TaskStatus,
        generated_count: u32,
        success_rate: f64,
        slot_retries: &[u32],
        error: Option<&str>,
        simulated: bool,
    ) -> Result<bool, AppError> {
        if !status.is_terminal() {
            return Err(AppError::validation(format!(
                "finalize 只接受终态，收到: {}",
                status.as_str()
            )));
        }

        let conn = db.get_conn_safe()?;
        let now = chrono::Utc::now().to_rfc3339();
        let retries_json =
            serde_json::to_string(slot_retries).unwrap_or_else(|_| "[]".to_string());

        let changed = conn.execute(
            "UPDATE generation_tasks
             SET status = ?2, generated_count = ?3, success_rate = ?4,
                 slot_retries = ?5, error = ?6, simulated = ?7, updated_at = ?8
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![
                task_id,
                status.as_str(),
                generated_count,
                success_rate,
                retries_json,
                error,
                simulated,
                now,
            ],
        )?;

        if changed > 0 {
            info!(
                "[TaskRepo] Task {} finalized: status={} generated={} success_rate={:.2}",
                task_id,
                status.as_str(),
                generated_count,
                success_rate
            );
        } else {
            warn!(
                "[TaskRepo] Task {} 已处于终态，忽略 finalize({})",
                task_id,
                status.as_str()
            );
        }
        Ok(changed > 0)
    }

    /// 列出指定状态的任务（运维/恢复用）
    pub fn list_by_status(
        db: &Database,
        status: TaskStatus,
    ) -> Result<Vec<GenerationTask>, AppError> {
        let conn = db.get_conn_safe()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM generation_tasks WHERE status = ?1 ORDER BY created_at ASC",
        )?;
        let tasks = stmt
            .query_map(params![status.as_str()], Self::map_task_row)?
            .filter_map(log_and_skip_err)
            .collect();
        Ok(tasks)
    }

    fn map_task_row(row: &Row<'_>) -> Result<GenerationTask, rusqlite::Error> {
        let types_json: String = row.get("question_types")?;
        let question_types: Vec<QuestionType> = serde_json::from_str::<Vec<String>>(&types_json)
            .unwrap_or_default()
            .iter()
            .filter_map(|s| QuestionType::from_str(s))
            .collect();

        let kps_json: String = row.get("knowledge_points")?;
        let retries_json: String = row.get("slot_retries")?;
        let difficulty: String = row.get("difficulty")?;
        let status: String = row.get("status")?;

        Ok(GenerationTask {
            id: row.get("id")?,
            material_id: row.get("material_id")?,
            requested_count: row.get("requested_count")?,
            question_types,
            difficulty: Difficulty::from_str(&difficulty),
            knowledge_points: serde_json::from_str(&kps_json).unwrap_or_default(),
            status: TaskStatus::from_str(&status),
            accepted_count: row.get("accepted_count")?,
            generated_count: row.get("generated_count")?,
            success_rate: row.get("success_rate")?,
            slot_retries: serde_json::from_str(&retries_json).unwrap_or_default(),
            provider_config_id: row.get("provider_config_id")?,
            simulated: row.get("simulated")?,
            created_by: row.get("created_by")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path()).unwrap();
        (dir, db)
    }

    fn new_task(db: &Database, requested: u32) -> GenerationTask {
        TaskRepo::create_task(
            db,
            "mat_1",
            requested,
            &[QuestionType::SingleChoice],
            Difficulty::Medium,
            &["知识点A".to_string()],
            Some("cfg_1"),
            Some("user_1"),
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_get() {
        let (_dir, db) = setup();
        let task = new_task(&db, 5);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.accepted_count, 0);
        assert_eq!(task.slot_retries, vec![0; 5]);
        assert_eq!(task.provider_config_id.as_deref(), Some("cfg_1"));

        let loaded = TaskRepo::get_task(&db, &task.id).unwrap().unwrap();
        assert_eq!(loaded.question_types, vec![QuestionType::SingleChoice]);

        let pending = TaskRepo::list_by_status(&db, TaskStatus::Pending).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(TaskRepo::list_by_status(&db, TaskStatus::Completed)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_increment_guarded_by_requested() {
        let (_dir, db) = setup();
        let task = new_task(&db, 2);

        // pending 状态下守卫不放行
        assert_eq!(TaskRepo::increment_accepted(&db, &task.id).unwrap(), None);

        assert!(TaskRepo::mark_processing(&db, &task.id).unwrap());
        assert_eq!(TaskRepo::increment_accepted(&db, &task.id).unwrap(), Some(1));
        assert_eq!(TaskRepo::increment_accepted(&db, &task.id).unwrap(), Some(2));
        // accepted == requested 后不可再增
        assert_eq!(TaskRepo::increment_accepted(&db, &task.id).unwrap(), None);
    }

    #[test]
    fn test_finalize_guards_terminal() {
        let (_dir, db) = setup();
        let task = new_task(&db, 3);
        TaskRepo::mark_processing(&db, &task.id).unwrap();

        assert!(TaskRepo::finalize(
            &db,
            &task.id,
            TaskStatus::Completed,
            2,
            2.0 / 3.0,
            &[1, 0, 3],
            None,
            false,
        )
        .unwrap());

        // 终态不可覆盖
        assert!(!TaskRepo::finalize(
            &db,
            &task.id,
            TaskStatus::Cancelled,
            0,
            0.0,
            &[],
            None,
            false,
        )
        .unwrap());

        let loaded = TaskRepo::get_task(&db, &task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        let summary = loaded.result_summary();
        assert_eq!(summary.generated_count, 2);
        assert_eq!(summary.slot_retries, vec![1, 0, 3]);

        // 非终态参数直接报错
        assert!(TaskRepo::finalize(
            &db,
            &task.id,
            TaskStatus::Processing,
            0,
            0.0,
            &[],
            None,
            false,
        )
        .is_err());
    }
}
