//! 数据库管理模块
//!
//! 提供独立 SQLite 数据库的初始化和管理功能。
//! 使用 r2d2 连接池，支持并发访问。
//!
//! ## 设计原则
//! - **单一数据库**：使用单个 `quizgen.db`
//! - **连接池管理**：使用 r2d2 管理连接池
//! - **WAL 模式**：提升后台任务与查询路径的并发性能

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::models::AppError;

/// 数据库文件名
const DATABASE_FILENAME: &str = "quizgen.db";

/// 连接池上限
const MAX_POOL_SIZE: u32 = 8;

/// 获取连接的等待上限
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite 连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite 池化连接类型
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// 数据库管理器
pub struct Database {
    pool: DbPool,
    db_path: PathBuf,
}

impl Database {
    /// 在指定目录下创建（或打开）数据库并初始化 Schema
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("创建数据目录失败: {:?}", data_dir))?;
        let db_path = data_dir.join(DATABASE_FILENAME);

        let pool = Self::build_pool(&db_path)?;
        let db = Database { pool, db_path };
        db.initialize_schema()?;
        Ok(db)
    }

    /// 直接以文件路径打开（测试用）
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("创建数据库目录失败: {:?}", parent))?;
        }
        let pool = Self::build_pool(db_path)?;
        let db = Database {
            pool,
            db_path: db_path.to_path_buf(),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    fn build_pool(db_path: &Path) -> Result<DbPool> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            // WAL + busy_timeout：后台出题任务与审核查询并发访问同一库
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA foreign_keys = ON;",
            )
        });

        let pool = Pool::builder()
            .max_size(MAX_POOL_SIZE)
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .build(manager)
            .context("创建数据库连接池失败")?;

        info!("[Database] 连接池就绪: {:?}", db_path);
        Ok(pool)
    }

    /// 获取池化连接
    pub fn get_conn(&self) -> Result<PooledConnection> {
        self.pool.get().context("获取数据库连接失败")
    }

    /// 获取池化连接（服务层错误类型）
    pub fn get_conn_safe(&self) -> std::result::Result<PooledConnection, AppError> {
        self.pool
            .get()
            .map_err(|e| AppError::database(format!("获取数据库连接失败: {}", e)))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS generation_tasks (
                id TEXT PRIMARY KEY,
                material_id TEXT NOT NULL,
                requested_count INTEGER NOT NULL,
                question_types TEXT NOT NULL, -- JSON数组
                difficulty TEXT NOT NULL,
                knowledge_points TEXT NOT NULL, -- JSON数组
                status TEXT NOT NULL DEFAULT 'pending',
                accepted_count INTEGER NOT NULL DEFAULT 0,
                generated_count INTEGER NOT NULL DEFAULT 0,
                success_rate REAL NOT NULL DEFAULT 0,
                slot_retries TEXT NOT NULL DEFAULT '[]', -- JSON数组
                provider_config_id TEXT,
                simulated INTEGER NOT NULL DEFAULT 0,
                created_by TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status
                ON generation_tasks(status);

            CREATE TABLE IF NOT EXISTS questions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                question_type TEXT NOT NULL,
                stem TEXT NOT NULL,
                options_json TEXT NOT NULL, -- JSON数组 [{key, content}]
                correct_answer TEXT NOT NULL,
                analysis_json TEXT NOT NULL, -- {material_excerpt, reasoning, conclusion}
                quality_score INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'ai_reviewing',
                issues TEXT NOT NULL DEFAULT '[]', -- JSON数组
                reviewer_comment TEXT,
                repaired INTEGER NOT NULL DEFAULT 0,
                repair_actions TEXT NOT NULL DEFAULT '[]', -- JSON数组
                simulated INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY(task_id) REFERENCES generation_tasks(id)
            );
            CREATE INDEX IF NOT EXISTS idx_questions_task
                ON questions(task_id);
            CREATE INDEX IF NOT EXISTS idx_questions_status
                ON questions(status);

            CREATE TABLE IF NOT EXISTS materials (
                id TEXT PRIMARY KEY,
                title TEXT,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            COMMIT;",
        )
        .context("初始化数据库Schema失败")?;

        Ok(())
    }

    // ========================================================================
    // settings 表读写
    // ========================================================================

    pub fn get_setting(&self, key: &str) -> std::result::Result<Option<String>, AppError> {
        let conn = self.get_conn_safe()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                rusqlite::params![key],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(|e| AppError::database(format!("读取设置 {} 失败: {}", key, e)))?;
        Ok(value)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> std::result::Result<(), AppError> {
        let conn = self.get_conn_safe()?;
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            rusqlite::params![key, value, now],
        )
        .map_err(|e| {
            warn!("[Database] 写入设置 {} 失败: {}", key, e);
            AppError::database(format!("写入设置 {} 失败: {}", key, e))
        })?;
        Ok(())
    }
}
