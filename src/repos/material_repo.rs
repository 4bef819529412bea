//! 材料存取
//!
//! 材料上传与文本抽取属于外部协作方，本层只约定读取契约
//! [`MaterialStore`]，并提供一个基于本库 materials 表的默认实现。

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;

use crate::database::Database;
use crate::models::AppError;

/// 材料读取契约
#[async_trait]
pub trait MaterialStore: Send + Sync {
    /// 返回材料的纯文本内容；材料不存在时返回 NotFound
    async fn get_material_text(&self, material_id: &str) -> Result<String, AppError>;
}

/// materials 表 Repo
pub struct MaterialRepo;

impl MaterialRepo {
    pub fn insert_material(
        db: &Database,
        title: Option<&str>,
        content: &str,
    ) -> Result<String, AppError> {
        let conn = db.get_conn_safe()?;
        let id = format!("mat_{}", nanoid::nanoid!(10));
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO materials (id, title, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, title, content, now],
        )?;
        Ok(id)
    }

    pub fn get_material_text(
        db: &Database,
        material_id: &str,
    ) -> Result<Option<String>, AppError> {
        let conn = db.get_conn_safe()?;
        let content = conn
            .query_row(
                "SELECT content FROM materials WHERE id = ?1",
                params![material_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(content)
    }
}

/// 基于 materials 表的默认材料源
pub struct DbMaterialStore {
    db: Arc<Database>,
}

impl DbMaterialStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MaterialStore for DbMaterialStore {
    async fn get_material_text(&self, material_id: &str) -> Result<String, AppError> {
        MaterialRepo::get_material_text(&self.db, material_id)?
            .ok_or_else(|| AppError::not_found(format!("材料不存在: {}", material_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_material_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(dir.path()).unwrap());
        let id = MaterialRepo::insert_material(&db, Some("细胞"), "细胞是生命的基本单位。")
            .unwrap();

        let store = DbMaterialStore::new(db.clone());
        let text = store.get_material_text(&id).await.unwrap();
        assert_eq!(text, "细胞是生命的基本单位。");

        let missing = store.get_material_text("mat_missing").await;
        assert!(missing.is_err());
    }
}
