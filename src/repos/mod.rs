//! 数据仓储层
//!
//! 每张表一个 Repo，提供 `*_with_conn` 变体以便在同一连接/事务内复用。

pub mod material_repo;
pub mod question_repo;
pub mod task_repo;

pub use material_repo::{DbMaterialStore, MaterialRepo, MaterialStore};
pub use question_repo::{CreateQuestionParams, Question, QuestionRepo, ReviewStatus, ReviewUpdate};
pub use task_repo::TaskRepo;
