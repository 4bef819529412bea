// quizgen library entry
// AI 出题与审核服务：把教学材料变成考题，经自动复审与人工审核后可用。

pub mod database;
pub mod generation_service;
pub mod llm_manager;
pub mod models;
pub mod providers;
pub mod question_gen;
pub mod repos;
pub mod review_service;
pub mod settings;

use std::path::Path;
use std::sync::Arc;

pub use database::Database;
pub use generation_service::GenerationService;
pub use llm_manager::{ApiConfig, CompletionClient, LLMManager, PromptSpec, ProviderAvailability};
pub use models::{
    AppError, AppErrorType, CreateTaskRequest, GenerationTask, TaskProgress, TaskStatus,
    TaskStatusView,
};
pub use providers::ProviderError;
pub use question_gen::{Difficulty, QuestionType};
pub use repos::{DbMaterialStore, MaterialStore, Question, ReviewStatus};
pub use review_service::{ReviewDecision, ReviewService};
pub use settings::{AppSettings, GenerationSettings};

/// 初始化 tracing 订阅者（RUST_LOG 可覆盖过滤等级）
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// 组装好的应用实例
///
/// 把数据库、模型管理器与两个服务装配到一起，供宿主进程或集成测试
/// 直接使用。材料源默认落在本库的 materials 表；需要外部材料源时
/// 直接用各服务的构造函数自行装配。
pub struct Quizgen {
    pub db: Arc<Database>,
    pub llm: Arc<LLMManager>,
    pub generation: Arc<GenerationService>,
    pub review: Arc<ReviewService>,
}

impl Quizgen {
    pub fn open(data_dir: &Path, settings: AppSettings) -> Result<Self, AppError> {
        let db = Arc::new(
            Database::new(data_dir)
                .map_err(|e| AppError::database(format!("初始化数据库失败: {}", e)))?,
        );
        let llm = Arc::new(LLMManager::new(db.clone()));
        settings.bootstrap_providers(&llm)?;

        let review = Arc::new(ReviewService::new(
            db.clone(),
            settings.generation.screen_threshold,
        ));
        let generation = Arc::new(GenerationService::new(
            db.clone(),
            llm.clone(),
            Arc::new(DbMaterialStore::new(db.clone())),
            review.clone(),
            settings.generation.clone(),
        ));

        Ok(Self {
            db,
            llm,
            generation,
            review,
        })
    }
}
