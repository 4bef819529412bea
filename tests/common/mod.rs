#![allow(dead_code)]
//! 集成测试共用工具：脚本化的模型客户端与服务装配

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use quizgen::repos::MaterialRepo;
use quizgen::{
    ApiConfig, AppError, CompletionClient, Database, DbMaterialStore, GenerationService,
    GenerationSettings, PromptSpec, ProviderAvailability, ProviderError, ReviewService,
    TaskStatusView,
};

/// 测试用模型配置（不会真正发起网络请求）
pub fn test_config() -> ApiConfig {
    ApiConfig {
        id: "cfg_test".to_string(),
        name: "测试模型".to_string(),
        api_key: "sk-test".to_string(),
        base_url: "https://api.example.com/v1".to_string(),
        model: "test-model".to_string(),
        enabled: true,
        model_adapter: "general".to_string(),
        max_output_tokens: 2048,
        temperature: 0.7,
        timeout_secs: 30,
    }
}

/// 按脚本依次返回响应的模型客户端；脚本耗尽后返回兜底响应
pub struct ScriptedClient {
    scripted: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Result<String, ProviderError>,
    pub calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(
        scripted: Vec<Result<String, ProviderError>>,
        fallback: Result<String, ProviderError>,
    ) -> Self {
        Self {
            scripted: Mutex::new(scripted.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    /// 每次调用都返回同一响应
    pub fn always(response: Result<String, ProviderError>) -> Self {
        Self::new(Vec::new(), response)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn is_available(&self) -> ProviderAvailability {
        ProviderAvailability::available()
    }

    async fn active_config(&self) -> Result<ApiConfig, AppError> {
        Ok(test_config())
    }

    async fn generate_completion(
        &self,
        _config: &ApiConfig,
        _prompt: &PromptSpec,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// 模拟未配置模型的环境
pub struct OfflineClient;

#[async_trait]
impl CompletionClient for OfflineClient {
    async fn is_available(&self) -> ProviderAvailability {
        ProviderAvailability::unavailable("未配置任何启用的模型")
    }

    async fn active_config(&self) -> Result<ApiConfig, AppError> {
        Err(AppError::configuration("未配置任何启用的模型"))
    }

    async fn generate_completion(
        &self,
        _config: &ApiConfig,
        _prompt: &PromptSpec,
    ) -> Result<String, ProviderError> {
        panic!("模型不可用时不应发起调用");
    }
}

/// 单选题的合规响应（自评分 85，结构完整）
pub fn good_single_choice_json() -> String {
    r#"{
        "stem": "根据材料，以下关于细胞膜的说法正确的是？",
        "options": [
            {"key": "A", "content": "细胞膜控制物质进出"},
            {"key": "B", "content": "细胞膜不含磷脂"},
            {"key": "C", "content": "细胞膜负责光合作用"},
            {"key": "D", "content": "细胞膜由纤维素构成"}
        ],
        "answer": "A",
        "analysis": {
            "material_excerpt": "材料指出细胞膜具有选择透过性。",
            "reasoning": "选择透过性意味着细胞膜控制物质进出。",
            "conclusion": "故选A。"
        },
        "quality_score": 85
    }"#
    .to_string()
}

/// 指定自评分的合规单选题响应
pub fn single_choice_json_with_score(score: i32) -> String {
    good_single_choice_json().replace(
        "\"quality_score\": 85",
        &format!("\"quality_score\": {}", score),
    )
}

/// 多选题响应，答案只给了一个字母（触发确定性修复）
pub fn multi_choice_single_letter_json() -> String {
    r#"{
        "stem": "根据材料，下列属于细胞器的有？（多选）",
        "options": [
            {"key": "A", "content": "线粒体"},
            {"key": "B", "content": "核糖体"},
            {"key": "C", "content": "血红蛋白"},
            {"key": "D", "content": "纤维素"}
        ],
        "answer": "C",
        "analysis": {
            "material_excerpt": "材料列举了线粒体与核糖体。",
            "reasoning": "线粒体和核糖体是细胞器，其余不是。",
            "conclusion": "故选AB。"
        },
        "quality_score": 90
    }"#
    .to_string()
}

/// 测试默认调参：并发 1 使槽位顺序确定
pub fn test_settings() -> GenerationSettings {
    GenerationSettings {
        accept_threshold: 60,
        screen_threshold: 70,
        max_attempts_per_slot: 3,
        max_slot_concurrency: 1,
        task_time_budget_secs: 600,
        max_requested_count: 50,
    }
}

pub struct TestHarness {
    pub dir: TempDir,
    pub db: Arc<Database>,
    pub generation: Arc<GenerationService>,
    pub review: Arc<ReviewService>,
    pub material_id: String,
}

/// 用给定客户端与调参装配一套服务
pub fn harness(client: Arc<dyn CompletionClient>, settings: GenerationSettings) -> TestHarness {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(dir.path()).unwrap());
    let material_id = MaterialRepo::insert_material(
        &db,
        Some("细胞学基础"),
        "细胞是生命活动的基本单位。细胞膜具有选择透过性，控制物质进出。\
         线粒体是有氧呼吸的主要场所，核糖体是蛋白质合成的场所。",
    )
    .unwrap();

    let review = Arc::new(ReviewService::new(db.clone(), settings.screen_threshold));
    let generation = Arc::new(GenerationService::new(
        db.clone(),
        client,
        Arc::new(DbMaterialStore::new(db.clone())),
        review.clone(),
        settings,
    ));

    TestHarness {
        dir,
        db,
        generation,
        review,
        material_id,
    }
}

/// 轮询任务直到进入终态
pub async fn wait_for_terminal(service: &GenerationService, task_id: &str) -> TaskStatusView {
    for _ in 0..500 {
        let view = service.get_task_status(task_id).unwrap();
        // 每次快照都必须满足 0 ≤ accepted ≤ requested
        assert!(view.progress.accepted <= view.progress.requested);
        if view.status.is_terminal() {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("任务 {} 未在限期内进入终态", task_id);
}
