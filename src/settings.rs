//! 配置加载
//!
//! 从 TOML 文件与环境变量（前缀 `QUIZGEN`）装配初始配置，供应商条目在
//! 首次运行时写入 settings 表；此后运行时配置以数据库为准。

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::llm_manager::{ApiConfig, LLMManager};
use crate::models::AppError;

/// 生成与审核环节的可调参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// 候选题接受阈值（quality_score 低于该值触发重试）
    pub accept_threshold: i32,
    /// 自动复审阈值
    pub screen_threshold: i32,
    /// 每个槽位的尝试上限（全局尝试预算 = requested × 本值）
    pub max_attempts_per_slot: u32,
    /// 单任务内槽位并发上限
    pub max_slot_concurrency: usize,
    /// 任务级墙钟预算（秒）
    pub task_time_budget_secs: u64,
    /// 单任务可请求的题目数上限
    pub max_requested_count: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            accept_threshold: 60,
            screen_threshold: 70,
            max_attempts_per_slot: 3,
            max_slot_concurrency: 3,
            task_time_budget_secs: 600,
            max_requested_count: 50,
        }
    }
}

/// 应用级配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 数据目录（缺省由调用方决定）
    pub data_dir: Option<String>,
    /// 初始供应商配置（仅首次运行时写入数据库）
    pub providers: Vec<ApiConfig>,
    pub generation: GenerationSettings,
}

impl AppSettings {
    /// 加载配置：`.env` -> TOML 文件 -> `QUIZGEN__*` 环境变量（后者覆盖前者）
    pub fn load(config_path: Option<&Path>) -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        builder = match config_path {
            Some(path) => builder.add_source(config::File::from(path).required(false)),
            None => builder.add_source(config::File::with_name("quizgen").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix("QUIZGEN")
                .separator("__")
                .try_parsing(true),
        );

        let loaded = builder
            .build()
            .map_err(|e| AppError::configuration(format!("加载配置失败: {}", e)))?;
        loaded
            .try_deserialize()
            .map_err(|e| AppError::configuration(format!("解析配置失败: {}", e)))
    }

    /// 首次运行时把文件里的供应商条目写入数据库（已有配置则不覆盖）
    pub fn bootstrap_providers(&self, llm: &LLMManager) -> Result<(), AppError> {
        if self.providers.is_empty() {
            return Ok(());
        }
        if llm.get_api_configs()?.is_empty() {
            llm.save_api_configs(&self.providers)?;
        }
        Ok(())
    }
}
