//! LLM 调用管理
//!
//! 统一管理模型配置、HTTP 客户端与非流式补全调用。
//! 本层不做重试：单次调用失败原样返回 [`ProviderError`]，
//! 重试预算由编排器（generation_service）掌握。
//!
//! ## 活动配置与快照策略
//! “当前默认模型”是进程级可变状态（settings 表 `active_model` 键）。
//! 任务在创建时调用 [`LLMManager::active_config_snapshot`] 捕获一份配置
//! 快照并在整个生命周期内独占使用；`select_model` 只改写未来任务
//! 读到的默认值，不影响在途任务。

use async_trait::async_trait;
use reqwest::{header::HeaderMap, Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::database::Database;
use crate::models::AppError;
use crate::providers::{adapter_for, error_from_status, ProviderError};

const API_CONFIGS_KEY: &str = "api_configs";
const ACTIVE_MODEL_KEY: &str = "active_model";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub id: String,
    pub name: String,
    #[serde(alias = "api_key")]
    pub api_key: String,
    #[serde(alias = "base_url")]
    pub base_url: String,
    pub model: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_model_adapter", alias = "model_adapter")]
    pub model_adapter: String,
    #[serde(default = "default_max_output_tokens", alias = "max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// 单次调用超时（秒），独立于任务级墙钟预算
    #[serde(default = "default_timeout_secs", alias = "timeout_secs")]
    pub timeout_secs: u64,
}

// 默认值函数
fn default_enabled() -> bool {
    true
}

fn default_model_adapter() -> String {
    "general".to_string()
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    60
}

/// 默认模型选择（settings 表 `active_model`）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveModelSelection {
    pub config_id: Option<String>,
    /// 覆盖配置中的模型名（可选）
    pub model_override: Option<String>,
}

/// 供应商可用性
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderAvailability {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProviderAvailability {
    pub fn available() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// 一次补全调用的输入
#[derive(Debug, Clone, Default)]
pub struct PromptSpec {
    pub system: Option<String>,
    pub user: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

/// 补全调用接口（编排器与测试共同消费的缝）
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// 当前是否有可用的模型配置
    async fn is_available(&self) -> ProviderAvailability;

    /// 捕获当前默认配置的快照（任务创建时调用一次）
    async fn active_config(&self) -> Result<ApiConfig, AppError>;

    /// 执行一次非流式补全，返回模型文本
    async fn generate_completion(
        &self,
        config: &ApiConfig,
        prompt: &PromptSpec,
    ) -> Result<String, ProviderError>;
}

pub struct LLMManager {
    client: Client,
    db: Arc<Database>,
}

impl LLMManager {
    pub fn new(db: Arc<Database>) -> Self {
        let client = Self::create_http_client_with_fallback();
        Self { client, db }
    }

    /// 创建HTTP客户端，使用渐进式回退策略确保始终有合理的配置
    fn create_http_client_with_fallback() -> Client {
        // 显式禁用压缩，防止部分网关返回 gzip 数据导致乱码
        let mut headers = HeaderMap::new();
        if let Ok(v) = "identity".parse() {
            headers.insert("Accept-Encoding", v);
        }

        // 尝试1: 完整配置（rustls TLS + 连接超时）
        if let Ok(client) = ClientBuilder::new()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .use_rustls_tls()
            .default_headers(headers.clone())
            .build()
        {
            return client;
        }

        // 尝试2: 系统 TLS
        if let Ok(client) = ClientBuilder::new()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .default_headers(headers.clone())
            .build()
        {
            return client;
        }

        // 尝试3: 仅超时配置
        if let Ok(client) = ClientBuilder::new()
            .timeout(Duration::from_secs(180))
            .build()
        {
            return client;
        }

        warn!("[LLMManager] 所有客户端配置均失败，使用默认HTTP客户端（无超时配置）");
        Client::new()
    }

    // ========================================================================
    // 配置读写
    // ========================================================================

    pub fn get_api_configs(&self) -> Result<Vec<ApiConfig>, AppError> {
        let config_str = self
            .db
            .get_setting(API_CONFIGS_KEY)?
            .unwrap_or_else(|| "[]".to_string());

        serde_json::from_str::<Vec<ApiConfig>>(&config_str)
            .map_err(|e| AppError::configuration(format!("解析API配置失败: {}", e)))
    }

    pub fn save_api_configs(&self, configs: &[ApiConfig]) -> Result<(), AppError> {
        let serialized = serde_json::to_string(configs)
            .map_err(|e| AppError::configuration(format!("序列化API配置失败: {}", e)))?;
        self.db.set_setting(API_CONFIGS_KEY, &serialized)
    }

    fn get_active_selection(&self) -> Result<ActiveModelSelection, AppError> {
        match self.db.get_setting(ACTIVE_MODEL_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| AppError::configuration(format!("解析默认模型选择失败: {}", e))),
            None => Ok(ActiveModelSelection::default()),
        }
    }

    /// 切换默认模型（管理操作）
    ///
    /// 只影响此后创建的任务读到的快照；在途任务继续使用各自的快照。
    pub fn select_model(
        &self,
        config_id: &str,
        model_override: Option<&str>,
    ) -> Result<(), AppError> {
        let configs = self.get_api_configs()?;
        let target = configs
            .iter()
            .find(|c| c.id == config_id)
            .ok_or_else(|| AppError::not_found(format!("模型配置不存在: {}", config_id)))?;
        if !target.enabled {
            return Err(AppError::configuration(format!(
                "模型配置已禁用: {}",
                config_id
            )));
        }

        let selection = ActiveModelSelection {
            config_id: Some(config_id.to_string()),
            model_override: model_override.map(|s| s.to_string()),
        };
        let serialized = serde_json::to_string(&selection)
            .map_err(|e| AppError::configuration(format!("序列化默认模型选择失败: {}", e)))?;
        self.db.set_setting(ACTIVE_MODEL_KEY, &serialized)?;

        info!(
            "[LLMManager] 默认模型切换为 config_id={}, model_override={:?}（仅影响后续任务）",
            config_id, model_override
        );
        Ok(())
    }

    /// 解析当前默认配置并返回一份快照
    pub fn active_config_snapshot(&self) -> Result<ApiConfig, AppError> {
        let configs = self.get_api_configs()?;
        let selection = self.get_active_selection()?;

        let mut snapshot = match &selection.config_id {
            Some(id) => configs
                .iter()
                .find(|c| c.id == *id && c.enabled)
                .cloned()
                .or_else(|| configs.iter().find(|c| c.enabled).cloned()),
            None => configs.iter().find(|c| c.enabled).cloned(),
        }
        .ok_or_else(|| AppError::configuration("没有可用的模型配置"))?;

        if let Some(model) = &selection.model_override {
            snapshot.model = model.clone();
        }
        Ok(snapshot)
    }

    fn availability(&self) -> ProviderAvailability {
        let configs = match self.get_api_configs() {
            Ok(c) => c,
            Err(e) => return ProviderAvailability::unavailable(e.to_string()),
        };

        let enabled: Vec<&ApiConfig> = configs.iter().filter(|c| c.enabled).collect();
        if enabled.is_empty() {
            return ProviderAvailability::unavailable("未配置任何启用的模型");
        }

        match self.active_config_snapshot() {
            Ok(config) => {
                if config.api_key.trim().is_empty() {
                    ProviderAvailability::unavailable(format!("配置 {} 缺少API密钥", config.id))
                } else if config.base_url.trim().is_empty() {
                    ProviderAvailability::unavailable(format!("配置 {} 缺少接口地址", config.id))
                } else {
                    ProviderAvailability::available()
                }
            }
            Err(e) => ProviderAvailability::unavailable(e.to_string()),
        }
    }

    // ========================================================================
    // 补全调用
    // ========================================================================

    fn build_chat_body(config: &ApiConfig, prompt: &PromptSpec) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &prompt.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt.user}));

        json!({
            "model": config.model,
            "messages": messages,
            "temperature": prompt.temperature.unwrap_or(config.temperature),
            "max_tokens": prompt.max_output_tokens.unwrap_or(config.max_output_tokens),
            "stream": false
        })
    }

    async fn call_completion(
        &self,
        config: &ApiConfig,
        prompt: &PromptSpec,
    ) -> Result<String, ProviderError> {
        let adapter = adapter_for(&config.model_adapter);
        let body = Self::build_chat_body(config, prompt);
        let request = adapter.build_request(&config.base_url, &config.api_key, &config.model, &body)?;

        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request_future = builder.json(&request.body).send();

        // 单次调用硬超时，独立于任务级预算
        let response = match tokio::time::timeout(
            Duration::from_secs(config.timeout_secs),
            request_future,
        )
        .await
        {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                return Err(if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Network(e.to_string())
                })
            }
            Err(_) => return Err(ProviderError::Timeout),
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(error_from_status(status, &error_text));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(format!("读取响应失败: {}", e)))?;

        let response_json: Value = serde_json::from_str(&response_text)
            .map_err(|e| ProviderError::MalformedResponse(format!("响应非JSON: {}", e)))?;

        adapter.parse_response(&response_json)
    }
}

#[async_trait]
impl CompletionClient for LLMManager {
    async fn is_available(&self) -> ProviderAvailability {
        self.availability()
    }

    async fn active_config(&self) -> Result<ApiConfig, AppError> {
        self.active_config_snapshot()
    }

    async fn generate_completion(
        &self,
        config: &ApiConfig,
        prompt: &PromptSpec,
    ) -> Result<String, ProviderError> {
        self.call_completion(config, prompt).await
    }
}
