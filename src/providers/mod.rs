//! 模型供应商适配层
//!
//! 把不同供应商（OpenAI 兼容、Gemini、Anthropic）的请求构造与响应解析
//! 收敛到 `ProviderAdapter` 接口后面。新增后端只需注册一个实现，
//! 不在调用路径里加分支。
//!
//! 适配层自身不做重试，重试策略属于编排器。

use serde_json::{json, Value};

// ============================================================================
// 错误类型
// ============================================================================

/// 供应商调用错误（按失败类别打标签）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// 401/403，密钥无效或无权限
    Unauthorized,
    /// 429，触发限流
    RateLimited,
    /// 单次调用超时
    Timeout,
    /// 网络/传输层错误
    Network(String),
    /// 响应无法按该供应商的格式解析
    MalformedResponse(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Unauthorized => write!(f, "供应商鉴权失败（401/403）"),
            ProviderError::RateLimited => write!(f, "供应商限流（429）"),
            ProviderError::Timeout => write!(f, "供应商调用超时"),
            ProviderError::Network(msg) => write!(f, "网络错误: {}", msg),
            ProviderError::MalformedResponse(msg) => write!(f, "响应格式异常: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

/// 按 HTTP 状态码归类错误
pub fn error_from_status(status: u16, body: &str) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Unauthorized,
        429 => ProviderError::RateLimited,
        408 | 504 => ProviderError::Timeout,
        _ => ProviderError::Network(format!("HTTP {}: {}", status, truncate(body, 200))),
    }
}

fn truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        s
    } else {
        let mut end = max_bytes;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

// ============================================================================
// 适配器接口
// ============================================================================

/// 已构造好的供应商请求
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// 供应商适配器
///
/// `body` 统一采用 Chat Completions 兼容格式
/// （`{model, messages, temperature, max_tokens}`），由适配器转换成各家的
/// 实际请求，并把响应解析回纯文本。
pub trait ProviderAdapter: Send + Sync {
    /// 配置键（`ApiConfig.model_adapter` 用它选择适配器）
    fn key(&self) -> &'static str;

    /// 配置键别名
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    fn build_request(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        body: &Value,
    ) -> Result<ProviderRequest, ProviderError>;

    /// 从非流式响应中取出文本内容
    fn parse_response(&self, response: &Value) -> Result<String, ProviderError>;
}

/// 适配器注册表。按配置键（或别名）查找，未命中时回退到 OpenAI 兼容格式。
pub fn adapter_for(key: &str) -> &'static dyn ProviderAdapter {
    static REGISTRY: &[&dyn ProviderAdapter] =
        &[&OpenAIAdapter, &GeminiAdapter, &AnthropicAdapter];

    let normalized = key.trim().to_lowercase();
    REGISTRY
        .iter()
        .find(|a| a.key() == normalized || a.aliases().contains(&normalized.as_str()))
        .copied()
        .unwrap_or(&OpenAIAdapter)
}

// ============================================================================
// OpenAI 兼容适配器
// ============================================================================

pub struct OpenAIAdapter;

impl ProviderAdapter for OpenAIAdapter {
    fn key(&self) -> &'static str {
        "general"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["openai", "deepseek", "siliconflow"]
    }

    fn build_request(
        &self,
        base_url: &str,
        api_key: &str,
        _model: &str,
        body: &Value,
    ) -> Result<ProviderRequest, ProviderError> {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let trimmed_key = api_key.trim();

        Ok(ProviderRequest {
            url,
            headers: vec![
                (
                    "Authorization".to_string(),
                    format!("Bearer {}", trimmed_key),
                ),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: body.clone(),
        })
    }

    fn parse_response(&self, response: &Value) -> Result<String, ProviderError> {
        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::MalformedResponse(
                    "choices[0].message.content 缺失或非字符串".to_string(),
                )
            })?;
        Ok(content.to_string())
    }
}

// ============================================================================
// Gemini 适配器
// ============================================================================

pub struct GeminiAdapter;

impl GeminiAdapter {
    /// Chat Completions 兼容格式 -> Gemini generateContent 请求
    fn convert_to_gemini_format(body: &Value) -> Value {
        let mut contents: Vec<Value> = Vec::new();
        let mut system_parts: Vec<String> = Vec::new();

        if let Some(messages) = body.get("messages").and_then(|v| v.as_array()) {
            for message in messages {
                let role = message
                    .get("role")
                    .and_then(|v| v.as_str())
                    .unwrap_or("user");
                let text = message
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if text.trim().is_empty() {
                    continue;
                }

                match role {
                    "system" => system_parts.push(text.to_string()),
                    "assistant" => contents.push(json!({
                        "role": "model",
                        "parts": [{"text": text}]
                    })),
                    _ => contents.push(json!({
                        "role": "user",
                        "parts": [{"text": text}]
                    })),
                }
            }
        }

        if contents.is_empty() {
            contents.push(json!({"role": "user", "parts": [{"text": ""}]}));
        }

        let mut payload = json!({ "contents": contents });

        if !system_parts.is_empty() {
            payload["systemInstruction"] = json!({
                "parts": [{"text": system_parts.join("\n\n")}]
            });
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(t) = body.get("temperature") {
            generation_config.insert("temperature".to_string(), t.clone());
        }
        if let Some(m) = body.get("max_tokens") {
            generation_config.insert("maxOutputTokens".to_string(), m.clone());
        }
        if !generation_config.is_empty() {
            payload["generationConfig"] = Value::Object(generation_config);
        }

        payload
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn key(&self) -> &'static str {
        "google"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["gemini"]
    }

    fn build_request(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        body: &Value,
    ) -> Result<ProviderRequest, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            base_url.trim_end_matches('/'),
            model
        );

        Ok(ProviderRequest {
            url,
            headers: vec![
                ("x-goog-api-key".to_string(), api_key.trim().to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: Self::convert_to_gemini_format(body),
        })
    }

    fn parse_response(&self, response: &Value) -> Result<String, ProviderError> {
        let parts = response["candidates"][0]["content"]["parts"]
            .as_array()
            .ok_or_else(|| {
                ProviderError::MalformedResponse(
                    "candidates[0].content.parts 缺失".to_string(),
                )
            })?;

        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "Gemini 响应无文本内容".to_string(),
            ));
        }
        Ok(text)
    }
}

// ============================================================================
// Anthropic 适配器
// ============================================================================

pub struct AnthropicAdapter;

impl AnthropicAdapter {
    fn convert_to_anthropic_format(model: &str, body: &Value) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        let mut system_parts: Vec<String> = Vec::new();

        if let Some(msgs) = body.get("messages").and_then(|v| v.as_array()) {
            for message in msgs {
                let role = message
                    .get("role")
                    .and_then(|v| v.as_str())
                    .unwrap_or("user");
                let text = message
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if text.trim().is_empty() {
                    continue;
                }
                if role == "system" {
                    system_parts.push(text.to_string());
                } else {
                    messages.push(json!({"role": role, "content": text}));
                }
            }
        }

        let max_tokens = body
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(4096);

        let mut payload = json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": messages,
        });
        if !system_parts.is_empty() {
            payload["system"] = json!(system_parts.join("\n\n"));
        }
        if let Some(t) = body.get("temperature") {
            payload["temperature"] = t.clone();
        }
        payload
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn key(&self) -> &'static str {
        "anthropic"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["claude"]
    }

    fn build_request(
        &self,
        base_url: &str,
        api_key: &str,
        model: &str,
        body: &Value,
    ) -> Result<ProviderRequest, ProviderError> {
        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));

        Ok(ProviderRequest {
            url,
            headers: vec![
                ("x-api-key".to_string(), api_key.trim().to_string()),
                ("anthropic-version".to_string(), "2023-06-01".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: Self::convert_to_anthropic_format(model, body),
        })
    }

    fn parse_response(&self, response: &Value) -> Result<String, ProviderError> {
        let blocks = response["content"].as_array().ok_or_else(|| {
            ProviderError::MalformedResponse("content 数组缺失".to_string())
        })?;

        let text: String = blocks
            .iter()
            .filter(|b| b.get("type").and_then(|v| v.as_str()) == Some("text"))
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "Anthropic 响应无文本块".to_string(),
            ));
        }
        Ok(text)
    }
}
