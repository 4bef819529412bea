//! 模型响应解析工具集
//!
//! 把模型返回的任意文本收敛成一个候选题 JSON 对象，再映射为
//! [`QuestionDraft`]。纯函数模块，不依赖任何服务结构体。

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::debug;

use super::types::{
    AnswerAnalysis, DraftError, QuestionDraft, QuestionOption, QuestionType,
};
use super::validator;

static RE_CODE_FENCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*```[\w-]*\s*$").expect("static regex"));
static RE_TILDE_FENCE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*~~~[\w-]*\s*$").expect("static regex"));
static RE_BACKTICK_INLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)```").expect("static regex"));

/// 缺省质量分（模型未自评时取中性值，交由接受阈值与复审把关）
const DEFAULT_QUALITY_SCORE: i32 = 60;

// 清理模型响应中的包装文本
pub(crate) fn clean_model_response(content: &str) -> String {
    let mut cleaned = content.trim().to_string();

    // 移除markdown代码块及常见围栏
    cleaned = RE_CODE_FENCE_LINE.replace_all(&cleaned, "").to_string();
    cleaned = RE_TILDE_FENCE_LINE.replace_all(&cleaned, "").to_string();
    cleaned = RE_BACKTICK_INLINE.replace_all(&cleaned, "").to_string();

    // 移除常见前缀
    let prefixes = [
        "以下是JSON格式的结果：",
        "JSON结果：",
        "结果：",
        "题目如下：",
        "生成的题目：",
        "Here is the JSON:",
        "JSON:",
        "Output:",
    ];
    let mut trimmed = cleaned.trim();
    for prefix in &prefixes {
        if trimmed.starts_with(prefix) {
            trimmed = trimmed.strip_prefix(prefix).unwrap_or(trimmed).trim();
        }
    }

    trimmed.to_string()
}

// 从文本中提取第一个配平的JSON对象
pub(crate) fn extract_json_from_text(text: &str) -> Option<String> {
    let mut brace_depth = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut start_pos = None;

    for (i, ch) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                if brace_depth == 0 {
                    start_pos = Some(i);
                }
                brace_depth += 1;
            }
            '}' if !in_string => {
                if brace_depth > 0 {
                    brace_depth -= 1;
                    if brace_depth == 0 {
                        let start = start_pos?;
                        return Some(text[start..i + ch.len_utf8()].to_string());
                    }
                }
            }
            _ => {}
        }
    }

    None
}

// 修复常见的JSON错误（尾随逗号等）
pub(crate) fn fix_common_json_errors(json_str: &str) -> String {
    let mut fixed = json_str.to_string();

    // 尾随逗号
    fixed = fixed.replace(",}", "}");
    fixed = fixed.replace(",]", "]");
    fixed = fixed.replace(", }", "}");
    fixed = fixed.replace(", ]", "]");

    // 全角引号/冒号（部分模型在中文语境下混用）
    fixed = fixed.replace('＂', "\"");
    fixed = fixed.replace('：', ":");

    fixed
}

/// 把原始模型文本解析为候选题草稿
///
/// 题型以任务请求的槽位题型为准（`declared_type`），模型自报的 type 字段
/// 仅作记录，不参与判定。失败返回 [`DraftError::Parse`]。
pub fn parse_draft(
    raw_text: &str,
    declared_type: QuestionType,
) -> Result<QuestionDraft, DraftError> {
    let cleaned = clean_model_response(raw_text);
    if cleaned.is_empty() {
        return Err(DraftError::Parse("模型响应为空".to_string()));
    }

    let value = decode_json_payload(&cleaned)?;

    validator::validate_payload(&value)
        .map_err(|errs| DraftError::Parse(format!("候选题结构不完整: {}", errs.join("; "))))?;

    let stem = extract_stem(&value)
        .ok_or_else(|| DraftError::Parse("缺少题干字段".to_string()))?;
    let options = extract_options(&value)
        .ok_or_else(|| DraftError::Parse("选项字段无法解析".to_string()))?;
    let answer = extract_answer(&value)
        .ok_or_else(|| DraftError::Parse("答案字段无法解析".to_string()))?;

    Ok(QuestionDraft {
        question_type: declared_type,
        stem,
        options,
        answer,
        analysis: extract_analysis(&value),
        quality_score: extract_quality_score(&value),
    })
}

fn decode_json_payload(cleaned: &str) -> Result<Value, DraftError> {
    if let Ok(v) = serde_json::from_str::<Value>(cleaned) {
        if v.is_object() {
            return Ok(v);
        }
    }

    if let Some(candidate) = extract_json_from_text(cleaned) {
        if let Ok(v) = serde_json::from_str::<Value>(&candidate) {
            return Ok(v);
        }
        let fixed = fix_common_json_errors(&candidate);
        if let Ok(v) = serde_json::from_str::<Value>(&fixed) {
            debug!("[Parser] 经容错修正后解析成功");
            return Ok(v);
        }
    }

    let fixed = fix_common_json_errors(cleaned);
    serde_json::from_str::<Value>(&fixed)
        .ok()
        .filter(|v| v.is_object())
        .ok_or_else(|| DraftError::Parse("响应不是合法的JSON对象".to_string()))
}

fn extract_stem(value: &Value) -> Option<String> {
    for key in ["stem", "question", "content", "题干"] {
        if let Some(s) = value.get(key).and_then(|v| v.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

const OPTION_KEYS: [&str; 4] = ["A", "B", "C", "D"];

fn extract_options(value: &Value) -> Option<Vec<QuestionOption>> {
    let raw = value.get("options").or_else(|| value.get("选项"))?;

    match raw {
        // [{"key": "A", "content": "..."}] 或 [{"label": "A", "text": "..."}]
        Value::Array(items) => {
            let mut options = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                let fallback_key = OPTION_KEYS.get(i).copied().unwrap_or("?");
                match item {
                    Value::Object(obj) => {
                        let key = obj
                            .get("key")
                            .or_else(|| obj.get("label"))
                            .and_then(|v| v.as_str())
                            .map(|s| s.trim().to_uppercase())
                            .filter(|s| !s.is_empty())
                            .unwrap_or_else(|| fallback_key.to_string());
                        let content = obj
                            .get("content")
                            .or_else(|| obj.get("text"))
                            .or_else(|| obj.get("value"))
                            .and_then(|v| v.as_str())?
                            .trim()
                            .to_string();
                        options.push(QuestionOption { key, content });
                    }
                    // ["选项甲", "选项乙"] 按位置赋予字母键
                    Value::String(s) => options.push(QuestionOption {
                        key: fallback_key.to_string(),
                        content: strip_leading_label(s.trim()),
                    }),
                    _ => return None,
                }
            }
            if options.is_empty() {
                None
            } else {
                Some(options)
            }
        }
        // {"A": "...", "B": "..."}
        Value::Object(map) => {
            let mut options: Vec<QuestionOption> = map
                .iter()
                .filter_map(|(k, v)| {
                    v.as_str().map(|s| QuestionOption {
                        key: k.trim().to_uppercase(),
                        content: s.trim().to_string(),
                    })
                })
                .collect();
            options.sort_by(|a, b| a.key.cmp(&b.key));
            if options.is_empty() {
                None
            } else {
                Some(options)
            }
        }
        _ => None,
    }
}

// 去掉选项文本自带的 "A." / "B、" 前缀，避免与键重复
fn strip_leading_label(content: &str) -> String {
    static RE_LABEL: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[A-Da-d][\.、:：)）]\s*").expect("static regex"));
    RE_LABEL.replace(content, "").to_string()
}

fn extract_answer(value: &Value) -> Option<String> {
    let raw = value
        .get("answer")
        .or_else(|| value.get("correct_answer"))
        .or_else(|| value.get("答案"))?;

    match raw {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        // ["A", "C"] -> "AC"
        Value::Array(items) => {
            let joined: String = items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_uppercase())
                .collect::<Vec<_>>()
                .join("");
            if joined.is_empty() {
                None
            } else {
                Some(joined)
            }
        }
        Value::Bool(b) => Some(if *b { "A".to_string() } else { "B".to_string() }),
        _ => None,
    }
}

fn extract_analysis(value: &Value) -> AnswerAnalysis {
    let raw = value
        .get("analysis")
        .or_else(|| value.get("explanation"))
        .or_else(|| value.get("解析"));

    match raw {
        Some(Value::Object(obj)) => {
            let pick = |keys: &[&str]| -> String {
                keys.iter()
                    .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
                    .unwrap_or("")
                    .trim()
                    .to_string()
            };
            AnswerAnalysis {
                material_excerpt: pick(&["material_excerpt", "source", "出处"]),
                reasoning: pick(&["reasoning", "process", "推理"]),
                conclusion: pick(&["conclusion", "summary", "结论"]),
            }
        }
        // 纯文本解析整体归入推理段
        Some(Value::String(s)) => AnswerAnalysis {
            material_excerpt: String::new(),
            reasoning: s.trim().to_string(),
            conclusion: String::new(),
        },
        _ => AnswerAnalysis::default(),
    }
}

fn extract_quality_score(value: &Value) -> i32 {
    value
        .get("quality_score")
        .or_else(|| value.get("score"))
        .and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f.round() as i64))
                .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
        })
        .map(|n| n.clamp(0, 100) as i32)
        .unwrap_or(DEFAULT_QUALITY_SCORE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = r#"{
        "stem": "以下哪项是光合作用的产物？",
        "options": [
            {"key": "A", "content": "氧气"},
            {"key": "B", "content": "二氧化碳"},
            {"key": "C", "content": "氮气"},
            {"key": "D", "content": "甲烷"}
        ],
        "answer": "A",
        "analysis": {
            "material_excerpt": "材料第二段指出……",
            "reasoning": "光合作用将二氧化碳和水转化为葡萄糖并释放氧气。",
            "conclusion": "故选A。"
        },
        "quality_score": 88
    }"#;

    #[test]
    fn test_parse_well_formed() {
        let draft = parse_draft(WELL_FORMED, QuestionType::SingleChoice).unwrap();
        assert_eq!(draft.stem, "以下哪项是光合作用的产物？");
        assert_eq!(draft.options.len(), 4);
        assert_eq!(draft.answer, "A");
        assert_eq!(draft.quality_score, 88);
        assert_eq!(draft.analysis.conclusion, "故选A。");
    }

    #[test]
    fn test_parse_fenced_with_prefix() {
        let text = format!("以下是JSON格式的结果：\n```json\n{}\n```", WELL_FORMED);
        let draft = parse_draft(&text, QuestionType::SingleChoice).unwrap();
        assert_eq!(draft.options.len(), 4);
    }

    #[test]
    fn test_parse_embedded_in_prose() {
        let text = format!("好的，题目如下。{}希望符合要求。", WELL_FORMED);
        assert!(parse_draft(&text, QuestionType::SingleChoice).is_ok());
    }

    #[test]
    fn test_parse_trailing_comma() {
        let text = r#"{"stem": "1+1=2", "options": ["正确", "错误",], "answer": "A",}"#;
        let draft = parse_draft(text, QuestionType::TrueFalse).unwrap();
        assert_eq!(draft.options[0].key, "A");
        assert_eq!(draft.options[1].content, "错误");
    }

    #[test]
    fn test_parse_option_map_and_answer_array() {
        let text = r#"{
            "stem": "以下哪些属于哺乳动物？",
            "options": {"A": "鲸", "B": "鲨鱼", "C": "蝙蝠", "D": "企鹅"},
            "answer": ["A", "C"]
        }"#;
        let draft = parse_draft(text, QuestionType::MultipleChoice).unwrap();
        assert_eq!(draft.answer, "AC");
        assert_eq!(draft.options[0].content, "鲸");
        // 未给质量分时回落到中性值
        assert_eq!(draft.quality_score, 60);
    }

    #[test]
    fn test_parse_strips_option_labels() {
        let text = r#"{
            "stem": "判断：水在标准大气压下100摄氏度沸腾。",
            "options": ["A. 正确", "B、错误"],
            "answer": "A"
        }"#;
        let draft = parse_draft(text, QuestionType::TrueFalse).unwrap();
        assert_eq!(draft.options[0].content, "正确");
        assert_eq!(draft.options[1].content, "错误");
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(
            parse_draft("", QuestionType::SingleChoice),
            Err(DraftError::Parse(_))
        ));
        assert!(matches!(
            parse_draft("模型今天不想干活", QuestionType::SingleChoice),
            Err(DraftError::Parse(_))
        ));
        // 缺答案字段
        let text = r#"{"stem": "x", "options": ["a", "b"]}"#;
        assert!(matches!(
            parse_draft(text, QuestionType::TrueFalse),
            Err(DraftError::Parse(_))
        ));
    }

    #[test]
    fn test_extract_json_skips_braces_in_strings() {
        let text = r#"前言 {"stem": "集合{1,2}的子集个数", "options": ["3","4"], "answer": "B"} 后记"#;
        let extracted = extract_json_from_text(text).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&extracted).is_ok());
    }
}
