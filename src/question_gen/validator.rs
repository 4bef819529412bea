//! 候选题语法校验与确定性修复
//!
//! 每种题型有固定语法（选项数 + 答案模式）：
//!
//! | 题型 | 选项数 | 答案模式 |
//! |---|---|---|
//! | 单选 | 4 | `^[A-D]$` |
//! | 多选 | 4 | `^[A-D]{2,4}$` |
//! | 判断 | 2 | `^[AB]$` |
//!
//! 结构偏差按固定顺序修复（先选项数、后答案格式），每个修复动作
//! 都会留痕；没有修复规则的偏差返回 [`DraftError::Validation`]。
//! 修复是幂等的：对已修复的草稿重复校验不会产生新动作。

use jsonschema::JSONSchema;
use regex::Regex;
use serde_json::Value;
use std::ops::Deref;
use std::sync::LazyLock;

use super::types::{
    DraftError, DraftOutcome, QuestionDraft, QuestionOption, QuestionType, RepairAction,
    RepairKind,
};

/// 判断题标准选项对
pub const TRUE_FALSE_AFFIRMATIVE: &str = "正确";
pub const TRUE_FALSE_NEGATIVE: &str = "错误";

/// 补齐占位选项的内容前缀（复审阶段据此识别未完善的选项）
pub const PADDED_OPTION_PREFIX: &str = "待补充选项";

static RE_SINGLE_ANSWER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-D]$").expect("static regex"));
static RE_MULTI_ANSWER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-D]{2,4}$").expect("static regex"));
static RE_TRUE_FALSE_ANSWER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[AB]$").expect("static regex"));

// 候选题对象的最低结构要求（字段形态宽松，语法细节由修复流程处理）
static DRAFT_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    serde_json::json!({
        "type": "object",
        "properties": {
            "stem": { "type": "string", "minLength": 1 },
            "question": { "type": "string" },
            "content": { "type": "string" },
            "options": { "type": ["array", "object"] },
            "answer": { "type": ["string", "array", "boolean"] },
            "correct_answer": { "type": ["string", "array", "boolean"] },
            "analysis": { "type": ["object", "string", "null"] },
            "quality_score": { "type": ["integer", "number", "string", "null"] }
        },
        "anyOf": [
            { "required": ["stem", "options", "answer"] },
            { "required": ["stem", "options", "correct_answer"] },
            { "required": ["question", "options", "answer"] },
            { "required": ["content", "options", "answer"] }
        ],
        "additionalProperties": true
    })
});

/// 校验模型输出的JSON负载是否具备候选题的最低结构
pub fn validate_payload(data: &Value) -> Result<(), Vec<String>> {
    let compiled = JSONSchema::compile(DRAFT_SCHEMA.deref()).map_err(|e| vec![e.to_string()])?;
    let result = compiled.validate(data);
    if let Err(errors) = result {
        let msgs: Vec<String> = errors.map(|e| e.to_string()).collect();
        Err(msgs)
    } else {
        Ok(())
    }
}

/// 答案是否符合该题型的语法
pub fn answer_matches_grammar(question_type: QuestionType, answer: &str) -> bool {
    match question_type {
        QuestionType::SingleChoice => RE_SINGLE_ANSWER.is_match(answer),
        QuestionType::MultipleChoice => RE_MULTI_ANSWER.is_match(answer),
        QuestionType::TrueFalse => RE_TRUE_FALSE_ANSWER.is_match(answer),
    }
}

/// 对草稿执行语法校验 + 确定性修复
///
/// 修复顺序固定：先选项数量，再答案格式。
pub fn validate_draft(mut draft: QuestionDraft) -> Result<DraftOutcome, DraftError> {
    if draft.stem.trim().is_empty() {
        return Err(DraftError::Validation("题干为空".to_string()));
    }

    let mut actions: Vec<RepairAction> = Vec::new();

    repair_option_count(&mut draft, &mut actions)?;
    check_option_keys(&draft)?;
    repair_answer_format(&mut draft, &mut actions)?;

    draft.quality_score = draft.quality_score.clamp(0, 100);

    if actions.is_empty() {
        Ok(DraftOutcome::Valid(draft))
    } else {
        Ok(DraftOutcome::Repaired(draft, actions))
    }
}

// ============================================================================
// 选项数量修复
// ============================================================================

fn repair_option_count(
    draft: &mut QuestionDraft,
    actions: &mut Vec<RepairAction>,
) -> Result<(), DraftError> {
    let expected = draft.question_type.expected_option_count();
    let actual = draft.options.len();

    match draft.question_type {
        // 判断题：选项数不为 2 时坍缩为标准 {A: 正确, B: 错误}
        QuestionType::TrueFalse => {
            if actual != expected {
                let before = describe_options(&draft.options);
                draft.options = canonical_true_false_options();
                actions.push(RepairAction {
                    kind: RepairKind::OptionsCollapsed,
                    before,
                    after: describe_options(&draft.options),
                });
            }
        }
        // 选择题：恰好 2 个选项时补齐占位到 4 个，其余数量无修复规则
        QuestionType::SingleChoice | QuestionType::MultipleChoice => {
            if actual == expected {
                return Ok(());
            }
            if actual == 2 {
                let before = describe_options(&draft.options);
                for key in ["C", "D"] {
                    draft.options.push(QuestionOption {
                        key: key.to_string(),
                        content: format!("{}{}", PADDED_OPTION_PREFIX, key),
                    });
                }
                actions.push(RepairAction {
                    kind: RepairKind::OptionsPadded,
                    before,
                    after: describe_options(&draft.options),
                });
            } else {
                return Err(DraftError::Validation(format!(
                    "{}选项数为 {}，无修复规则",
                    draft.question_type.display_name(),
                    actual
                )));
            }
        }
    }

    Ok(())
}

pub(crate) fn canonical_true_false_options() -> Vec<QuestionOption> {
    vec![
        QuestionOption {
            key: "A".to_string(),
            content: TRUE_FALSE_AFFIRMATIVE.to_string(),
        },
        QuestionOption {
            key: "B".to_string(),
            content: TRUE_FALSE_NEGATIVE.to_string(),
        },
    ]
}

fn describe_options(options: &[QuestionOption]) -> String {
    options
        .iter()
        .map(|o| o.key.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

// 选项键必须是 A 起始的连续字母序列
fn check_option_keys(draft: &QuestionDraft) -> Result<(), DraftError> {
    let expected: &[&str] = match draft.options.len() {
        2 => &["A", "B"],
        4 => &["A", "B", "C", "D"],
        n => {
            return Err(DraftError::Validation(format!(
                "选项数 {} 不符合语法",
                n
            )))
        }
    };

    for (option, want) in draft.options.iter().zip(expected) {
        if option.key != *want {
            return Err(DraftError::Validation(format!(
                "选项键 {} 不符合语法（期望 {}）",
                option.key, want
            )));
        }
    }
    Ok(())
}

// ============================================================================
// 答案格式修复
// ============================================================================

/// 判断题肯定语义线索
const AFFIRMATIVE_CUES: [&str; 7] = ["正确", "对", "是", "√", "true", "yes", "t"];
/// 否定线索优先判定，防止“不正确”“不是”命中肯定线索
const NEGATIVE_CUES: [&str; 8] = ["不正确", "不对", "不是", "错", "否", "×", "false", "no"];

fn repair_answer_format(
    draft: &mut QuestionDraft,
    actions: &mut Vec<RepairAction>,
) -> Result<(), DraftError> {
    let original = draft.answer.trim().to_string();

    match draft.question_type {
        QuestionType::TrueFalse => {
            let upper = original.to_uppercase();
            if RE_TRUE_FALSE_ANSWER.is_match(&upper) {
                if upper != draft.answer {
                    draft.answer = upper;
                }
                return Ok(());
            }
            let lower = original.to_lowercase();
            let mapped = if NEGATIVE_CUES.iter().any(|cue| lower.contains(cue)) {
                "B"
            } else if AFFIRMATIVE_CUES.iter().any(|cue| lower.contains(cue)) {
                "A"
            } else {
                "B"
            };
            draft.answer = mapped.to_string();
            actions.push(RepairAction {
                kind: RepairKind::AnswerMapped,
                before: original,
                after: draft.answer.clone(),
            });
        }
        QuestionType::MultipleChoice => {
            let letters = extract_answer_letters(&original);
            match letters.len() {
                0 => {
                    return Err(DraftError::Validation(format!(
                        "多选题答案 '{}' 不含有效字母",
                        original
                    )))
                }
                1 => {
                    // 单字母答案补齐固定第二字母（启发式修复，入库后强制人工复核）
                    let first = letters[0];
                    let padding = if first == 'B' { 'A' } else { 'B' };
                    let mut pair = vec![first, padding];
                    pair.sort_unstable();
                    draft.answer = pair.into_iter().collect();
                    actions.push(RepairAction {
                        kind: RepairKind::AnswerPadded,
                        before: original,
                        after: draft.answer.clone(),
                    });
                }
                2..=4 => {
                    let normalized: String = letters.iter().collect();
                    draft.answer = normalized;
                }
                _ => {
                    return Err(DraftError::Validation(format!(
                        "多选题答案 '{}' 字母数超出语法",
                        original
                    )))
                }
            }
        }
        QuestionType::SingleChoice => {
            let letters = extract_answer_letters(&original);
            match letters.len() {
                0 => {
                    return Err(DraftError::Validation(format!(
                        "单选题答案 '{}' 不含有效字母",
                        original
                    )))
                }
                1 => {
                    draft.answer = letters[0].to_string();
                }
                _ => {
                    // 多字母截断为首字母（按原文出现顺序）
                    let first_letter = first_answer_letter(&original).unwrap_or(letters[0]);
                    draft.answer = first_letter.to_string();
                    actions.push(RepairAction {
                        kind: RepairKind::AnswerTruncated,
                        before: original,
                        after: draft.answer.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

// 提取答案中的 A-D 字母（去重、升序），分隔符与大小写不参与语法
fn extract_answer_letters(answer: &str) -> Vec<char> {
    let mut letters: Vec<char> = answer
        .to_uppercase()
        .chars()
        .filter(|c| ('A'..='D').contains(c))
        .collect();
    letters.sort_unstable();
    letters.dedup();
    letters
}

// 按出现顺序取第一个 A-D 字母
fn first_answer_letter(answer: &str) -> Option<char> {
    answer
        .to_uppercase()
        .chars()
        .find(|c| ('A'..='D').contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question_gen::types::AnswerAnalysis;

    fn draft(
        question_type: QuestionType,
        option_contents: &[&str],
        answer: &str,
    ) -> QuestionDraft {
        let keys = ["A", "B", "C", "D"];
        QuestionDraft {
            question_type,
            stem: "测试题干：材料中提到的核心概念是什么？".to_string(),
            options: option_contents
                .iter()
                .enumerate()
                .map(|(i, c)| QuestionOption {
                    key: keys[i].to_string(),
                    content: c.to_string(),
                })
                .collect(),
            answer: answer.to_string(),
            analysis: AnswerAnalysis::default(),
            quality_score: 80,
        }
    }

    #[test]
    fn test_valid_single_choice_untouched() {
        let outcome =
            validate_draft(draft(QuestionType::SingleChoice, &["甲", "乙", "丙", "丁"], "C"))
                .unwrap();
        assert!(matches!(outcome, DraftOutcome::Valid(_)));
        assert_eq!(outcome.draft().answer, "C");
    }

    #[test]
    fn test_true_false_collapse_on_wrong_count() {
        // 判断题给了 4 个选项 -> 坍缩为标准 {A, B}
        let outcome = validate_draft(draft(
            QuestionType::TrueFalse,
            &["对", "错", "不一定", "无法判断"],
            "A",
        ))
        .unwrap();
        let (d, actions) = outcome.into_parts();
        assert_eq!(d.options.len(), 2);
        assert_eq!(d.options[0].content, TRUE_FALSE_AFFIRMATIVE);
        assert_eq!(d.options[1].content, TRUE_FALSE_NEGATIVE);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, RepairKind::OptionsCollapsed);
    }

    #[test]
    fn test_true_false_answer_mapping() {
        let cases = [
            ("正确", "A"),
            ("对的", "A"),
            ("yes", "A"),
            ("错误", "B"),
            ("不正确", "B"),
            ("false", "B"),
            ("无法确定", "B"),
        ];
        for (raw, expected) in cases {
            let outcome =
                validate_draft(draft(QuestionType::TrueFalse, &["正确", "错误"], raw)).unwrap();
            let (d, actions) = outcome.into_parts();
            assert_eq!(d.answer, expected, "raw answer: {}", raw);
            assert_eq!(actions.len(), 1);
            assert_eq!(actions[0].kind, RepairKind::AnswerMapped);
        }
    }

    #[test]
    fn test_true_false_valid_answer_no_action() {
        let outcome =
            validate_draft(draft(QuestionType::TrueFalse, &["正确", "错误"], "B")).unwrap();
        assert!(matches!(outcome, DraftOutcome::Valid(_)));
    }

    #[test]
    fn test_choice_padding_from_two_options() {
        let outcome =
            validate_draft(draft(QuestionType::SingleChoice, &["甲", "乙"], "A")).unwrap();
        let (d, actions) = outcome.into_parts();
        assert_eq!(d.options.len(), 4);
        assert!(d.options[2].content.starts_with(PADDED_OPTION_PREFIX));
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, RepairKind::OptionsPadded);
    }

    #[test]
    fn test_choice_three_options_rejected() {
        let err =
            validate_draft(draft(QuestionType::SingleChoice, &["甲", "乙", "丙"], "A"))
                .unwrap_err();
        assert!(matches!(err, DraftError::Validation(_)));
    }

    #[test]
    fn test_multi_choice_single_letter_padded() {
        let outcome = validate_draft(draft(
            QuestionType::MultipleChoice,
            &["甲", "乙", "丙", "丁"],
            "C",
        ))
        .unwrap();
        let (d, actions) = outcome.into_parts();
        assert_eq!(d.answer, "BC");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, RepairKind::AnswerPadded);
        assert!(answer_matches_grammar(QuestionType::MultipleChoice, &d.answer));
    }

    #[test]
    fn test_multi_choice_padding_avoids_duplicate() {
        let outcome = validate_draft(draft(
            QuestionType::MultipleChoice,
            &["甲", "乙", "丙", "丁"],
            "B",
        ))
        .unwrap();
        assert_eq!(outcome.draft().answer, "AB");
    }

    #[test]
    fn test_multi_choice_separator_normalization() {
        let outcome = validate_draft(draft(
            QuestionType::MultipleChoice,
            &["甲", "乙", "丙", "丁"],
            "C, A",
        ))
        .unwrap();
        // 分隔符与顺序归一不算修复动作
        assert!(matches!(outcome, DraftOutcome::Valid(_)));
        assert_eq!(outcome.draft().answer, "AC");
    }

    #[test]
    fn test_single_choice_truncation() {
        let outcome = validate_draft(draft(
            QuestionType::SingleChoice,
            &["甲", "乙", "丙", "丁"],
            "BD",
        ))
        .unwrap();
        let (d, actions) = outcome.into_parts();
        assert_eq!(d.answer, "B");
        assert_eq!(actions[0].kind, RepairKind::AnswerTruncated);
    }

    #[test]
    fn test_answer_without_letters_rejected() {
        let err = validate_draft(draft(
            QuestionType::MultipleChoice,
            &["甲", "乙", "丙", "丁"],
            "以上都对",
        ))
        .unwrap_err();
        assert!(matches!(err, DraftError::Validation(_)));
    }

    #[test]
    fn test_repair_is_idempotent() {
        // 先触发两类修复，再对产物重跑校验，应零动作
        let first = validate_draft(draft(
            QuestionType::TrueFalse,
            &["对", "错", "不一定"],
            "答案是正确的",
        ))
        .unwrap();
        assert!(first.was_repaired());
        let (repaired, _) = first.into_parts();

        let second = validate_draft(repaired.clone()).unwrap();
        assert!(matches!(second, DraftOutcome::Valid(_)));
        assert_eq!(second.draft(), &repaired);

        let padded = validate_draft(draft(QuestionType::MultipleChoice, &["甲", "乙"], "A"))
            .unwrap();
        let (padded_draft, _) = padded.into_parts();
        let rerun = validate_draft(padded_draft.clone()).unwrap();
        assert!(matches!(rerun, DraftOutcome::Valid(_)));
    }

    #[test]
    fn test_payload_schema() {
        let ok = serde_json::json!({
            "stem": "题干",
            "options": ["a", "b"],
            "answer": "A"
        });
        assert!(validate_payload(&ok).is_ok());

        let missing_answer = serde_json::json!({
            "stem": "题干",
            "options": ["a", "b"]
        });
        assert!(validate_payload(&missing_answer).is_err());
    }
}
