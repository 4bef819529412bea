//! 出题域数据类型
//!
//! 题型/难度枚举、候选题草稿、修复动作记录。
//! 字符串映射遵循 `as_str` / `from_str` 配对，供数据库存取使用。

use serde::{Deserialize, Serialize};

/// 题型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    SingleChoice,
    MultipleChoice,
    TrueFalse,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::SingleChoice => "single_choice",
            QuestionType::MultipleChoice => "multiple_choice",
            QuestionType::TrueFalse => "true_false",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "single_choice" => Some(QuestionType::SingleChoice),
            "multiple_choice" => Some(QuestionType::MultipleChoice),
            "true_false" => Some(QuestionType::TrueFalse),
            _ => None,
        }
    }

    /// 中文展示名（用于 Prompt 与模拟生成）
    pub fn display_name(&self) -> &'static str {
        match self {
            QuestionType::SingleChoice => "单选题",
            QuestionType::MultipleChoice => "多选题",
            QuestionType::TrueFalse => "判断题",
        }
    }

    /// 该题型语法要求的选项数
    pub fn expected_option_count(&self) -> usize {
        match self {
            QuestionType::SingleChoice | QuestionType::MultipleChoice => 4,
            QuestionType::TrueFalse => 2,
        }
    }
}

/// 难度
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "easy" => Difficulty::Easy,
            "medium" => Difficulty::Medium,
            "hard" => Difficulty::Hard,
            _ => Difficulty::Medium,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Difficulty::Easy => "简单",
            Difficulty::Medium => "中等",
            Difficulty::Hard => "困难",
        }
    }
}

/// 选项
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionOption {
    pub key: String,
    pub content: String,
}

/// 三段式解析（材料出处 / 推理过程 / 结论）
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnswerAnalysis {
    #[serde(default)]
    pub material_excerpt: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub conclusion: String,
}

/// 候选题草稿（模型原始输出解析后的结构化形态，尚未入库）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionDraft {
    pub question_type: QuestionType,
    pub stem: String,
    pub options: Vec<QuestionOption>,
    pub answer: String,
    pub analysis: AnswerAnalysis,
    /// 模型自评质量分（0-100，入库前作为接受阈值依据）
    pub quality_score: i32,
}

// ============================================================================
// 修复动作
// ============================================================================

/// 确定性修复的类别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    /// 判断题选项坍缩为标准 {A: 正确, B: 错误}
    OptionsCollapsed,
    /// 选择题补齐占位选项到 4 个
    OptionsPadded,
    /// 判断题答案按肯定/否定语义映射到 A/B
    AnswerMapped,
    /// 多选题单字母答案补齐固定第二字母
    AnswerPadded,
    /// 单选题多字母答案截断为首字母
    AnswerTruncated,
}

impl RepairKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairKind::OptionsCollapsed => "options_collapsed",
            RepairKind::OptionsPadded => "options_padded",
            RepairKind::AnswerMapped => "answer_mapped",
            RepairKind::AnswerPadded => "answer_padded",
            RepairKind::AnswerTruncated => "answer_truncated",
        }
    }
}

/// 一次修复动作的留痕记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairAction {
    pub kind: RepairKind,
    pub before: String,
    pub after: String,
}

// ============================================================================
// 解析/校验结果
// ============================================================================

/// 候选题处理失败
#[derive(Debug, Clone, PartialEq)]
pub enum DraftError {
    /// 文本无法解析为结构化候选题
    Parse(String),
    /// 结构偏差没有对应的修复规则
    Validation(String),
}

impl std::fmt::Display for DraftError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DraftError::Parse(msg) => write!(f, "解析失败: {}", msg),
            DraftError::Validation(msg) => write!(f, "校验失败: {}", msg),
        }
    }
}

impl std::error::Error for DraftError {}

/// 校验通过的两种形态
#[derive(Debug, Clone, PartialEq)]
pub enum DraftOutcome {
    /// 原样符合语法
    Valid(QuestionDraft),
    /// 经确定性修复后符合语法（附修复留痕）
    Repaired(QuestionDraft, Vec<RepairAction>),
}

impl DraftOutcome {
    pub fn draft(&self) -> &QuestionDraft {
        match self {
            DraftOutcome::Valid(d) => d,
            DraftOutcome::Repaired(d, _) => d,
        }
    }

    pub fn into_parts(self) -> (QuestionDraft, Vec<RepairAction>) {
        match self {
            DraftOutcome::Valid(d) => (d, Vec::new()),
            DraftOutcome::Repaired(d, actions) => (d, actions),
        }
    }

    pub fn was_repaired(&self) -> bool {
        matches!(self, DraftOutcome::Repaired(_, _))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_type_roundtrip() {
        for t in [
            QuestionType::SingleChoice,
            QuestionType::MultipleChoice,
            QuestionType::TrueFalse,
        ] {
            assert_eq!(QuestionType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(QuestionType::from_str("essay"), None);
    }

    #[test]
    fn test_expected_option_count() {
        assert_eq!(QuestionType::SingleChoice.expected_option_count(), 4);
        assert_eq!(QuestionType::MultipleChoice.expected_option_count(), 4);
        assert_eq!(QuestionType::TrueFalse.expected_option_count(), 2);
    }

    #[test]
    fn test_outcome_parts() {
        let draft = QuestionDraft {
            question_type: QuestionType::TrueFalse,
            stem: "地球绕太阳公转。".to_string(),
            options: vec![
                QuestionOption {
                    key: "A".to_string(),
                    content: "正确".to_string(),
                },
                QuestionOption {
                    key: "B".to_string(),
                    content: "错误".to_string(),
                },
            ],
            answer: "A".to_string(),
            analysis: AnswerAnalysis::default(),
            quality_score: 90,
        };

        let outcome = DraftOutcome::Valid(draft.clone());
        assert!(!outcome.was_repaired());
        let (d, actions) = outcome.into_parts();
        assert_eq!(d, draft);
        assert!(actions.is_empty());
    }
}
