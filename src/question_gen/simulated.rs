//! 模拟出题生成器（无可用模型配置时的兜底）
//!
//! 生成确定性的占位题目，保证调用方不会因缺少 AI 配置而被阻塞。
//! 产出的题目全部打上 simulated 标记，语法与真实题目一致。

use crate::question_gen::types::{
    AnswerAnalysis, Difficulty, QuestionDraft, QuestionOption, QuestionType,
};
use crate::question_gen::validator::canonical_true_false_options;

/// 模拟题目的固定质量分（高于接受阈值，低于满分以便辨识）
pub const SIMULATED_QUALITY_SCORE: i32 = 80;

/// 为指定槽位生成一道确定性的模拟题
pub fn simulated_draft(
    slot_index: usize,
    question_type: QuestionType,
    difficulty: Difficulty,
    knowledge_points: &[String],
    material: &str,
) -> QuestionDraft {
    let topic = knowledge_points
        .get(slot_index % knowledge_points.len().max(1))
        .map(|s| s.as_str())
        .unwrap_or("本材料核心内容");

    let excerpt: String = material.trim().chars().take(60).collect();

    let (options, answer, stem) = match question_type {
        QuestionType::TrueFalse => (
            canonical_true_false_options(),
            "A".to_string(),
            format!(
                "[模拟题 {}] 判断：材料中与“{}”相关的表述是成立的。",
                slot_index + 1,
                topic
            ),
        ),
        QuestionType::SingleChoice => (
            simulated_choice_options(topic),
            "A".to_string(),
            format!(
                "[模拟题 {}] 关于“{}”，下列说法正确的是？",
                slot_index + 1,
                topic
            ),
        ),
        QuestionType::MultipleChoice => (
            simulated_choice_options(topic),
            "AB".to_string(),
            format!(
                "[模拟题 {}] 关于“{}”，下列说法正确的有？（多选）",
                slot_index + 1,
                topic
            ),
        ),
    };

    QuestionDraft {
        question_type,
        stem,
        options,
        answer,
        analysis: AnswerAnalysis {
            material_excerpt: excerpt,
            reasoning: format!(
                "此题为模拟生成（难度：{}），用于在模型服务不可用时保持流程可用。",
                difficulty.display_name()
            ),
            conclusion: "模拟题目，请在接入模型服务后重新生成。".to_string(),
        },
        quality_score: SIMULATED_QUALITY_SCORE,
    }
}

fn simulated_choice_options(topic: &str) -> Vec<QuestionOption> {
    let contents = [
        format!("材料对“{}”的说明与原文一致", topic),
        format!("材料对“{}”的说明与原文部分一致", topic),
        format!("材料未涉及“{}”", topic),
        format!("材料对“{}”的说明与原文相反", topic),
    ];
    ["A", "B", "C", "D"]
        .iter()
        .zip(contents)
        .map(|(key, content)| QuestionOption {
            key: key.to_string(),
            content,
        })
        .collect()
}
