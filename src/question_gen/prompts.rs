//! 出题 Prompt 构造
//!
//! 统一约束模型输出为候选题 JSON 对象，解析侧（parser/validator）
//! 对偏差再做容错与修复。

use crate::llm_manager::PromptSpec;
use crate::question_gen::types::{Difficulty, QuestionType};

/// 材料摘录注入上限（字符数）
pub const MATERIAL_EXCERPT_MAX_CHARS: usize = 6000;

/// 按字符数安全截取材料文本
pub fn material_excerpt(material_text: &str) -> String {
    let trimmed = material_text.trim();
    if trimmed.chars().count() <= MATERIAL_EXCERPT_MAX_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MATERIAL_EXCERPT_MAX_CHARS).collect();
        format!("{}……", cut)
    }
}

fn option_requirement(question_type: QuestionType) -> &'static str {
    match question_type {
        QuestionType::SingleChoice => {
            "必须提供恰好4个选项（键为A、B、C、D），answer 为其中一个字母"
        }
        QuestionType::MultipleChoice => {
            "必须提供恰好4个选项（键为A、B、C、D），answer 为2到4个正确选项字母组成的字符串（如 \"AC\"）"
        }
        QuestionType::TrueFalse => {
            "必须提供恰好2个选项：A为\"正确\"、B为\"错误\"，answer 为 A 或 B"
        }
    }
}

/// 构造单题生成的 PromptSpec
pub fn build_generation_prompt(
    material: &str,
    question_type: QuestionType,
    difficulty: Difficulty,
    knowledge_points: &[String],
) -> PromptSpec {
    let system = format!(
        "你是一名资深的命题专家，负责根据教学材料编写考试题目。\n\
         只输出一个JSON对象，不要输出任何其他文字、解释或markdown代码块。\n\
         JSON字段要求：\n\
         - stem: 题干文本\n\
         - options: 选项数组，每项为 {{\"key\": \"A\", \"content\": \"...\"}}\n\
         - answer: 正确答案的字母\n\
         - analysis: {{\"material_excerpt\": \"题目依据的材料原文\", \"reasoning\": \"推理过程\", \"conclusion\": \"结论\"}}\n\
         - quality_score: 你对本题质量的自评分（0-100的整数）\n\
         题型约束：{}。",
        option_requirement(question_type)
    );

    let mut user = format!(
        "请根据以下材料出一道{}（难度：{}）。\n\n=== 材料 ===\n{}",
        question_type.display_name(),
        difficulty.display_name(),
        material_excerpt(material)
    );

    if !knowledge_points.is_empty() {
        user.push_str(&format!(
            "\n\n=== 考察知识点 ===\n{}",
            knowledge_points.join("、")
        ));
    }

    user.push_str("\n\n题目必须能从材料中找到依据，analysis.material_excerpt 需引用对应原文。");

    PromptSpec {
        system: Some(system),
        user,
        temperature: None,
        max_output_tokens: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_truncation() {
        let long = "材".repeat(MATERIAL_EXCERPT_MAX_CHARS + 100);
        let excerpt = material_excerpt(&long);
        assert_eq!(excerpt.chars().count(), MATERIAL_EXCERPT_MAX_CHARS + 2);
        assert!(excerpt.ends_with("……"));

        assert_eq!(material_excerpt("  短材料  "), "短材料");
    }

    #[test]
    fn test_prompt_carries_constraints() {
        let spec = build_generation_prompt(
            "细胞是生命活动的基本单位。",
            QuestionType::MultipleChoice,
            Difficulty::Hard,
            &["细胞结构".to_string(), "细胞功能".to_string()],
        );
        let system = spec.system.unwrap();
        assert!(system.contains("quality_score"));
        assert!(system.contains("2到4个"));
        assert!(spec.user.contains("多选题"));
        assert!(spec.user.contains("困难"));
        assert!(spec.user.contains("细胞结构、细胞功能"));
    }
}
