//! 出题域模块
//!
//! 候选题从模型原始文本到可入库题目的完整处理链：
//! parser（文本 -> 结构化草稿）→ validator（语法校验 + 确定性修复）。
//! simulated 提供模型不可用时的兜底生成。

pub mod parser;
pub mod prompts;
pub mod simulated;
pub mod types;
pub mod validator;

pub use types::{
    AnswerAnalysis, Difficulty, DraftError, DraftOutcome, QuestionDraft, QuestionOption,
    QuestionType, RepairAction, RepairKind,
};
