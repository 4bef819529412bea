//! 审核服务
//!
//! 题目入库后（ai_reviewing）先经过自动复审，再进入人工审核队列：
//! 自动复审基于结构检查重新计算质量分和问题列表，分数不达标或存在
//! 问题的题目被自动拒绝；经过确定性修复的题目一律送人工审核，不论
//! 自动评分高低（结构合法但语义可能错误的答案必须由人确认）。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::database::Database;
use crate::models::AppError;
use crate::question_gen::validator::{answer_matches_grammar, PADDED_OPTION_PREFIX};
use crate::repos::question_repo::{
    CreateQuestionParams, Question, QuestionRepo, ReviewStatus, ReviewUpdate,
};

/// 人工审核决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

/// 自动复审中每条问题扣除的分数
const ISSUE_PENALTY: i32 = 20;
/// 解析段缺失每段扣除的分数
const ANALYSIS_PENALTY: i32 = 5;
/// 题干最短字符数
const MIN_STEM_CHARS: usize = 8;

pub struct ReviewService {
    db: Arc<Database>,
    screen_threshold: i32,
}

impl ReviewService {
    pub fn new(db: Arc<Database>, screen_threshold: i32) -> Self {
        Self {
            db,
            screen_threshold,
        }
    }

    // ========================================================================
    // 自动复审
    // ========================================================================

    /// 对 ai_reviewing 状态的题目执行自动复审
    ///
    /// - 修复过的题目：强制送人工队列（ai_approved -> pending）
    /// - 分数低于阈值或问题非空：ai_rejected（终态）
    /// - 其余：ai_approved 并立即进入 pending
    pub fn screen_question(&self, question_id: &str) -> Result<Question, AppError> {
        let question = QuestionRepo::get_question(&self.db, question_id)?
            .ok_or_else(|| AppError::not_found(format!("题目不存在: {}", question_id)))?;

        if question.status != ReviewStatus::AiReviewing {
            return Err(AppError::validation(format!(
                "题目 {} 状态为 {}，不可执行自动复审",
                question_id,
                question.status.as_str()
            )));
        }

        let (score, mut issues) = Self::evaluate(&question);
        debug!(
            "[ReviewService] Question {} 自动复审: score={} issues={:?}",
            question_id, score, issues
        );

        if question.repaired {
            // 修复过的题目不允许绕过人工审核
            issues.push("答案或选项经过自动修复，需人工确认语义正确性".to_string());
            let update = ReviewUpdate {
                quality_score: Some(score),
                issues: Some(issues),
                ..Default::default()
            };
            QuestionRepo::transition_status(
                &self.db,
                question_id,
                ReviewStatus::AiReviewing,
                ReviewStatus::AiApproved,
                &update,
            )?;
            return QuestionRepo::transition_status(
                &self.db,
                question_id,
                ReviewStatus::AiApproved,
                ReviewStatus::Pending,
                &ReviewUpdate::default(),
            );
        }

        if score < self.screen_threshold || !issues.is_empty() {
            info!(
                "[ReviewService] Question {} 自动拒绝: score={} threshold={} issues={}",
                question_id,
                score,
                self.screen_threshold,
                issues.len()
            );
            return QuestionRepo::transition_status(
                &self.db,
                question_id,
                ReviewStatus::AiReviewing,
                ReviewStatus::AiRejected,
                &ReviewUpdate {
                    quality_score: Some(score),
                    issues: Some(issues),
                    ..Default::default()
                },
            );
        }

        QuestionRepo::transition_status(
            &self.db,
            question_id,
            ReviewStatus::AiReviewing,
            ReviewStatus::AiApproved,
            &ReviewUpdate {
                quality_score: Some(score),
                ..Default::default()
            },
        )?;
        QuestionRepo::transition_status(
            &self.db,
            question_id,
            ReviewStatus::AiApproved,
            ReviewStatus::Pending,
            &ReviewUpdate::default(),
        )
    }

    /// 结构化检查：重新计算质量分与问题列表
    fn evaluate(question: &Question) -> (i32, Vec<String>) {
        let mut issues = Vec::new();

        let expected = question.question_type.expected_option_count();
        if question.options.len() != expected {
            issues.push(format!(
                "选项数量 {} 不符合{}语法",
                question.options.len(),
                question.question_type.display_name()
            ));
        }

        if !answer_matches_grammar(question.question_type, &question.correct_answer) {
            issues.push(format!("答案 '{}' 不符合题型语法", question.correct_answer));
        }

        if question.stem.trim().chars().count() < MIN_STEM_CHARS {
            issues.push("题干过短".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for option in &question.options {
            let content = option.content.trim();
            if content.is_empty() {
                issues.push(format!("选项 {} 内容为空", option.key));
            } else if !seen.insert(content) {
                issues.push(format!("选项 {} 与其他选项内容重复", option.key));
            }
            if content.starts_with(PADDED_OPTION_PREFIX) {
                issues.push(format!("选项 {} 为自动补齐的占位选项", option.key));
            }
        }

        let mut score = question.quality_score;
        for part in [
            &question.analysis.material_excerpt,
            &question.analysis.reasoning,
            &question.analysis.conclusion,
        ] {
            if part.trim().is_empty() {
                score -= ANALYSIS_PENALTY;
            }
        }
        score -= issues.len() as i32 * ISSUE_PENALTY;

        (score.clamp(0, 100), issues)
    }

    // ========================================================================
    // 人工审核
    // ========================================================================

    /// 人工审核队列（只返回 pending 状态的题目）
    pub fn pending_review_queue(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Question>, AppError> {
        QuestionRepo::list_pending_review(&self.db, limit, offset)
    }

    /// 人工审核决定：pending -> approved / rejected
    pub fn review_question(
        &self,
        question_id: &str,
        decision: ReviewDecision,
        comment: Option<String>,
    ) -> Result<Question, AppError> {
        let to = match decision {
            ReviewDecision::Approve => ReviewStatus::Approved,
            ReviewDecision::Reject => ReviewStatus::Rejected,
        };

        let question = QuestionRepo::transition_status(
            &self.db,
            question_id,
            ReviewStatus::Pending,
            to,
            &ReviewUpdate {
                reviewer_comment: comment,
                ..Default::default()
            },
        )?;

        info!(
            "[ReviewService] Question {} 人工审核: {:?}",
            question_id, decision
        );
        Ok(question)
    }

    /// 把 ai_rejected 的题目重新提交为新候选题
    ///
    /// 原题保持 ai_rejected 终态不变；新题以 ai_reviewing 入库并立即
    /// 走一遍自动复审。
    pub fn resubmit_question(&self, question_id: &str) -> Result<Question, AppError> {
        let original = QuestionRepo::get_question(&self.db, question_id)?
            .ok_or_else(|| AppError::not_found(format!("题目不存在: {}", question_id)))?;

        if original.status != ReviewStatus::AiRejected {
            return Err(AppError::validation(format!(
                "题目 {} 状态为 {}，仅 ai_rejected 可重新提交",
                question_id,
                original.status.as_str()
            )));
        }

        let params = CreateQuestionParams {
            task_id: original.task_id.clone(),
            question_type: original.question_type,
            stem: original.stem.clone(),
            options: original.options.clone(),
            correct_answer: original.correct_answer.clone(),
            analysis: original.analysis.clone(),
            quality_score: original.quality_score,
            repair_actions: original.repair_actions.clone(),
            simulated: original.simulated,
        };
        let candidate = QuestionRepo::create_question(&self.db, &params)?;
        info!(
            "[ReviewService] Question {} 重新提交为新候选题 {}",
            question_id, candidate.id
        );
        self.screen_question(&candidate.id)
    }
}
