//! 生成任务编排的端到端场景
//!
//! 用脚本化的模型客户端驱动公开接口，覆盖重试、模拟兜底、取消、
//! 超时与零产出失败等任务生命周期路径。

mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use common::{
    good_single_choice_json, harness, test_settings, wait_for_terminal, OfflineClient,
    ScriptedClient,
};
use quizgen::{
    ApiConfig, AppError, CompletionClient, CreateTaskRequest, Difficulty, PromptSpec,
    ProviderAvailability, ProviderError, QuestionType, ReviewStatus, TaskStatus,
};

fn single_choice_request(material_id: &str, count: u32) -> CreateTaskRequest {
    CreateTaskRequest {
        material_id: material_id.to_string(),
        count,
        question_types: vec![QuestionType::SingleChoice],
        difficulty: Difficulty::Medium,
        knowledge_points: vec!["细胞结构".to_string()],
        created_by: Some("tester".to_string()),
        time_budget_secs: None,
    }
}

#[tokio::test]
async fn retry_twice_then_succeed_completes_full_count() {
    // 槽位 0 的前两次调用超时，第三次成功；其余槽位一次成功
    let client = Arc::new(ScriptedClient::new(
        vec![
            Err(ProviderError::Timeout),
            Err(ProviderError::Timeout),
            Ok(good_single_choice_json()),
        ],
        Ok(good_single_choice_json()),
    ));
    let h = harness(client.clone(), test_settings());

    let task_id = h
        .generation
        .create_task(single_choice_request(&h.material_id, 5))
        .await
        .unwrap();
    let view = wait_for_terminal(&h.generation, &task_id).await;

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.generated_count, 5);
    assert!((view.success_rate - 1.0).abs() < f64::EPSILON);
    assert!(view.error.is_none());
    // 5 次成功 + 2 次超时重试
    assert_eq!(client.call_count(), 7);

    let task = quizgen::repos::TaskRepo::get_task(&h.db, &task_id)
        .unwrap()
        .unwrap();
    assert_eq!(task.slot_retries, vec![2, 0, 0, 0, 0]);
}

#[tokio::test]
async fn unavailable_provider_falls_back_to_simulated() {
    let h = harness(Arc::new(OfflineClient), test_settings());

    let mut request = single_choice_request(&h.material_id, 4);
    request.question_types = vec![
        QuestionType::SingleChoice,
        QuestionType::MultipleChoice,
        QuestionType::TrueFalse,
    ];
    let task_id = h.generation.create_task(request).await.unwrap();
    let view = wait_for_terminal(&h.generation, &task_id).await;

    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.generated_count, 4);
    assert!((view.success_rate - 1.0).abs() < f64::EPSILON);

    let questions = h.generation.list_task_questions(&task_id).unwrap();
    assert_eq!(questions.len(), 4);
    for question in &questions {
        assert!(question.simulated, "模拟题必须带 simulated 标记");
        assert_eq!(
            question.options.len(),
            question.question_type.expected_option_count()
        );
    }
    // 模拟题通过自动复审后全部进入人工队列
    assert_eq!(h.review.pending_review_queue(50, 0).unwrap().len(), 4);
}

/// 前两次调用立即成功，第三次调用卡在闸门上直到测试放行
struct GatedClient {
    calls: AtomicUsize,
    entered_gate: Arc<Notify>,
    release_gate: Arc<Notify>,
}

#[async_trait]
impl CompletionClient for GatedClient {
    async fn is_available(&self) -> ProviderAvailability {
        ProviderAvailability::available()
    }

    async fn active_config(&self) -> Result<ApiConfig, AppError> {
        Ok(common::test_config())
    }

    async fn generate_completion(
        &self,
        _config: &ApiConfig,
        _prompt: &PromptSpec,
    ) -> Result<String, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > 2 {
            self.entered_gate.notify_one();
            self.release_gate.notified().await;
        }
        Ok(good_single_choice_json())
    }
}

#[tokio::test]
async fn cancel_preserves_accepted_and_stops_new_calls() {
    let entered_gate = Arc::new(Notify::new());
    let release_gate = Arc::new(Notify::new());
    let client = Arc::new(GatedClient {
        calls: AtomicUsize::new(0),
        entered_gate: entered_gate.clone(),
        release_gate: release_gate.clone(),
    });
    let h = harness(client.clone(), test_settings());

    let task_id = h
        .generation
        .create_task(single_choice_request(&h.material_id, 5))
        .await
        .unwrap();

    // 等到第 3 个槽位的调用在途（前 2 个槽位已接受）
    entered_gate.notified().await;
    let view = h.generation.get_task_status(&task_id).unwrap();
    assert_eq!(view.progress.accepted, 2);

    h.generation.cancel_task(&task_id).unwrap();
    // 放行在途调用：结果不得再入库
    release_gate.notify_one();

    let view = wait_for_terminal(&h.generation, &task_id).await;
    assert_eq!(view.status, TaskStatus::Cancelled);
    assert_eq!(view.generated_count, 2);
    // 置位取消标志后不再发起新调用
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);

    // 终态任务再取消是幂等空操作
    h.generation.cancel_task(&task_id).unwrap();
    let view = h.generation.get_task_status(&task_id).unwrap();
    assert_eq!(view.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn zero_accepted_fails_with_error_detail() {
    let client = Arc::new(ScriptedClient::always(Err(ProviderError::RateLimited)));
    let h = harness(client.clone(), test_settings());

    let task_id = h
        .generation
        .create_task(single_choice_request(&h.material_id, 3))
        .await
        .unwrap();
    let view = wait_for_terminal(&h.generation, &task_id).await;

    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.generated_count, 0);
    assert!(view.error.is_some());
    // 3 个槽位 × 3 次尝试
    assert_eq!(client.call_count(), 9);

    let task = quizgen::repos::TaskRepo::get_task(&h.db, &task_id)
        .unwrap()
        .unwrap();
    assert_eq!(task.slot_retries, vec![3, 3, 3]);
}

#[tokio::test]
async fn partial_shortfall_still_completes() {
    // 前 2 个槽位成功，之后模型开始返回不可解析的文本
    let client = Arc::new(ScriptedClient::new(
        vec![
            Ok(good_single_choice_json()),
            Ok(good_single_choice_json()),
        ],
        Ok("模型摆烂了，没有JSON".to_string()),
    ));
    let h = harness(client, test_settings());

    let task_id = h
        .generation
        .create_task(single_choice_request(&h.material_id, 5))
        .await
        .unwrap();
    let view = wait_for_terminal(&h.generation, &task_id).await;

    // 只要接受数 ≥ 1，耗尽预算就是 completed 而非 failed
    assert_eq!(view.status, TaskStatus::Completed);
    assert_eq!(view.generated_count, 2);
    assert!((view.success_rate - 0.4).abs() < 1e-9);
    assert_eq!(h.generation.list_task_questions(&task_id).unwrap().len(), 2);
}

#[tokio::test]
async fn exhausted_time_budget_fails_when_nothing_accepted() {
    let client = Arc::new(ScriptedClient::always(Ok(good_single_choice_json())));
    let h = harness(client.clone(), test_settings());

    let mut request = single_choice_request(&h.material_id, 3);
    request.time_budget_secs = Some(0);
    let task_id = h.generation.create_task(request).await.unwrap();
    let view = wait_for_terminal(&h.generation, &task_id).await;

    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(view.generated_count, 0);
    assert!(view.error.unwrap().contains("超时"));
    // 截止时间在任何尝试前已过，不应发起调用
    assert_eq!(client.call_count(), 0);
}

#[tokio::test]
async fn accepted_questions_enter_ai_review_pipeline() {
    let client = Arc::new(ScriptedClient::always(Ok(good_single_choice_json())));
    let h = harness(client, test_settings());

    let task_id = h
        .generation
        .create_task(single_choice_request(&h.material_id, 2))
        .await
        .unwrap();
    tokio_test::assert_ok!(h.generation.get_task_status(&task_id));
    wait_for_terminal(&h.generation, &task_id).await;

    // 自动复审通过后题目停在 pending，等待人工决定
    let questions = h.generation.list_task_questions(&task_id).unwrap();
    assert_eq!(questions.len(), 2);
    for question in &questions {
        assert_eq!(question.status, ReviewStatus::Pending);
    }
}
