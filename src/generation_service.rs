//! 出题任务编排器
//!
//! 驱动一个生成任务从创建走到终态：按槽位并发调用模型、对每个槽位做
//! 有限重试、把通过校验且达到接受阈值的候选题入库并原子推进进度，
//! 直到达到请求数量或耗尽尝试预算。
//!
//! - 模型配置在任务创建时快照，任务全程独占使用（切换默认模型只影响
//!   后续任务）。
//! - 取消是协作式的：槽位在每次尝试之间检查取消标志，在途调用允许
//!   完成，但其结果不再入库，也不再发起新调用。
//! - 任务级墙钟预算独立于单次调用超时；超出预算时保留已接受的题目。
//! - 持久化错误对任务是致命的：立即中止，已落库的题目保持有效。

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::llm_manager::{ApiConfig, CompletionClient};
use crate::models::{
    AppError, CreateTaskRequest, GenerationTask, TaskStatus, TaskStatusView,
};
use crate::question_gen::prompts::build_generation_prompt;
use crate::question_gen::simulated::simulated_draft;
use crate::question_gen::types::{Difficulty, QuestionType};
use crate::question_gen::{parser, validator};
use crate::repos::question_repo::{CreateQuestionParams, Question, QuestionRepo};
use crate::repos::task_repo::TaskRepo;
use crate::repos::MaterialStore;
use crate::review_service::ReviewService;
use crate::settings::GenerationSettings;

/// 单个槽位的收尾方式
#[derive(Debug)]
enum SlotEnd {
    /// 槽位产出一道已入库的题目
    Accepted,
    /// 耗尽槽位预算仍无产出
    Shortfall(String),
    /// 任务被取消，槽位放弃
    Cancelled,
    /// 任务级墙钟预算耗尽
    DeadlineExceeded,
    /// 持久化错误，整个任务中止
    Fatal(String),
}

#[derive(Debug)]
struct SlotReport {
    slot_index: usize,
    retries: u32,
    end: SlotEnd,
}

/// 一次后台运行的汇总（终态判定的输入）
struct RunSummary {
    slot_retries: Vec<u32>,
    deadline_hit: bool,
    fatal: Option<String>,
    last_error: Option<String>,
    simulated: bool,
}

pub struct GenerationService {
    db: Arc<Database>,
    client: Arc<dyn CompletionClient>,
    materials: Arc<dyn MaterialStore>,
    review: Arc<ReviewService>,
    settings: GenerationSettings,
    /// 运行中的任务追踪：task_id -> (CancellationToken, generation)
    /// generation 计数器用于区分同键任务的取消/重启竞态
    running_tasks: DashMap<String, (CancellationToken, u64)>,
    generation_counter: AtomicU64,
}

impl GenerationService {
    pub fn new(
        db: Arc<Database>,
        client: Arc<dyn CompletionClient>,
        materials: Arc<dyn MaterialStore>,
        review: Arc<ReviewService>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            db,
            client,
            materials,
            review,
            settings,
            running_tasks: DashMap::new(),
            generation_counter: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // 对外接口
    // ========================================================================

    /// 创建生成任务并启动后台运行，立即返回任务 ID
    ///
    /// 模型可用性与配置快照在此刻确定：不可用时任务仍会创建，由模拟
    /// 生成器兜底完成（所有题目打 simulated 标记）。
    pub async fn create_task(self: &Arc<Self>, request: CreateTaskRequest) -> Result<String, AppError> {
        if request.count == 0 {
            return Err(AppError::validation("请求题目数必须大于 0"));
        }
        if request.count > self.settings.max_requested_count {
            return Err(AppError::validation(format!(
                "请求题目数 {} 超过上限 {}",
                request.count, self.settings.max_requested_count
            )));
        }
        if request.question_types.is_empty() {
            return Err(AppError::validation("至少指定一种题型"));
        }

        let material = self
            .materials
            .get_material_text(&request.material_id)
            .await?;
        if material.trim().is_empty() {
            return Err(AppError::validation(format!(
                "材料 {} 内容为空",
                request.material_id
            )));
        }

        // 任务创建时快照模型配置；不可用则走模拟兜底
        let availability = self.client.is_available().await;
        let config = if availability.available {
            match self.client.active_config().await {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("[GenerationService] 读取模型配置失败，降级为模拟生成: {}", e);
                    None
                }
            }
        } else {
            info!(
                "[GenerationService] 模型不可用（{}），任务将使用模拟生成器",
                availability.reason.as_deref().unwrap_or("未知原因")
            );
            None
        };

        let task = TaskRepo::create_task(
            &self.db,
            &request.material_id,
            request.count,
            &request.question_types,
            request.difficulty,
            &request.knowledge_points,
            config.as_ref().map(|c| c.id.as_str()),
            request.created_by.as_deref(),
        )?;
        let task_id = task.id.clone();

        let cancel_token = CancellationToken::new();
        let generation = self.generation_counter.fetch_add(1, Ordering::SeqCst);
        self.running_tasks
            .insert(task_id.clone(), (cancel_token.clone(), generation));

        let time_budget_secs = request
            .time_budget_secs
            .unwrap_or(self.settings.task_time_budget_secs);
        let service = Arc::clone(self);
        let spawned_id = task_id.clone();

        tokio::spawn(async move {
            // 清理守卫：无论正常结束、提前返回还是 panic，都把本任务
            // 从 running_tasks 移除；只删除同 generation 的条目。
            struct CleanupOnDrop<F: FnOnce()>(Option<F>);
            impl<F: FnOnce()> Drop for CleanupOnDrop<F> {
                fn drop(&mut self) {
                    if let Some(f) = self.0.take() {
                        f();
                    }
                }
            }
            let service_for_cleanup = Arc::clone(&service);
            let id_for_cleanup = spawned_id.clone();
            let _cleanup_guard = CleanupOnDrop(Some(move || {
                service_for_cleanup
                    .running_tasks
                    .remove_if(&id_for_cleanup, |_, (_, gen)| *gen == generation);
            }));

            service
                .run_task(task, config, material, time_budget_secs, cancel_token)
                .await;
        });

        Ok(task_id)
    }

    /// 查询任务状态（进度、产出数、成功率、错误）
    pub fn get_task_status(&self, task_id: &str) -> Result<TaskStatusView, AppError> {
        let task = TaskRepo::get_task(&self.db, task_id)?
            .ok_or_else(|| AppError::not_found(format!("任务不存在: {}", task_id)))?;
        Ok(TaskStatusView::from_task(&task))
    }

    /// 协作式取消
    ///
    /// 在途的模型调用允许完成，但结果不再入库，也不再发起新调用；
    /// 已接受的题目全部保留。对已终态的任务是幂等空操作。
    pub fn cancel_task(&self, task_id: &str) -> Result<(), AppError> {
        let task = TaskRepo::get_task(&self.db, task_id)?
            .ok_or_else(|| AppError::not_found(format!("任务不存在: {}", task_id)))?;

        if task.status.is_terminal() {
            debug!("[GenerationService] 任务 {} 已终态，取消为空操作", task_id);
            return Ok(());
        }

        if let Some(entry) = self.running_tasks.get(task_id) {
            entry.value().0.cancel();
            info!("[GenerationService] 任务 {} 取消标志已置位", task_id);
            return Ok(());
        }

        // 没有在途运行（如进程重启后遗留的任务）：直接落终态
        let success_rate = task.accepted_count as f64 / task.requested_count.max(1) as f64;
        TaskRepo::finalize(
            &self.db,
            task_id,
            TaskStatus::Cancelled,
            task.accepted_count,
            success_rate,
            &task.slot_retries,
            None,
            task.simulated,
        )?;
        Ok(())
    }

    /// 任务产出的全部题目
    pub fn list_task_questions(&self, task_id: &str) -> Result<Vec<Question>, AppError> {
        QuestionRepo::list_by_task(&self.db, task_id)
    }

    // ========================================================================
    // 后台运行
    // ========================================================================

    async fn run_task(
        self: Arc<Self>,
        task: GenerationTask,
        config: Option<ApiConfig>,
        material: String,
        time_budget_secs: u64,
        cancel_token: CancellationToken,
    ) {
        match TaskRepo::mark_processing(&self.db, &task.id) {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "[GenerationService] 任务 {} 不在 pending 状态，放弃运行",
                    task.id
                );
                return;
            }
            Err(e) => {
                error!("[GenerationService] 任务 {} 进入 processing 失败: {}", task.id, e);
                return;
            }
        }

        let summary = match &config {
            None => self.run_simulated(&task, &material, &cancel_token).await,
            Some(cfg) => {
                self.run_with_provider(&task, cfg, &material, time_budget_secs, &cancel_token)
                    .await
            }
        };

        self.resolve_terminal(&task, summary, &cancel_token);
    }

    /// 读取权威的已接受数并写入终态
    fn resolve_terminal(
        &self,
        task: &GenerationTask,
        summary: RunSummary,
        cancel_token: &CancellationToken,
    ) {
        let accepted = match TaskRepo::get_task(&self.db, &task.id) {
            Ok(Some(current)) => current.accepted_count,
            Ok(None) => {
                error!("[GenerationService] 任务 {} 在终态判定时丢失", task.id);
                return;
            }
            Err(e) => {
                error!("[GenerationService] 任务 {} 终态判定读取失败: {}", task.id, e);
                return;
            }
        };

        let requested = task.requested_count;
        let success_rate = accepted as f64 / requested.max(1) as f64;

        let (status, error) = if let Some(fatal) = summary.fatal {
            (TaskStatus::Failed, Some(fatal))
        } else if cancel_token.is_cancelled() {
            (TaskStatus::Cancelled, None)
        } else if accepted == 0 {
            let detail = if summary.deadline_hit {
                "任务超时（预算内未产出任何题目）".to_string()
            } else {
                summary
                    .last_error
                    .unwrap_or_else(|| "未能生成任何题目".to_string())
            };
            (TaskStatus::Failed, Some(detail))
        } else if summary.deadline_hit && accepted < requested {
            (
                TaskStatus::Completed,
                Some(format!("任务超时，保留已接受的 {} 道题", accepted)),
            )
        } else {
            (TaskStatus::Completed, None)
        };

        if let Err(e) = TaskRepo::finalize(
            &self.db,
            &task.id,
            status,
            accepted,
            success_rate,
            &summary.slot_retries,
            error.as_deref(),
            summary.simulated,
        ) {
            error!("[GenerationService] 任务 {} 终态写入失败: {}", task.id, e);
        }
    }

    // ========================================================================
    // 槽位并发执行
    // ========================================================================

    async fn run_with_provider(
        self: &Arc<Self>,
        task: &GenerationTask,
        config: &ApiConfig,
        material: &str,
        time_budget_secs: u64,
        cancel_token: &CancellationToken,
    ) -> RunSummary {
        let requested = task.requested_count as usize;
        let deadline = Instant::now() + Duration::from_secs(time_budget_secs);
        let fatal_flag = Arc::new(AtomicBool::new(false));
        let reports = Arc::new(Mutex::new(Vec::<SlotReport>::with_capacity(requested)));
        let semaphore = Arc::new(Semaphore::new(self.settings.max_slot_concurrency));

        info!(
            "[GenerationService] 任务 {} 开始生成: requested={} 并发上限={} 槽位预算={}",
            task.id, requested, self.settings.max_slot_concurrency, self.settings.max_attempts_per_slot
        );

        let slot_tasks: Vec<_> = (0..requested)
            .map(|slot_index| {
                let service = Arc::clone(self);
                let semaphore = semaphore.clone();
                let reports = reports.clone();
                let fatal_flag = fatal_flag.clone();
                let cancel_token = cancel_token.clone();
                let config = config.clone();
                let task_id = task.id.clone();
                let question_type =
                    task.question_types[slot_index % task.question_types.len()];
                let difficulty = task.difficulty;
                let knowledge_points = task.knowledge_points.clone();
                let material = material.to_string();

                async move {
                    let _permit = match semaphore.acquire().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            reports.lock().await.push(SlotReport {
                                slot_index,
                                retries: 0,
                                end: SlotEnd::Shortfall(format!("信号量异常: {}", e)),
                            });
                            return;
                        }
                    };

                    let report = service
                        .run_slot(
                            &task_id,
                            slot_index,
                            question_type,
                            difficulty,
                            &knowledge_points,
                            &material,
                            &config,
                            deadline,
                            &cancel_token,
                            &fatal_flag,
                        )
                        .await;
                    reports.lock().await.push(report);
                }
            })
            .collect();

        stream::iter(slot_tasks)
            .for_each_concurrent(self.settings.max_slot_concurrency, |slot| slot)
            .await;

        let reports = reports.lock().await;
        let mut slot_retries = vec![0u32; requested];
        let mut deadline_hit = false;
        let mut fatal = None;
        let mut last_error = None;
        for report in reports.iter() {
            slot_retries[report.slot_index] = report.retries;
            match &report.end {
                SlotEnd::DeadlineExceeded => deadline_hit = true,
                SlotEnd::Fatal(msg) => fatal = Some(msg.clone()),
                SlotEnd::Shortfall(msg) => last_error = Some(msg.clone()),
                SlotEnd::Accepted | SlotEnd::Cancelled => {}
            }
        }

        RunSummary {
            slot_retries,
            deadline_hit,
            fatal,
            last_error,
            simulated: false,
        }
    }

    /// 单个槽位的重试循环
    ///
    /// 每次尝试之间检查取消标志、致命标志与任务级截止时间；供应商错误、
    /// 解析/校验失败、质量分不达标都消耗一次尝试并计入重试。
    #[allow(clippy::too_many_arguments)]
    async fn run_slot(
        &self,
        task_id: &str,
        slot_index: usize,
        question_type: QuestionType,
        difficulty: Difficulty,
        knowledge_points: &[String],
        material: &str,
        config: &ApiConfig,
        deadline: Instant,
        cancel_token: &CancellationToken,
        fatal_flag: &AtomicBool,
    ) -> SlotReport {
        let mut retries = 0u32;
        let mut last_error = String::new();

        for _attempt in 1..=self.settings.max_attempts_per_slot {
            if cancel_token.is_cancelled() {
                return SlotReport {
                    slot_index,
                    retries,
                    end: SlotEnd::Cancelled,
                };
            }
            if fatal_flag.load(Ordering::SeqCst) {
                return SlotReport {
                    slot_index,
                    retries,
                    end: SlotEnd::Shortfall("任务因持久化错误中止".to_string()),
                };
            }
            if Instant::now() >= deadline {
                return SlotReport {
                    slot_index,
                    retries,
                    end: SlotEnd::DeadlineExceeded,
                };
            }

            let prompt =
                build_generation_prompt(material, question_type, difficulty, knowledge_points);
            let raw_text = match self.client.generate_completion(config, &prompt).await {
                Ok(text) => text,
                Err(e) => {
                    retries += 1;
                    last_error = e.to_string();
                    debug!(
                        "[GenerationService] 任务 {} 槽位 {} 调用失败（重试 {}）: {}",
                        task_id, slot_index, retries, last_error
                    );
                    continue;
                }
            };

            // 取消后在途调用的结果不再入库
            if cancel_token.is_cancelled() {
                return SlotReport {
                    slot_index,
                    retries,
                    end: SlotEnd::Cancelled,
                };
            }

            let outcome = match parser::parse_draft(&raw_text, question_type)
                .and_then(validator::validate_draft)
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    retries += 1;
                    last_error = e.to_string();
                    debug!(
                        "[GenerationService] 任务 {} 槽位 {} 候选题无效（重试 {}）: {}",
                        task_id, slot_index, retries, last_error
                    );
                    continue;
                }
            };

            let (draft, repair_actions) = outcome.into_parts();
            if draft.quality_score < self.settings.accept_threshold {
                retries += 1;
                last_error = format!(
                    "质量分 {} 低于接受阈值 {}",
                    draft.quality_score, self.settings.accept_threshold
                );
                debug!(
                    "[GenerationService] 任务 {} 槽位 {} 质量不达标（重试 {}）",
                    task_id, slot_index, retries
                );
                continue;
            }

            let params = CreateQuestionParams {
                task_id: task_id.to_string(),
                question_type,
                stem: draft.stem,
                options: draft.options,
                correct_answer: draft.answer,
                analysis: draft.analysis,
                quality_score: draft.quality_score,
                repair_actions,
                simulated: false,
            };
            return match self.accept_question(&params) {
                Ok(Some(question)) => {
                    info!(
                        "[GenerationService] 任务 {} 槽位 {} 接受题目 {}（重试 {} 次）",
                        task_id, slot_index, question.id, retries
                    );
                    self.screen_accepted(&question);
                    SlotReport {
                        slot_index,
                        retries,
                        end: SlotEnd::Accepted,
                    }
                }
                // 进度守卫未命中：任务已被取消或终态化
                Ok(None) => SlotReport {
                    slot_index,
                    retries,
                    end: if cancel_token.is_cancelled() {
                        SlotEnd::Cancelled
                    } else {
                        SlotEnd::Shortfall("任务已不在进行中".to_string())
                    },
                },
                Err(e) => {
                    fatal_flag.store(true, Ordering::SeqCst);
                    error!(
                        "[GenerationService] 任务 {} 槽位 {} 持久化失败，任务中止: {}",
                        task_id, slot_index, e
                    );
                    SlotReport {
                        slot_index,
                        retries,
                        end: SlotEnd::Fatal(e.to_string()),
                    }
                }
            };
        }

        SlotReport {
            slot_index,
            retries,
            end: SlotEnd::Shortfall(last_error),
        }
    }

    /// 题目入库 + 进度自增（同一事务）
    ///
    /// 先执行带守卫的进度自增，命中后才写入题目行并提交；守卫未命中
    /// 返回 None（事务回滚，不会产生孤儿题目）。
    fn accept_question(
        &self,
        params: &CreateQuestionParams,
    ) -> Result<Option<Question>, AppError> {
        let mut conn = self.db.get_conn_safe()?;
        let tx = conn
            .transaction()
            .map_err(|e| AppError::database(format!("开启事务失败: {}", e)))?;

        if !TaskRepo::increment_accepted_with_conn(&tx, &params.task_id)? {
            return Ok(None);
        }
        let question = QuestionRepo::create_question_with_conn(&tx, params)?;
        tx.commit()
            .map_err(|e| AppError::database(format!("提交事务失败: {}", e)))?;
        Ok(Some(question))
    }

    /// 入库后交给审核服务做自动复审
    ///
    /// 复审失败不影响任务本身：题目停留在 ai_reviewing，可由运维重跑。
    fn screen_accepted(&self, question: &Question) {
        if let Err(e) = self.review.screen_question(&question.id) {
            warn!(
                "[GenerationService] 题目 {} 自动复审失败: {}",
                question.id, e
            );
        }
    }

    // ========================================================================
    // 模拟兜底
    // ========================================================================

    /// 模型不可用时的确定性兜底：直接生成 requested 道模拟题
    async fn run_simulated(
        &self,
        task: &GenerationTask,
        material: &str,
        cancel_token: &CancellationToken,
    ) -> RunSummary {
        let requested = task.requested_count as usize;
        let mut fatal = None;

        for slot_index in 0..requested {
            if cancel_token.is_cancelled() {
                break;
            }
            let question_type = task.question_types[slot_index % task.question_types.len()];
            let draft = simulated_draft(
                slot_index,
                question_type,
                task.difficulty,
                &task.knowledge_points,
                material,
            );
            let params = CreateQuestionParams {
                task_id: task.id.clone(),
                question_type,
                stem: draft.stem,
                options: draft.options,
                correct_answer: draft.answer,
                analysis: draft.analysis,
                quality_score: draft.quality_score,
                repair_actions: Vec::new(),
                simulated: true,
            };
            match self.accept_question(&params) {
                Ok(Some(question)) => self.screen_accepted(&question),
                Ok(None) => break,
                Err(e) => {
                    error!(
                        "[GenerationService] 任务 {} 模拟题入库失败: {}",
                        task.id, e
                    );
                    fatal = Some(e.to_string());
                    break;
                }
            }
        }

        RunSummary {
            slot_retries: vec![0; requested],
            deadline_hit: false,
            fatal,
            last_error: None,
            simulated: true,
        }
    }
}
