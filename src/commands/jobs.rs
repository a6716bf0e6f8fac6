// 任务命令：后台分轨调度、取消与查询

use crate::audio::separator::{self, SeparationRequest};
use crate::database::JobRecord;
use crate::error::{AppError, AppResult};
use crate::models::ModelInfo;
use crate::server::AppState;
use crate::utils::SeparationResult;
use axum::extract::{Path, State};
use axum::Json;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 列表接口返回的最大任务数
const LIST_LIMIT: usize = 50;

/// 子进程句柄
pub type ChildHandle = Arc<Mutex<Option<Child>>>;

/// 按任务 ID 管理的取消标志与子进程句柄，支持多个并发任务互不干扰
#[derive(Default)]
pub struct ProcessRegistry {
    flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    children: Mutex<HashMap<String, Vec<ChildHandle>>>,
}

impl ProcessRegistry {
    /// 重置任务的取消标志（开始新任务时调用）
    pub fn reset_cancel_flag(&self, job_id: &str) -> Arc<AtomicBool> {
        let mut flags = self.flags.lock();
        let flag = flags
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)));
        flag.store(false, Ordering::SeqCst);
        flag.clone()
    }

    /// 清理任务的取消标志和子进程句柄
    pub fn remove(&self, job_id: &str) {
        self.flags.lock().remove(job_id);
        self.children.lock().remove(job_id);
    }

    /// 注册子进程到任务（用于即时取消）
    pub fn register_child(&self, job_id: &str, child: Child) -> ChildHandle {
        let handle = Arc::new(Mutex::new(Some(child)));
        self.children
            .lock()
            .entry(job_id.to_string())
            .or_default()
            .push(handle.clone());
        handle
    }

    /// 设置取消标志并 kill 任务的所有子进程
    /// 任务未登记时返回 false
    pub fn cancel(&self, job_id: &str) -> bool {
        let flag = match self.flags.lock().get(job_id) {
            Some(flag) => flag.clone(),
            None => return false,
        };
        flag.store(true, Ordering::SeqCst);

        if let Some(handles) = self.children.lock().get(job_id) {
            for handle in handles {
                if let Some(ref mut child) = *handle.lock() {
                    info!("正在终止子进程: job_id={}", job_id);
                    let _ = child.kill();
                }
            }
        }
        true
    }
}

/// RAII 守卫：任务结束时自动清理取消标志和子进程句柄
pub struct CancelFlagGuard {
    registry: Arc<ProcessRegistry>,
    job_id: String,
}

impl CancelFlagGuard {
    pub fn new(registry: Arc<ProcessRegistry>, job_id: String) -> Self {
        Self { registry, job_id }
    }
}

impl Drop for CancelFlagGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.job_id);
    }
}

/// 提交后台分轨任务
///
/// 取消标志在返回前登记，调用方拿到 job_id 后即可取消
pub fn spawn_separation(state: AppState, job: JobRecord, model: ModelInfo) {
    let cancel_flag = state.registry.reset_cancel_flag(&job.id);

    tokio::spawn(async move {
        let job_id = job.id.clone();
        let _guard = CancelFlagGuard::new(state.registry.clone(), job_id.clone());

        // 并发上限
        let _permit = match state.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("获取分轨许可失败: {}", e);
                if let Err(e) = state.jobs.mark_failed(&job_id, "separation queue closed") {
                    error!("写入任务结果失败: job_id={}, {}", job_id, e);
                }
                return;
            }
        };

        if cancel_flag.load(Ordering::SeqCst) {
            info!("任务在排队时已取消: job_id={}", job_id);
            return;
        }

        match state.jobs.mark_running(&job_id) {
            Ok(true) => {}
            Ok(false) => {
                info!("任务已结束，跳过分轨: job_id={}", job_id);
                return;
            }
            Err(e) => warn!("更新任务状态失败: {}", e),
        }

        let worker_state = state.clone();
        let result = tokio::task::spawn_blocking(move || {
            run_separation(&worker_state, &job, &model, cancel_flag)
        })
        .await;

        let outcome = match result {
            Ok(Ok(separation)) => {
                info!("Separation completed: job_id={}, dir={}", job_id, separation.output_dir);
                state.jobs.mark_completed(&job_id, separation.duration)
            }
            Ok(Err(AppError::Cancelled)) => {
                info!("分轨已取消: job_id={}", job_id);
                state.jobs.mark_cancelled(&job_id)
            }
            Ok(Err(e)) => {
                error!("分轨失败: job_id={}, {}", job_id, e);
                state.jobs.mark_failed(&job_id, &e.to_string())
            }
            Err(e) => {
                error!("分轨线程异常: job_id={}, {}", job_id, e);
                state.jobs.mark_failed(&job_id, &format!("separation worker crashed: {}", e))
            }
        };

        if let Err(e) = outcome {
            error!("写入任务结果失败: job_id={}, {}", job_id, e);
        }
    });
}

/// 在阻塞线程中执行分轨
fn run_separation(
    state: &AppState,
    job: &JobRecord,
    model: &ModelInfo,
    cancel_flag: Arc<AtomicBool>,
) -> AppResult<SeparationResult> {
    let input_path = std::path::PathBuf::from(&job.input_path);
    let request = SeparationRequest {
        input_path: &input_path,
        output_base: &state.paths.output_dir,
        model,
        codec: &state.config.separation.output_codec,
        model_dir: &state.paths.model_dir,
        separator_path: state.config.separation.separator_path.as_deref(),
    };

    let jobs = state.jobs.clone();
    let job_id = job.id.clone();
    let progress: separator::ProgressCallback = Box::new(move |value: f32, _message: &str| {
        if let Err(e) = jobs.update_progress(&job_id, value) {
            warn!("更新任务进度失败: {}", e);
        }
    });

    separator::separate_stems(&request, Some(progress), cancel_flag, &state.registry, &job.id)
}

/// 获取最近任务
pub async fn list_jobs(State(state): State<AppState>) -> AppResult<Json<Vec<JobRecord>>> {
    Ok(Json(state.jobs.list_jobs(LIST_LIMIT)?))
}

/// 获取单个任务
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobRecord>> {
    state
        .jobs
        .get_job(&job_id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Job not found".to_string()))
}

/// 取消任务，已结束的任务原样返回
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobRecord>> {
    let job = state
        .jobs
        .get_job(&job_id)?
        .ok_or_else(|| AppError::NotFound("Job not found".to_string()))?;

    if job.status.is_terminal() {
        return Ok(Json(job));
    }

    let killed = state.registry.cancel(&job_id);
    state.jobs.mark_cancelled(&job_id)?;
    info!("取消任务请求: job_id={}, 已登记={}", job_id, killed);

    state
        .jobs
        .get_job(&job_id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Job not found".to_string()))
}
