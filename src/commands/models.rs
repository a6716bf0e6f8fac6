// 模型管理命令

use crate::audio::ffmpeg;
use crate::audio::separator::{separate_stems, SeparationRequest};
use crate::commands::jobs::ProcessRegistry;
use crate::config::{AppConfig, DataPaths};
use crate::error::AppResult;
use crate::models::{self, ModelInfo, ModelStatus};
use crate::server::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

/// 镜像构建时预热的分轨配置，顺序与构建脚本一致
pub const DEFAULT_PREFETCH_TASKS: &[&str] = &["spleeter:4stems", "spleeter:2stems"];

/// 静音音频时长（秒）
const SILENCE_SECONDS: f32 = 1.0;

/// 模型及其缓存状态
#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    #[serde(flatten)]
    pub info: ModelInfo,
    pub status: ModelStatus,
}

/// 单个模型的预热结果
#[derive(Debug, Clone, Serialize)]
pub struct PrefetchOutcome {
    pub model_id: String,
    pub success: bool,
    pub downloaded: bool,
    pub error: Option<String>,
}

/// 获取所有模型及缓存状态
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelEntry>> {
    let models_root = &state.paths.model_dir;
    let entries = models::get_available_models()
        .into_iter()
        .map(|info| {
            let status = models::check_model_downloaded(models_root, &info);
            ModelEntry { info, status }
        })
        .collect();
    Json(entries)
}

/// 预热模型缓存
///
/// 用 ffmpeg 生成 1 秒静音 MP3，再对每个分轨配置各运行一次分轨程序，
/// 触发首次运行时的模型下载。输出全部丢弃。
/// ffmpeg 失败直接返回错误；分轨失败只记录警告，strict 模式下返回错误。
pub fn prefetch_models(
    config: &AppConfig,
    paths: &DataPaths,
    tasks: &[String],
    strict: bool,
) -> AppResult<Vec<PrefetchOutcome>> {
    prefetch_with(config, paths, tasks, strict, |dummy_audio| {
        ffmpeg::generate_silence(dummy_audio, SILENCE_SECONDS)
    })
}

/// 预热流程，prepare 负责在临时目录中生成输入音频
fn prefetch_with<F>(
    config: &AppConfig,
    paths: &DataPaths,
    tasks: &[String],
    strict: bool,
    prepare: F,
) -> AppResult<Vec<PrefetchOutcome>>
where
    F: FnOnce(&Path) -> AppResult<()>,
{
    let selected: Vec<ModelInfo> = tasks
        .iter()
        .map(|t| models::require_model(t))
        .collect::<AppResult<_>>()?;

    if selected.is_empty() {
        return Ok(Vec::new());
    }

    std::fs::create_dir_all(&paths.model_dir)?;

    // 临时目录在所有返回路径上都会被删除
    let temp_dir = tempfile::Builder::new().prefix("stemsplit-prefetch").tempdir()?;
    let dummy_audio = temp_dir.path().join("dummy.mp3");
    let temp_output = temp_dir.path().join("output");
    info!("临时目录: {}", temp_dir.path().display());

    prepare(&dummy_audio)?;

    let registry = ProcessRegistry::default();
    let mut outcomes = Vec::with_capacity(selected.len());

    for model in &selected {
        info!("开始预热模型: {} -> {}", model.id, paths.model_dir.display());

        let request = SeparationRequest {
            input_path: &dummy_audio,
            output_base: &temp_output,
            model,
            codec: &config.separation.output_codec,
            model_dir: &paths.model_dir,
            separator_path: config.separation.separator_path.as_deref(),
        };
        let cancel_flag = registry.reset_cancel_flag(&model.id);
        let result = separate_stems(&request, None, cancel_flag, &registry, &model.id);
        registry.remove(&model.id);

        let status = models::check_model_downloaded(&paths.model_dir, model);
        match result {
            Ok(_) => {
                info!(
                    "模型预热完成: {} (下载状态: {}, 位置: {:?})",
                    model.id, status.downloaded, status.local_path
                );
                outcomes.push(PrefetchOutcome {
                    model_id: model.id.clone(),
                    success: true,
                    downloaded: status.downloaded,
                    error: None,
                });
            }
            Err(e) if strict => return Err(e),
            Err(e) => {
                warn!("模型预热失败，首次请求时将重新下载: {} ({})", model.id, e);
                outcomes.push(PrefetchOutcome {
                    model_id: model.id.clone(),
                    success: false,
                    downloaded: status.downloaded,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    Ok(outcomes)
}
