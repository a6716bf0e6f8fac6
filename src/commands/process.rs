// 上传与分轨提交命令

use crate::commands::jobs;
use crate::database::{JobRecord, JobStatus};
use crate::error::{AppError, AppResult};
use crate::models::{self, ModelInfo};
use crate::server::AppState;
use crate::utils::{
    file_basename, generate_id, normalize_path, now_string, sanitize_upload_name, sha256_hex,
    ProcessAudioResponse,
};
use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::Json;
use tracing::info;

/// 上传成功的提示文本
pub const ACCEPTED_MESSAGE: &str = "Uploaded. Separation is in progress.";

/// 上传字段名
const AUDIO_FIELD: &str = "audio_file";
const TASK_FIELD: &str = "task";

/// 解析后的上传内容
struct UploadForm {
    file_name: String,
    data: Bytes,
    task: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> AppResult<UploadForm> {
    let mut upload: Option<(String, Bytes)> = None;
    let mut task: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidArgument(format!("Invalid multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(AUDIO_FIELD) => {
                let file_name = field.file_name().map(str::to_string).ok_or_else(|| {
                    AppError::Validation(format!("{}: expected an uploaded file", AUDIO_FIELD))
                })?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::InvalidArgument(format!("Invalid upload: {}", e)))?;
                upload = Some((file_name, data));
            }
            Some(TASK_FIELD) => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| AppError::InvalidArgument(format!("Invalid task field: {}", e)))?;
                task = Some(value);
            }
            _ => {}
        }
    }

    let (file_name, data) = upload
        .ok_or_else(|| AppError::Validation(format!("{}: field required", AUDIO_FIELD)))?;

    Ok(UploadForm {
        file_name,
        data,
        task: task.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
    })
}

/// 下载路径：output/<basename>/<stem>.<codec>
pub fn download_paths(basename: &str, model: &ModelInfo, codec: &str) -> Vec<String> {
    let rel_dir = normalize_path(&format!("output/{}", basename));
    model
        .stems
        .iter()
        .map(|stem| format!("{}/{}.{}", rel_dir, stem, codec))
        .collect()
}

/// 上传音频并启动后台分轨
///
/// 1. 保存上传文件到 uploads 目录
/// 2. 登记任务并在后台启动分轨
/// 3. 返回预期的下载路径
pub async fn process_audio(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Json<ProcessAudioResponse>> {
    let form = read_form(multipart).await?;

    let task = form
        .task
        .unwrap_or_else(|| state.config.separation.default_task.clone());
    let model = models::require_model(&task)?;
    let file_name = sanitize_upload_name(&form.file_name)?;

    tokio::fs::create_dir_all(&state.paths.upload_dir).await?;
    let file_path = state.paths.upload_dir.join(&file_name);
    tokio::fs::write(&file_path, &form.data).await?;
    info!("已保存上传文件: {} ({} bytes)", file_path.display(), form.data.len());

    let basename = file_basename(&file_name);
    let codec = state.config.separation.output_codec.clone();
    let paths = download_paths(&basename, &model, &codec);

    let now = now_string();
    let job = JobRecord {
        id: generate_id(),
        filename: file_name,
        input_path: file_path.to_string_lossy().to_string(),
        input_sha256: sha256_hex(&form.data),
        task: model.id.clone(),
        output_dir: normalize_path(&format!("output/{}", basename)),
        status: JobStatus::Pending,
        progress: 0.0,
        error: None,
        duration: None,
        created_at: now.clone(),
        updated_at: now,
    };
    state.jobs.insert_job(&job)?;
    info!("已提交分轨任务: job_id={}, task={}", job.id, job.task);

    let job_id = job.id.clone();
    jobs::spawn_separation(state.clone(), job, model);

    Ok(Json(ProcessAudioResponse {
        message: ACCEPTED_MESSAGE.to_string(),
        download_paths: paths,
        job_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_paths_two_stems() {
        let model = models::require_model("spleeter:2stems").unwrap();
        assert_eq!(
            download_paths("song", &model, "wav"),
            vec!["output/song/vocals.wav", "output/song/accompaniment.wav"]
        );
    }

    #[test]
    fn test_download_paths_follow_codec_and_stems() {
        let model = models::require_model("spleeter:4stems").unwrap();
        let paths = download_paths("live set", &model, "mp3");
        assert_eq!(paths.len(), 4);
        assert_eq!(paths[3], "output/live set/other.mp3");
    }
}
