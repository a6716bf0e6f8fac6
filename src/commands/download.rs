// 下载命令：只允许访问 output 目录下的文件

use crate::error::{AppError, AppResult};
use crate::server::AppState;
use crate::utils::{guess_content_type, normalize_path};
use axum::extract::{Path as UrlPath, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// 下载路径必须带的前缀
const OUTPUT_PREFIX: &str = "output/";

fn invalid_path() -> AppError {
    AppError::InvalidArgument("Invalid file path".to_string())
}

fn not_found() -> AppError {
    AppError::NotFound("File not found".to_string())
}

/// 把请求路径映射到 output 目录下的文件路径
///
/// 只接受 output/ 开头、且只由普通路径段组成的相对路径
pub fn resolve_download_path(output_base: &Path, full_path: &str) -> AppResult<PathBuf> {
    let normalized = normalize_path(full_path);
    let relative = normalized
        .strip_prefix(OUTPUT_PREFIX)
        .ok_or_else(invalid_path)?;

    let relative = Path::new(relative);
    if relative.as_os_str().is_empty()
        || relative.components().any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(invalid_path());
    }

    Ok(output_base.join(relative))
}

/// 下载分轨结果
pub async fn download_file(
    State(state): State<AppState>,
    UrlPath(full_path): UrlPath<String>,
) -> AppResult<Response> {
    let output_base = &state.paths.output_dir;
    let path = resolve_download_path(output_base, &full_path)?;

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(not_found()),
    }

    // 解析符号链接后仍需位于 output 目录内
    let resolved = tokio::fs::canonicalize(&path).await?;
    let allowed_base = tokio::fs::canonicalize(output_base).await?;
    if !resolved.starts_with(&allowed_base) {
        warn!("拒绝访问 output 目录外的文件: {}", resolved.display());
        return Err(invalid_path());
    }

    let data = tokio::fs::read(&resolved).await?;
    debug!("下载文件: {} ({} bytes)", resolved.display(), data.len());

    Ok(([(header::CONTENT_TYPE, guess_content_type(&resolved))], data).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_valid_path() {
        let base = Path::new("/app/output");
        assert_eq!(
            resolve_download_path(base, "output/song/vocals.wav").unwrap(),
            PathBuf::from("/app/output/song/vocals.wav")
        );
        assert_eq!(
            resolve_download_path(base, "output\\song\\vocals.wav").unwrap(),
            PathBuf::from("/app/output/song/vocals.wav")
        );
    }

    #[test]
    fn test_reject_outside_prefix() {
        let base = Path::new("/app/output");
        for bad in [
            "config.json",
            "outputs/x.wav",
            "/output/x.wav",
            "output/",
            "output/../stemsplit.db",
            "output/song/../../config.json",
            "output//etc/passwd",
            "output/./x.wav",
        ] {
            let err = resolve_download_path(base, bad).unwrap_err();
            assert_eq!(err.detail(), "Invalid file path", "path: {}", bad);
        }
    }
}
