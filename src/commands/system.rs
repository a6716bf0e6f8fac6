// 系统命令：存活检查与外部依赖检查

use crate::audio::ffmpeg::tool_version;
use crate::audio::separator::resolve_separator_path;
use crate::error::{AppError, AppResult};
use crate::server::AppState;
use crate::utils::{hidden_command, DependencyCheck};
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

/// 存活检查
pub async fn ping() -> Json<Value> {
    Json(json!({ "status": "alive" }))
}

/// 检查外部依赖
pub async fn dependencies(State(state): State<AppState>) -> AppResult<Json<Vec<DependencyCheck>>> {
    let separator = state.config.separation.separator_path.clone();
    let checks = tokio::task::spawn_blocking(move || check_dependencies(separator.as_deref()))
        .await
        .map_err(|e| AppError::DependencyMissing(format!("依赖检查线程异常: {}", e)))?;
    Ok(Json(checks))
}

/// 依次检查 ffmpeg / ffprobe / 分轨程序
pub fn check_dependencies(separator_path: Option<&str>) -> Vec<DependencyCheck> {
    vec![
        check_tool("FFmpeg", "ffmpeg", "FFmpeg 未安装，请安装 FFmpeg 并添加到 PATH"),
        check_tool("FFprobe", "ffprobe", "FFprobe 未安装，请安装 FFmpeg 并添加到 PATH"),
        check_separator(separator_path),
    ]
}

/// 运行必需的依赖是否齐全（ffprobe 只用于读取时长，可缺失）
pub fn required_dependencies_ok(checks: &[DependencyCheck]) -> bool {
    checks
        .iter()
        .filter(|c| c.name != "FFprobe")
        .all(|c| c.available)
}

fn check_tool(name: &str, tool: &str, missing_message: &str) -> DependencyCheck {
    match tool_version(tool) {
        Some((version, path)) => DependencyCheck {
            name: name.to_string(),
            available: true,
            version: Some(version),
            path: Some(path),
            message: format!("{} 已安装", name),
        },
        None => DependencyCheck {
            name: name.to_string(),
            available: false,
            version: None,
            path: None,
            message: missing_message.to_string(),
        },
    }
}

fn check_separator(configured: Option<&str>) -> DependencyCheck {
    let separator_path = resolve_separator_path(configured);
    if let Ok(output) = hidden_command(&separator_path).arg("--version").output() {
        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let version = stdout
                .lines()
                .chain(stderr.lines())
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string);
            return DependencyCheck {
                name: "Spleeter".to_string(),
                available: true,
                version,
                path: Some(separator_path),
                message: "Spleeter 已安装".to_string(),
            };
        }
    }
    DependencyCheck {
        name: "Spleeter".to_string(),
        available: false,
        version: None,
        path: None,
        message: format!("未找到分轨程序 {}，请执行 pip install spleeter", separator_path),
    }
}

/// 探测运行中的服务，响应为 {"status": "alive"} 时返回 true
pub fn probe_health(url: &str, timeout: Duration) -> bool {
    let response = match ureq::get(url).timeout(timeout).call() {
        Ok(response) => response,
        Err(e) => {
            warn!("健康检查请求失败: {}", e);
            return false;
        }
    };

    response
        .into_string()
        .ok()
        .and_then(|body| serde_json::from_str::<Value>(&body).ok())
        .map(|body| body["status"] == "alive")
        .unwrap_or(false)
}
