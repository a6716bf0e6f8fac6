// 工具模块

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Windows 下隐藏控制台窗口的标志
#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x08000000;

/// 创建一个隐藏控制台窗口的 Command（Windows 专用）
/// 在非 Windows 平台上等同于 Command::new
#[cfg(target_os = "windows")]
pub fn hidden_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.creation_flags(CREATE_NO_WINDOW);
    cmd
}

#[cfg(not(target_os = "windows"))]
pub fn hidden_command(program: &str) -> Command {
    Command::new(program)
}

/// 分轨结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparationResult {
    /// 结果目录 <output>/<basename>
    pub output_dir: String,
    /// 各音轨文件路径，顺序与模型音轨一致
    pub stem_paths: Vec<String>,
    /// 音频时长（秒），ffprobe 失败时为空
    pub duration: Option<f64>,
}

/// 上传接口响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessAudioResponse {
    pub message: String,
    pub download_paths: Vec<String>,
    pub job_id: String,
}

/// 依赖检查结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyCheck {
    pub name: String,
    pub available: bool,
    pub version: Option<String>,
    pub path: Option<String>,
    pub message: String,
}

/// 生成 UUID
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 当前本地时间字符串，与数据库默认值格式一致
pub fn now_string() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// 获取可执行文件所在目录
pub fn get_exe_dir() -> Option<PathBuf> {
    std::env::current_exe().ok()?.parent().map(|p| p.to_path_buf())
}

/// 解析程序路径，优先使用可执行文件旁的 ffmpeg 目录或同级文件
pub fn resolve_tool_path(tool_name: &str) -> String {
    let file_name = format!("{}{}", tool_name, std::env::consts::EXE_SUFFIX);
    if let Some(exe_dir) = get_exe_dir() {
        let tool_path = exe_dir.join("ffmpeg").join(&file_name);
        if tool_path.is_file() {
            return tool_path.to_string_lossy().to_string();
        }
        let tool_path = exe_dir.join(&file_name);
        if tool_path.is_file() {
            return tool_path.to_string_lossy().to_string();
        }
    }
    // 回退到系统 PATH
    tool_name.to_string()
}

/// 统一路径分隔符（Windows 客户端可能提交反斜杠路径）
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// 取上传文件名的最后一段，丢弃客户端提交的目录部分
pub fn sanitize_upload_name(file_name: &str) -> AppResult<String> {
    let normalized = normalize_path(file_name);
    let name = normalized
        .rsplit('/')
        .next()
        .map(str::trim)
        .unwrap_or_default();

    if name.is_empty() || name == "." || name == ".." {
        return Err(AppError::InvalidArgument("Invalid file name".to_string()));
    }
    Ok(name.to_string())
}

/// 去掉最后一个扩展名的文件名
pub fn file_basename(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string())
}

/// 计算 SHA256 十六进制摘要
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 根据扩展名猜测 Content-Type
pub fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "wav" => "audio/x-wav",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        "wma" => "audio/x-ms-wma",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_upload_name_strips_directories() {
        assert_eq!(sanitize_upload_name("song.mp3").unwrap(), "song.mp3");
        assert_eq!(sanitize_upload_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_upload_name("C:\\Users\\me\\track.wav").unwrap(), "track.wav");
    }

    #[test]
    fn test_sanitize_upload_name_rejects_empty() {
        assert!(sanitize_upload_name("").is_err());
        assert!(sanitize_upload_name("dir/").is_err());
        assert!(sanitize_upload_name("..").is_err());
    }

    #[test]
    fn test_file_basename() {
        assert_eq!(file_basename("song.mp3"), "song");
        assert_eq!(file_basename("my.song.final.wav"), "my.song.final");
        assert_eq!(file_basename("noext"), "noext");
    }

    #[test]
    fn test_sha256_hex() {
        let hash = sha256_hex(b"abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_guess_content_type() {
        assert_eq!(guess_content_type(Path::new("a/vocals.wav")), "audio/x-wav");
        assert_eq!(guess_content_type(Path::new("a/b.MP3")), "audio/mpeg");
        assert_eq!(guess_content_type(Path::new("a/b")), "application/octet-stream");
    }
}
