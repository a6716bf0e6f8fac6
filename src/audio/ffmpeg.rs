// FFmpeg 封装模块

use crate::error::{AppError, AppResult};
use crate::utils::{hidden_command, resolve_tool_path};
use std::fs;
use std::path::Path;
use std::process::Stdio;
use tracing::{error, info};

/// 静音音频采样率
const SILENCE_SAMPLE_RATE: u32 = 44100;

/// 生成静音 MP3（单声道 44.1kHz），用于预热分轨模型
pub fn generate_silence(output_path: &Path, seconds: f32) -> AppResult<()> {
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let ffmpeg_path = resolve_tool_path("ffmpeg");
    let source = format!("anullsrc=r={}:cl=mono", SILENCE_SAMPLE_RATE);
    let duration = format!("{}", seconds);

    info!("[FFMPEG] 生成 {} 秒静音音频: {}", seconds, output_path.display());

    let output = hidden_command(&ffmpeg_path)
        .args([
            "-y",
            "-f", "lavfi",
            "-i", &source,
            "-t", &duration,
            "-q:a", "9",
            "-acodec", "libmp3lame",
        ])
        .arg(output_path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| AppError::FFmpeg(format!("ffmpeg 执行失败: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("[FFMPEG] 生成静音音频失败: {}", stderr.trim());
        return Err(AppError::FFmpeg(format!(
            "生成静音音频失败，退出码: {:?}",
            output.status.code()
        )));
    }

    Ok(())
}

/// 获取音频时长（秒）
pub fn get_audio_duration(audio_path: &Path) -> AppResult<f64> {
    let ffprobe_path = resolve_tool_path("ffprobe");
    let output = hidden_command(&ffprobe_path)
        .args([
            "-v", "quiet",
            "-show_entries", "format=duration",
            "-of", "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(audio_path)
        .output()
        .map_err(|e| AppError::FFmpeg(format!("ffprobe 执行失败: {}", e)))?;

    if !output.status.success() {
        return Err(AppError::FFmpeg("ffprobe 获取时长失败".to_string()));
    }

    parse_duration(&String::from_utf8_lossy(&output.stdout))
}

fn parse_duration(stdout: &str) -> AppResult<f64> {
    stdout
        .trim()
        .parse::<f64>()
        .map_err(|_| AppError::FFmpeg("解析音频时长失败".to_string()))
}

/// 获取工具版本（-version 输出的第一行）
pub fn tool_version(tool_name: &str) -> Option<(String, String)> {
    let tool_path = resolve_tool_path(tool_name);
    let output = hidden_command(&tool_path).arg("-version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .next()
        .map(|line| (line.trim().to_string(), tool_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert!((parse_duration("12.345000\n").unwrap() - 12.345).abs() < 1e-9);
        assert!(parse_duration("N/A").is_err());
        assert!(parse_duration("").is_err());
    }
}
