// 分轨模块 - 调用 spleeter 命令行

use crate::audio::ffmpeg::get_audio_duration;
use crate::commands::jobs::ProcessRegistry;
use crate::error::{AppError, AppResult};
use crate::models::ModelInfo;
use crate::utils::{file_basename, hidden_command, resolve_tool_path, SeparationResult};
use crossbeam_channel::RecvTimeoutError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 分轨程序写完一个音轨时的日志，程序本身拼写为 "succesfully"
static WRITTEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"File\s+(.+?)\s+written\s+succ?essfully").unwrap());

/// 失败时保留的错误输出长度
const ERROR_TAIL_CHARS: usize = 500;

/// 错误输出缓存上限（bytes）
const MAX_ERROR_OUTPUT: usize = 64 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 进度回调类型
pub type ProgressCallback = Box<dyn Fn(f32, &str) + Send + Sync>;

/// 分轨请求
pub struct SeparationRequest<'a> {
    pub input_path: &'a Path,
    /// 输出根目录，结果写入 <output_base>/<basename>/
    pub output_base: &'a Path,
    pub model: &'a ModelInfo,
    pub codec: &'a str,
    /// 预训练模型缓存目录，通过 MODEL_PATH 传给分轨程序
    pub model_dir: &'a Path,
    pub separator_path: Option<&'a str>,
}

impl SeparationRequest<'_> {
    /// 结果目录
    pub fn stem_dir(&self) -> PathBuf {
        let name = self
            .input_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.output_base.join(file_basename(&name))
    }

    /// 预期的音轨文件路径
    pub fn expected_stems(&self) -> Vec<PathBuf> {
        let dir = self.stem_dir();
        self.model
            .stems
            .iter()
            .map(|stem| dir.join(format!("{}.{}", stem, self.codec)))
            .collect()
    }

    fn args(&self) -> Vec<String> {
        vec![
            "separate".to_string(),
            "-p".to_string(),
            self.model.id.clone(),
            "-o".to_string(),
            self.output_base.to_string_lossy().to_string(),
            "-c".to_string(),
            self.codec.to_string(),
            self.input_path.to_string_lossy().to_string(),
        ]
    }
}

/// 解析分轨程序路径，配置优先，否则查找打包版本或 PATH
pub fn resolve_separator_path(configured: Option<&str>) -> String {
    match configured {
        Some(path) if !path.trim().is_empty() => path.to_string(),
        _ => resolve_tool_path("spleeter"),
    }
}

/// 错误输出与进度跟踪
struct OutputTracker {
    stem_count: usize,
    written: usize,
    /// 最近的错误输出行，超出上限时丢弃最早的行
    error_lines: VecDeque<String>,
    error_bytes: usize,
}

impl OutputTracker {
    fn new(stem_count: usize) -> Self {
        Self {
            stem_count: stem_count.max(1),
            written: 0,
            error_lines: VecDeque::new(),
            error_bytes: 0,
        }
    }

    /// 处理一行输出，写完一个音轨时返回新的进度
    fn handle_line(&mut self, line: &str) -> Option<f32> {
        let line = line.trim_end();
        if line.is_empty() {
            return None;
        }
        debug!("spleeter stderr: {}", line);

        self.error_bytes += line.len() + 1;
        self.error_lines.push_back(line.to_string());
        while self.error_bytes > MAX_ERROR_OUTPUT && self.error_lines.len() > 1 {
            if let Some(dropped) = self.error_lines.pop_front() {
                self.error_bytes -= dropped.len() + 1;
            }
        }

        if WRITTEN_REGEX.is_match(line) {
            self.written = (self.written + 1).min(self.stem_count);
            return Some(self.written as f32 / self.stem_count as f32);
        }
        None
    }

    fn has_error_output(&self) -> bool {
        !self.error_lines.is_empty()
    }

    fn error_output(&self) -> String {
        self.error_lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 错误输出末尾部分（Python 异常信息在最后）
    fn error_tail(&self) -> String {
        let output = self.error_output();
        let chars: Vec<char> = output.chars().collect();
        let start = chars.len().saturating_sub(ERROR_TAIL_CHARS);
        chars[start..].iter().collect()
    }
}

/// 执行分轨
pub fn separate_stems(
    request: &SeparationRequest<'_>,
    progress_callback: Option<ProgressCallback>,
    cancel_flag: Arc<AtomicBool>,
    registry: &ProcessRegistry,
    job_id: &str,
) -> AppResult<SeparationResult> {
    info!("=== 开始分轨 ({}) ===", request.model.id);
    info!("音频路径: {}", request.input_path.display());
    info!("输出目录: {}", request.output_base.display());

    if !request.input_path.is_file() {
        error!("音频文件不存在: {}", request.input_path.display());
        return Err(AppError::NotFound(format!(
            "音频文件不存在: {}",
            request.input_path.display()
        )));
    }

    std::fs::create_dir_all(request.output_base)?;
    std::fs::create_dir_all(request.model_dir)?;

    if let Some(ref cb) = progress_callback {
        cb(0.0, "启动分轨程序...");
    }

    let separator_path = resolve_separator_path(request.separator_path);
    let args = request.args();
    info!("分轨命令: {} {}", separator_path, args.join(" "));

    let child = hidden_command(&separator_path)
        .args(&args)
        .env("MODEL_PATH", request.model_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            error!("启动分轨程序失败: {}", e);
            AppError::Separation(format!("启动分轨程序失败 ({}): {}", separator_path, e))
        })?;

    // 注册子进程句柄，取消时可直接 kill
    let child_handle = registry.register_child(job_id, child);

    let stderr = child_handle
        .lock()
        .as_mut()
        .and_then(|child| child.stderr.take())
        .ok_or_else(|| AppError::Separation("无法获取分轨程序错误输出流".into()))?;

    // 独立线程读取 stderr，避免管道写满阻塞子进程
    let (tx, rx) = crossbeam_channel::unbounded::<String>();
    std::thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut tracker = OutputTracker::new(request.model.stem_count());
    let report = |tracker: &mut OutputTracker, line: &str| {
        if let Some(progress) = tracker.handle_line(line) {
            debug!("分轨进度: {:.1}%", progress * 100.0);
            if let Some(ref cb) = progress_callback {
                cb(progress, line);
            }
        }
    };

    let status = loop {
        if cancel_flag.load(Ordering::SeqCst) {
            info!("[SEPARATOR] 分轨被取消: job_id={}", job_id);
            if let Some(ref mut child) = *child_handle.lock() {
                let _ = child.kill();
                let _ = child.wait();
            }
            return Err(AppError::Cancelled);
        }

        let stream_closed = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                report(&mut tracker, &line);
                false
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => true,
        };

        let try_wait_result = match *child_handle.lock() {
            Some(ref mut child) => child.try_wait(),
            // 句柄已被清理
            None => return Err(AppError::Cancelled),
        };

        match try_wait_result {
            Ok(Some(status)) => {
                // 读到 EOF 为止，管道中剩余的输出包含最终的异常信息
                for line in rx.iter() {
                    report(&mut tracker, &line);
                }
                break status;
            }
            Ok(None) => {
                if stream_closed {
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
            Err(e) => {
                error!("检查进程状态失败: {}", e);
                if let Some(ref mut child) = *child_handle.lock() {
                    let _ = child.kill();
                }
                return Err(AppError::Separation(format!("检查进程状态失败: {}", e)));
            }
        }
    };

    info!("分轨程序退出码: {:?}", status.code());

    if cancel_flag.load(Ordering::SeqCst) {
        return Err(AppError::Cancelled);
    }

    if !status.success() {
        error!("分轨失败，退出码: {:?}", status.code());
        error!("分轨错误输出: {}", tracker.error_output());
        let error_msg = if !tracker.has_error_output() {
            "分轨失败（无详细错误信息）".to_string()
        } else {
            format!("分轨失败: {}", tracker.error_tail())
        };
        return Err(AppError::Separation(error_msg));
    }

    let stem_paths = request.expected_stems();
    let missing: Vec<String> = stem_paths
        .iter()
        .filter(|p| !p.is_file())
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    if !missing.is_empty() {
        error!("音轨文件缺失: {:?}", missing);
        return Err(AppError::Separation(format!("音轨文件缺失: {:?}", missing)));
    }

    if let Some(ref cb) = progress_callback {
        cb(1.0, "分轨完成");
    }

    let duration = match stem_paths.first().map(|p| get_audio_duration(p)) {
        Some(Ok(d)) => Some(d),
        Some(Err(e)) => {
            warn!("获取音轨时长失败: {}", e);
            None
        }
        None => None,
    };

    info!("分轨完成: {}", request.stem_dir().display());

    Ok(SeparationResult {
        output_dir: request.stem_dir().to_string_lossy().to_string(),
        stem_paths: stem_paths
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect(),
        duration,
    })
}
