// 配置管理模块

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// 配置文件名
pub const CONFIG_FILE_NAME: &str = "config.json";

/// 日志目录名（日志在读取配置前初始化，不放在 DataPaths 中）
pub const LOG_DIR_NAME: &str = "logs";

/// 日志级别
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    /// 转换为 tracing 过滤器字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// HTTP 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 允许的跨域来源，"*" 表示全部
    #[serde(default = "default_cors_origins")]
    pub cors_allow_origins: Vec<String>,
    /// 上传文件大小上限 (bytes)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_upload_bytes() -> usize {
    200 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_allow_origins: default_cors_origins(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// 分轨配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeparationConfig {
    /// 默认分轨配置
    #[serde(default = "default_task")]
    pub default_task: String,
    /// 输出编码
    #[serde(default = "default_output_codec")]
    pub output_codec: String,
    /// 同时运行的分轨任务上限
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// 分轨程序路径，未设置时从 PATH 查找
    #[serde(default)]
    pub separator_path: Option<String>,
    /// 预训练模型目录，未设置时使用 <data_dir>/pretrained_models
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
}

fn default_task() -> String {
    "spleeter:2stems".to_string()
}

fn default_output_codec() -> String {
    "wav".to_string()
}

fn default_max_concurrent_jobs() -> usize {
    (num_cpus::get() / 4).max(1)
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            default_task: default_task(),
            output_codec: default_output_codec(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            separator_path: None,
            model_dir: None,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP 服务配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 分轨配置
    #[serde(default)]
    pub separation: SeparationConfig,
    /// 日志级别
    #[serde(default)]
    pub log_level: LogLevel,
}

/// 数据目录下的各类路径
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub db_path: PathBuf,
    pub model_dir: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path, config: &AppConfig) -> Self {
        let model_dir = config
            .separation
            .model_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("pretrained_models"));

        Self {
            data_dir: data_dir.to_path_buf(),
            output_dir: data_dir.join("output"),
            upload_dir: data_dir.join("uploads"),
            db_path: data_dir.join("stemsplit.db"),
            model_dir,
        }
    }

    /// 创建运行所需的目录
    pub fn ensure_dirs(&self) -> AppResult<()> {
        for dir in [&self.data_dir, &self.output_dir, &self.upload_dir, &self.model_dir] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// 读取配置，文件不存在时写入默认配置
pub fn load_or_init(config_path: &Path) -> AppResult<AppConfig> {
    let config = if config_path.exists() {
        let content = fs::read_to_string(config_path)?;
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("配置文件 JSON 解析失败: {}，使用默认配置", e);
            AppConfig::default()
        })
    } else {
        let config = AppConfig::default();
        save(config_path, &config)?;
        config
    };

    validate(&config)?;
    info!("[CONFIG] 配置已加载: {}", config_path.display());
    Ok(config)
}

/// 写入配置文件
pub fn save(config_path: &Path, config: &AppConfig) -> AppResult<()> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(config_path, content)?;
    Ok(())
}

fn validate(config: &AppConfig) -> AppResult<()> {
    if config.separation.max_concurrent_jobs == 0 {
        return Err(AppError::Config("max_concurrent_jobs 必须大于 0".to_string()));
    }
    if config.separation.output_codec.trim().is_empty() {
        return Err(AppError::Config("output_codec 不能为空".to_string()));
    }
    Ok(())
}
