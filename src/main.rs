// StemSplit - 音频分轨 HTTP 服务
// 主入口文件

mod audio;
mod commands;
mod config;
mod database;
mod error;
mod logging;
mod models;
mod server;
mod utils;

use clap::{Parser, Subcommand};
use commands::models::{prefetch_models, DEFAULT_PREFETCH_TASKS};
use commands::system::{check_dependencies, probe_health, required_dependencies_ok};
use config::{AppConfig, DataPaths};
use database::JobStore;
use error::{AppError, AppResult};
use server::AppState;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

/// 健康检查超时
const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "stemsplit", version, about = "音频分轨（人声/伴奏）HTTP 服务")]
struct Cli {
    /// 数据目录（配置、数据库、上传、输出、模型缓存）
    #[arg(long, env = "STEMSPLIT_DATA_DIR", default_value = ".", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 启动 HTTP 服务
    Serve {
        /// 监听地址，默认取配置文件
        #[arg(long)]
        host: Option<String>,
        /// 监听端口，默认取配置文件
        #[arg(long)]
        port: Option<u16>,
    },
    /// 预热模型缓存
    Prefetch {
        /// 需要预热的分轨配置，可重复
        #[arg(long = "task")]
        tasks: Vec<String>,
        /// 任一模型失败即返回非零退出码
        #[arg(long)]
        strict: bool,
    },
    /// 检查外部依赖与模型缓存
    Check,
    /// 探测运行中的服务
    Healthcheck {
        #[arg(long, default_value = "http://127.0.0.1:8000/ping")]
        url: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve {
        host: None,
        port: None,
    });

    // 健康检查不写日志文件
    if let Command::Healthcheck { url } = &command {
        return if probe_health(url, HEALTHCHECK_TIMEOUT) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    // guard 必须保持存活，否则异步日志线程会退出
    let _log_guard = logging::init_logging(&cli.data_dir, &cli.data_dir.join(config::LOG_DIR_NAME));

    info!("StemSplit 启动中... 数据目录: {}", cli.data_dir.display());

    let config_path = cli.data_dir.join(config::CONFIG_FILE_NAME);
    let app_config = match config::load_or_init(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("配置初始化失败: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let paths = DataPaths::new(&cli.data_dir, &app_config);

    let result = match command {
        Command::Serve { host, port } => serve(app_config, paths, host, port).await,
        Command::Prefetch { tasks, strict } => prefetch(app_config, paths, tasks, strict).await,
        Command::Check => check(app_config, paths).await,
        Command::Healthcheck { .. } => Ok(ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("运行失败: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn serve(
    app_config: AppConfig,
    paths: DataPaths,
    host: Option<String>,
    port: Option<u16>,
) -> AppResult<ExitCode> {
    paths.ensure_dirs()?;

    let jobs = JobStore::open(&paths.db_path)?;
    let interrupted = jobs.fail_interrupted_jobs()?;
    if interrupted > 0 {
        warn!("{} 个未完成任务因重启被标记为失败", interrupted);
    }

    // 后台检查依赖，缺失时只告警
    let separator_path = app_config.separation.separator_path.clone();
    tokio::task::spawn_blocking(move || {
        for dep in check_dependencies(separator_path.as_deref()) {
            if !dep.available {
                warn!("{}: {}", dep.name, dep.message);
            }
        }
    });

    let host = host.unwrap_or_else(|| app_config.server.host.clone());
    let port = port.unwrap_or(app_config.server.port);
    let state = AppState::new(app_config, paths, jobs);

    server::run_server(state, &host, port).await?;
    Ok(ExitCode::SUCCESS)
}

async fn prefetch(
    app_config: AppConfig,
    paths: DataPaths,
    tasks: Vec<String>,
    strict: bool,
) -> AppResult<ExitCode> {
    let tasks = if tasks.is_empty() {
        DEFAULT_PREFETCH_TASKS.iter().map(|t| t.to_string()).collect()
    } else {
        tasks
    };

    let outcomes =
        tokio::task::spawn_blocking(move || prefetch_models(&app_config, &paths, &tasks, strict))
            .await
            .map_err(|e| AppError::Separation(format!("预热线程异常: {}", e)))??;

    for outcome in &outcomes {
        match &outcome.error {
            None => println!("{}: ok (cached: {})", outcome.model_id, outcome.downloaded),
            Some(err) => println!("{}: failed ({})", outcome.model_id, err),
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn check(app_config: AppConfig, paths: DataPaths) -> AppResult<ExitCode> {
    let separator_path = app_config.separation.separator_path.clone();
    let checks = tokio::task::spawn_blocking(move || check_dependencies(separator_path.as_deref()))
        .await
        .map_err(|e| AppError::DependencyMissing(format!("依赖检查线程异常: {}", e)))?;

    for dep in &checks {
        let mark = if dep.available { "ok" } else { "missing" };
        match &dep.version {
            Some(version) => println!("{:<10} {:<8} {}", dep.name, mark, version),
            None => println!("{:<10} {:<8} {}", dep.name, mark, dep.message),
        }
    }

    for status in models::get_all_models_status(&paths.model_dir) {
        let location = status.local_path.as_deref().unwrap_or("-");
        println!(
            "{:<18} cached={:<5} {} ({} bytes)",
            status.model_id, status.downloaded, location, status.size_bytes
        );
    }

    if required_dependencies_ok(&checks) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
