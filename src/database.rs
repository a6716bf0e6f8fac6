// 数据库模块 - 分轨任务记录

use crate::error::{AppError, AppResult};
use crate::utils::now_string;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// 是否已结束
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// 分轨任务记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub filename: String,
    pub input_path: String,
    pub input_sha256: String,
    pub task: String,
    /// 相对下载目录，如 output/song
    pub output_dir: String,
    pub status: JobStatus,
    pub progress: f32,
    pub error: Option<String>,
    pub duration: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

const JOB_COLUMNS: &str = "id, filename, input_path, input_sha256, task, output_dir, status, progress, error, duration, created_at, updated_at";

/// 仍可转换状态的任务条件，已结束的任务不会被覆盖
const ACTIVE_CONDITION: &str = "status IN ('pending', 'running')";

/// 任务存储
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// 打开数据库文件
    pub fn open(db_path: &Path) -> AppResult<Self> {
        let conn = Connection::open(db_path)?;
        info!("[DB] 数据库已打开: {}", db_path.display());
        Self::with_connection(conn)
    }

    /// 内存数据库，测试使用
    pub fn open_in_memory() -> AppResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AppResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                input_path TEXT NOT NULL,
                input_sha256 TEXT NOT NULL,
                task TEXT NOT NULL,
                output_dir TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                progress REAL NOT NULL DEFAULT 0,
                error TEXT,
                duration REAL,
                created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
            )",
            [],
        )?;

        // 创建时间索引（用于列表排序）
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at)",
            [],
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn get_conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // 持有锁的线程发生了 panic，连接仍可用但状态可能不完整
                error!("数据库 Mutex 被毒化：持有锁的线程发生 panic");
                warn!("尝试恢复毒化的 Mutex，后续操作可能不稳定");
                poisoned.into_inner()
            }
        }
    }

    /// 插入任务
    pub fn insert_job(&self, job: &JobRecord) -> AppResult<()> {
        let conn = self.get_conn();
        conn.execute(
            "INSERT INTO jobs (id, filename, input_path, input_sha256, task, output_dir, status, progress, error, duration, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.id,
                job.filename,
                job.input_path,
                job.input_sha256,
                job.task,
                job.output_dir,
                job.status.as_str(),
                job.progress,
                job.error,
                job.duration,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    }

    /// 获取单个任务
    pub fn get_job(&self, id: &str) -> AppResult<Option<JobRecord>> {
        let conn = self.get_conn();
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let job = conn.query_row(&sql, [id], row_to_job).optional()?;
        Ok(job)
    }

    /// 获取最近的任务
    pub fn list_jobs(&self, limit: usize) -> AppResult<Vec<JobRecord>> {
        let conn = self.get_conn();
        let sql = format!(
            "SELECT {} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let job_iter = stmt.query_map([limit as i64], row_to_job)?;

        let mut jobs = Vec::new();
        for job in job_iter {
            jobs.push(job?);
        }
        Ok(jobs)
    }

    /// 标记为运行中
    pub fn mark_running(&self, id: &str) -> AppResult<bool> {
        self.transition(id, JobStatus::Running, None)
    }

    /// 更新进度 (0.0 - 1.0)
    pub fn update_progress(&self, id: &str, progress: f32) -> AppResult<()> {
        let conn = self.get_conn();
        let sql = format!(
            "UPDATE jobs SET progress = ?1, updated_at = ?2 WHERE id = ?3 AND {}",
            ACTIVE_CONDITION
        );
        conn.execute(&sql, params![progress.clamp(0.0, 1.0), now_string(), id])?;
        Ok(())
    }

    /// 标记为完成
    pub fn mark_completed(&self, id: &str, duration: Option<f64>) -> AppResult<bool> {
        let conn = self.get_conn();
        let sql = format!(
            "UPDATE jobs SET status = 'completed', progress = 1.0, duration = ?1, error = NULL, updated_at = ?2
             WHERE id = ?3 AND {}",
            ACTIVE_CONDITION
        );
        let changed = conn.execute(&sql, params![duration, now_string(), id])?;
        Ok(changed > 0)
    }

    /// 标记为失败
    pub fn mark_failed(&self, id: &str, message: &str) -> AppResult<bool> {
        self.transition(id, JobStatus::Failed, Some(message))
    }

    /// 标记为已取消
    pub fn mark_cancelled(&self, id: &str) -> AppResult<bool> {
        self.transition(id, JobStatus::Cancelled, None)
    }

    /// 启动时调用：上次进程遗留的未结束任务全部标记为失败
    pub fn fail_interrupted_jobs(&self) -> AppResult<usize> {
        let conn = self.get_conn();
        let sql = format!(
            "UPDATE jobs SET status = 'failed', error = 'interrupted by restart', updated_at = ?1 WHERE {}",
            ACTIVE_CONDITION
        );
        let changed = conn.execute(&sql, params![now_string()])?;
        if changed > 0 {
            warn!("[DB] {} 个未完成的任务因服务重启被标记为失败", changed);
        }
        Ok(changed)
    }

    fn transition(&self, id: &str, status: JobStatus, message: Option<&str>) -> AppResult<bool> {
        let conn = self.get_conn();
        let sql = format!(
            "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4 AND {}",
            ACTIVE_CONDITION
        );
        let changed = conn.execute(&sql, params![status.as_str(), message, now_string(), id])?;
        Ok(changed > 0)
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let status: String = row.get(6)?;
    let status = JobStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            Box::new(AppError::Config(format!("未知任务状态: {}", status))),
        )
    })?;
    let progress: f64 = row.get(7)?;

    Ok(JobRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        input_path: row.get(2)?,
        input_sha256: row.get(3)?,
        task: row.get(4)?,
        output_dir: row.get(5)?,
        status,
        progress: progress as f32,
        error: row.get(8)?,
        duration: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}
