// 错误处理模块

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("FFmpeg 错误: {0}")]
    FFmpeg(String),

    #[error("分轨错误: {0}")]
    Separation(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("依赖缺失: {0}")]
    DependencyMissing(String),

    #[error("任务已取消")]
    Cancelled,

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("请求校验失败: {0}")]
    Validation(String),
}

impl AppError {
    /// HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 返回给客户端的 detail 文本
    /// 客户端可见的 4xx 错误只返回原始消息，不带分类前缀
    pub fn detail(&self) -> String {
        match self {
            AppError::NotFound(msg)
            | AppError::InvalidArgument(msg)
            | AppError::Validation(msg) => msg.clone(),
            AppError::Io(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

// 序列化为字符串，便于写入任务记录和 JSON 输出
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("请求处理失败: {}", self);
        }
        (status, Json(ErrorBody { detail: self.detail() })).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
