// 分轨模型管理模块

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// 分轨程序下载完成后写入的标记文件
const PROBE_FILE: &str = ".probe";

/// 分轨模型信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    /// 分轨配置标识，直接传给分轨程序的 -p 参数
    pub id: String,
    /// 显示名称
    pub name: String,
    /// 模型目录名 (<model_dir>/<dir_name>)
    pub dir_name: String,
    /// 输出音轨名，顺序即输出顺序
    pub stems: Vec<String>,
    /// 模型描述
    pub description: String,
}

impl ModelInfo {
    pub fn stem_count(&self) -> usize {
        self.stems.len()
    }
}

/// 模型缓存状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatus {
    pub model_id: String,
    pub downloaded: bool,
    pub local_path: Option<String>,
    /// 模型目录占用 (bytes)
    pub size_bytes: u64,
}

fn stems(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// 获取所有可用模型列表
pub fn get_available_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "spleeter:2stems".to_string(),
            name: "Spleeter 2 stems".to_string(),
            dir_name: "2stems".to_string(),
            stems: stems(&["vocals", "accompaniment"]),
            description: "人声 / 伴奏".to_string(),
        },
        ModelInfo {
            id: "spleeter:4stems".to_string(),
            name: "Spleeter 4 stems".to_string(),
            dir_name: "4stems".to_string(),
            stems: stems(&["vocals", "drums", "bass", "other"]),
            description: "人声 / 鼓 / 贝斯 / 其他".to_string(),
        },
        ModelInfo {
            id: "spleeter:5stems".to_string(),
            name: "Spleeter 5 stems".to_string(),
            dir_name: "5stems".to_string(),
            stems: stems(&["vocals", "drums", "bass", "piano", "other"]),
            description: "人声 / 鼓 / 贝斯 / 钢琴 / 其他".to_string(),
        },
    ]
}

/// 根据 ID 获取模型信息
pub fn get_model_by_id(model_id: &str) -> Option<ModelInfo> {
    get_available_models().into_iter().find(|m| m.id == model_id)
}

/// 根据 ID 获取模型信息，未知 ID 视为无效参数
pub fn require_model(model_id: &str) -> AppResult<ModelInfo> {
    get_model_by_id(model_id)
        .ok_or_else(|| AppError::InvalidArgument(format!("Unknown separation task: {}", model_id)))
}

pub fn get_model_dir(models_root: &Path, model: &ModelInfo) -> PathBuf {
    models_root.join(&model.dir_name)
}

/// 检查模型是否已下载
pub fn check_model_downloaded(models_root: &Path, model: &ModelInfo) -> ModelStatus {
    let model_dir = get_model_dir(models_root, model);
    let downloaded = model_dir.join(PROBE_FILE).is_file() || model_dir.join("checkpoint").is_file();

    ModelStatus {
        model_id: model.id.clone(),
        downloaded,
        local_path: downloaded.then(|| model_dir.to_string_lossy().to_string()),
        size_bytes: dir_size(&model_dir),
    }
}

/// 获取所有模型的状态
pub fn get_all_models_status(models_root: &Path) -> Vec<ModelStatus> {
    get_available_models()
        .iter()
        .map(|m| check_model_downloaded(models_root, m))
        .collect()
}

fn dir_size(dir: &Path) -> u64 {
    if !dir.exists() {
        return 0;
    }
    WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| fs::metadata(e.path()).ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let model = get_model_by_id("spleeter:4stems").unwrap();
        assert_eq!(model.stems, vec!["vocals", "drums", "bass", "other"]);
        assert_eq!(model.stem_count(), 4);
        assert!(get_model_by_id("spleeter:3stems").is_none());
        assert!(matches!(require_model("demucs"), Err(AppError::InvalidArgument(_))));
    }

    #[test]
    fn test_two_stems_order() {
        let model = require_model("spleeter:2stems").unwrap();
        assert_eq!(model.stems, vec!["vocals", "accompaniment"]);
    }

    #[test]
    fn test_download_status_from_probe_file() {
        let root = tempfile::tempdir().unwrap();
        let model = require_model("spleeter:2stems").unwrap();

        let status = check_model_downloaded(root.path(), &model);
        assert!(!status.downloaded);
        assert_eq!(status.size_bytes, 0);

        let dir = get_model_dir(root.path(), &model);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(PROBE_FILE), "OK").unwrap();
        fs::write(dir.join("model.data-00000-of-00001"), vec![0u8; 128]).unwrap();

        let status = check_model_downloaded(root.path(), &model);
        assert!(status.downloaded);
        assert_eq!(status.size_bytes, 130);
        assert!(status.local_path.is_some());
    }
}
