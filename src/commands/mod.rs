// HTTP 命令模块

pub mod download;
pub mod jobs;
pub mod models;
pub mod process;
pub mod system;
