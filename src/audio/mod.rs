// 音频处理模块
//
// 子模块：
// - ffmpeg: 静音音频生成、时长读取、版本检测（调用 ffmpeg / ffprobe）
// - separator: 音轨分离（调用 spleeter，预训练模型）

pub mod ffmpeg;
pub mod separator;
