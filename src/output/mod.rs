/// 视频输出 (Output sinks)
///
/// - `Y4mWriter`:   进程内容器写入 (.y4m), 持有文件句柄
/// - `EncoderPipe`: ffmpeg 编码子进程, 原始帧写入其 stdin
///
/// 输出端在流水线启动时创建一次, 结束时 `finish` 恰好一次 (按值消费)。
/// 提前 drop 时同样会关闭文件/回收子进程。
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::detection::{Frame, StreamInfo};

pub mod encoder;
pub mod y4m;

pub use encoder::EncoderPipe;
pub use y4m::Y4mWriter;

/// 输出端
pub trait OutputSink: Send {
    /// 按顺序写入一帧 (RGB24, 尺寸与创建时一致)
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// 刷新并关闭; 编码管道会关闭 stdin 并等待编码进程退出
    fn finish(self: Box<Self>) -> Result<()>;

    /// 日志用描述
    fn describe(&self) -> String;
}

/// 输出类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// 按扩展名选择: .y4m → 容器写入, 其他 → 编码管道
    #[default]
    Auto,
    Container,
    Encoder,
}

/// 编码参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// ffmpeg 可执行文件
    pub program: PathBuf,
    /// 视频编码器; `auto` 表示探测硬件编码器, 找不到时用 libx264
    pub codec: String,
    pub preset: String,
    pub bitrate: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            codec: "h264_nvenc".to_string(),
            preset: "fast".to_string(),
            bitrate: "20M".to_string(),
        }
    }
}

/// 创建输出端
pub fn open(
    path: &Path,
    info: &StreamInfo,
    kind: SinkKind,
    settings: &EncoderSettings,
) -> Result<Box<dyn OutputSink>> {
    let container = match kind {
        SinkKind::Auto => crate::input::is_y4m(path),
        SinkKind::Container => true,
        SinkKind::Encoder => false,
    };
    if container {
        Ok(Box::new(Y4mWriter::create(path, info)?))
    } else {
        Ok(Box::new(EncoderPipe::ffmpeg(path, info, settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_defaults() {
        let s = EncoderSettings::default();
        assert_eq!(s.codec, "h264_nvenc");
        assert_eq!(s.preset, "fast");
        assert_eq!(s.bitrate, "20M");
    }

    #[test]
    fn test_open_container_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.y4m");
        let info = StreamInfo::new(2, 2, 30.0);
        let sink = open(&path, &info, SinkKind::Auto, &EncoderSettings::default()).unwrap();
        assert!(sink.describe().contains("y4m"));
        sink.finish().unwrap();
        assert!(path.exists());
    }
}
