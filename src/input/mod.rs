/// 视频输入系统 (Video Input System)
///
/// 按扩展名选择输入:
/// - `.y4m`: 进程内 YUV4MPEG2 读取 (无外部依赖)
/// - 其他:   ffprobe 读取元数据 + ffmpeg 解码为 rawvideo rgb24 管道
///
/// 视频源是惰性、有限、不可重启的帧序列, 帧序号从 0 严格递增。
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::detection::{Frame, StreamInfo};

pub mod ffmpeg;
pub mod y4m;

pub use ffmpeg::{probe, FfmpegSource};
pub use y4m::Y4mReader;

/// 帧来源
pub trait FrameSource: Send {
    /// 打开时确定的流信息
    fn info(&self) -> &StreamInfo;

    /// 读取下一帧; `Ok(None)` 表示流结束
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// 释放底层句柄 (子进程/文件), 可重复调用
    fn close(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn info(&self) -> &StreamInfo {
        (**self).info()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// 把视频源适配为迭代器, 出错后停止
pub fn frames(source: &mut dyn FrameSource) -> impl Iterator<Item = Result<Frame>> + '_ {
    let mut done = false;
    std::iter::from_fn(move || {
        if done {
            return None;
        }
        match source.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                done = true;
                None
            }
            Err(e) => {
                done = true;
                Some(Err(e))
            }
        }
    })
}

/// 解码选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputOptions {
    /// ffmpeg 可执行文件
    pub ffmpeg: PathBuf,
    /// ffprobe 可执行文件
    pub ffprobe: PathBuf,
    /// 硬件解码 (`-hwaccel <name>`, 例如 cuda)
    pub hwaccel: Option<String>,
}

impl Default for InputOptions {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            hwaccel: None,
        }
    }
}

pub fn is_y4m(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("y4m"))
}

/// 打开视频源
pub fn open(path: &Path, options: &InputOptions) -> Result<Box<dyn FrameSource>> {
    if is_y4m(path) {
        Ok(Box::new(Y4mReader::open(path)?))
    } else {
        Ok(Box::new(FfmpegSource::open(path, options)?))
    }
}

/// 只读取视频参数, 不启动解码
pub fn stream_info(path: &Path, options: &InputOptions) -> Result<StreamInfo> {
    if is_y4m(path) {
        Ok(*Y4mReader::open(path)?.info())
    } else {
        probe(path, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing {
        info: StreamInfo,
        left: u32,
    }

    impl FrameSource for Failing {
        fn info(&self) -> &StreamInfo {
            &self.info
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.left == 0 {
                anyhow::bail!("corrupt frame");
            }
            self.left -= 1;
            Ok(Some(Frame::filled(0, 1, 1, [0, 0, 0])))
        }
    }

    #[test]
    fn test_frames_iterator_stops_after_error() {
        let mut src = Failing {
            info: StreamInfo::new(1, 1, 1.0),
            left: 2,
        };
        let items: Vec<_> = frames(&mut src).collect();
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
    }

    #[test]
    fn test_extension_dispatch() {
        assert!(is_y4m(Path::new("clip.Y4M")));
        assert!(!is_y4m(Path::new("clip.mp4")));
        assert!(!is_y4m(Path::new("y4m")));
    }
}
