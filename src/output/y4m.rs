// YUV4MPEG2 写入: 固定尺寸与帧率, 只追加, 4:4:4 全范围

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use tracing::{debug, info};

use super::OutputSink;
use crate::detection::{Frame, StreamInfo};
use crate::utils::colorspace::rgb_to_yuv444;
use crate::utils::fps_to_rational;

pub struct Y4mWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    width: u32,
    height: u32,
    frames: u64,
    planes: Vec<u8>,
}

impl Y4mWriter {
    pub fn create(path: &Path, info: &StreamInfo) -> Result<Self> {
        ensure!(info.width > 0 && info.height > 0, "输出尺寸无效");
        let file = File::create(path).with_context(|| format!("创建 {}", path.display()))?;
        let mut writer = BufWriter::with_capacity(1 << 20, file);
        let (num, den) = fps_to_rational(info.fps);
        writeln!(
            writer,
            "YUV4MPEG2 W{} H{} F{}:{} Ip A1:1 C444 XCOLORRANGE=FULL",
            info.width, info.height, num, den
        )?;
        info!(
            "💾 y4m 输出: {} ({}x{} @ {}/{})",
            path.display(),
            info.width,
            info.height,
            num,
            den
        );
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            width: info.width,
            height: info.height,
            frames: 0,
            planes: Vec::new(),
        })
    }
}

impl OutputSink for Y4mWriter {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        ensure!(
            frame.width == self.width && frame.height == self.height,
            "帧尺寸 {}x{} 与输出 {}x{} 不一致",
            frame.width,
            frame.height,
            self.width,
            self.height
        );
        ensure!(frame.data.len() == frame.expected_len(), "帧数据长度错误");
        rgb_to_yuv444(&frame.data, &mut self.planes);
        self.writer.write_all(b"FRAME\n")?;
        self.writer.write_all(&self.planes)?;
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("写入 {}", self.path.display()))?;
        debug!("y4m 输出关闭: {} 帧", self.frames);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("y4m {}", self.path.display())
    }
}
