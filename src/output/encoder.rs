// 编码管道: 原始 RGB 帧写入 ffmpeg stdin, 由 ffmpeg 硬件编码
//
// 结束时先关闭 stdin (编码器据此冲刷剩余帧), 再等待进程退出。

use std::ffi::OsString;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};

use anyhow::{bail, ensure, Context, Result};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{EncoderSettings, OutputSink};
use crate::detection::{Frame, StreamInfo};
use crate::utils::fps_to_rational;

static HW_ENCODER: OnceCell<String> = OnceCell::new();

/// 探测可用的 H.264 编码器
/// 优先级: NVENC (NVIDIA) > QSV (Intel) > libx264
fn detect_encoder(program: &Path) -> String {
    HW_ENCODER
        .get_or_init(|| {
            for encoder in ["h264_nvenc", "h264_qsv"] {
                let ok = Command::new(program)
                    .args(["-hide_banner", "-loglevel", "error"])
                    .args(["-f", "lavfi", "-i", "nullsrc=s=256x256:d=0.1"])
                    .args(["-c:v", encoder, "-frames:v", "1", "-f", "null", "-"])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .map(|s| s.success())
                    .unwrap_or(false);
                if ok {
                    info!("🚀 检测到硬件编码器: {encoder}");
                    return encoder.to_string();
                }
            }
            info!("未检测到硬件编码器, 使用 libx264");
            "libx264".to_string()
        })
        .clone()
}

/// ffmpeg 编码参数
pub fn encoder_args(
    output: &Path,
    info: &StreamInfo,
    settings: &EncoderSettings,
    codec: &str,
) -> Vec<OsString> {
    let (num, den) = fps_to_rational(info.fps);
    let mut args: Vec<OsString> = [
        "-y",
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "rawvideo",
        "-vcodec",
        "rawvideo",
        "-s",
    ]
    .iter()
    .map(OsString::from)
    .collect();
    args.push(format!("{}x{}", info.width, info.height).into());
    args.extend(["-pix_fmt", "rgb24", "-r"].map(OsString::from));
    args.push(format!("{num}/{den}").into());
    args.extend(["-i", "-", "-c:v"].map(OsString::from));
    args.push(codec.into());
    if !settings.preset.is_empty() {
        args.push("-preset".into());
        args.push(settings.preset.as_str().into());
    }
    if !settings.bitrate.is_empty() {
        args.push("-b:v".into());
        args.push(settings.bitrate.as_str().into());
    }
    args.extend(["-pix_fmt", "yuv420p"].map(OsString::from));
    args.push(output.as_os_str().to_owned());
    args
}

pub struct EncoderPipe {
    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
    label: String,
    width: u32,
    height: u32,
    frames: u64,
}

impl EncoderPipe {
    /// 启动 ffmpeg 编码进程
    pub fn ffmpeg(output: &Path, info: &StreamInfo, settings: &EncoderSettings) -> Result<Self> {
        let codec = if settings.codec == "auto" {
            detect_encoder(&settings.program)
        } else {
            settings.codec.clone()
        };
        let mut cmd = Command::new(&settings.program);
        cmd.args(encoder_args(output, info, settings, &codec));
        let pipe = Self::spawn(cmd, info, format!("{codec} → {}", output.display()))?;
        info!(
            "🎬 编码输出: {} ({codec}, preset {}, {})",
            output.display(),
            settings.preset,
            settings.bitrate
        );
        Ok(pipe)
    }

    /// 启动任意从 stdin 读取原始帧的编码命令
    pub fn spawn(mut cmd: Command, info: &StreamInfo, label: String) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("启动编码进程失败 ({label})"))?;
        let stdin = child.stdin.take().context("编码进程没有 stdin")?;
        Ok(Self {
            child: Some(child),
            stdin: Some(BufWriter::with_capacity(1 << 20, stdin)),
            label,
            width: info.width,
            height: info.height,
            frames: 0,
        })
    }

    /// 关闭 stdin 并等待编码进程
    fn shutdown(&mut self) -> Result<Option<ExitStatus>> {
        let flushed = match self.stdin.take() {
            Some(mut stdin) => stdin.flush().context("冲刷编码管道"),
            None => Ok(()),
        };
        let status = match self.child.take() {
            Some(mut child) => Some(child.wait().context("等待编码进程")?),
            None => None,
        };
        flushed?;
        Ok(status)
    }
}

impl OutputSink for EncoderPipe {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        ensure!(
            frame.width == self.width && frame.height == self.height,
            "帧尺寸 {}x{} 与编码器 {}x{} 不一致",
            frame.width,
            frame.height,
            self.width,
            self.height
        );
        let stdin = self.stdin.as_mut().context("编码管道已关闭")?;
        stdin
            .write_all(&frame.data)
            .with_context(|| format!("写入编码进程 (第 {} 帧)", frame.index))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let status = self.shutdown()?;
        debug!("编码进程退出: {status:?}, 共 {} 帧", self.frames);
        if let Some(status) = status {
            if !status.success() {
                bail!("编码进程异常退出 ({status})");
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

impl Drop for EncoderPipe {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(e) = self.shutdown() {
                warn!("⚠️  关闭编码进程: {e:#}");
            }
        }
    }
}
