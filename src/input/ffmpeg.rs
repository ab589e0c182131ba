// ffmpeg 解码子进程
//
// ffprobe 读取元数据, ffmpeg 把视频解码为 rawvideo rgb24 写到 stdout,
// 这里按帧大小逐帧读取。子进程在读完、出错或 drop 时都会被回收。

use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{FrameSource, InputOptions};
use crate::detection::{Frame, StreamInfo};
use crate::utils::parse_rational;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

/// 解析 `ffprobe -of json` 的输出
pub fn parse_probe_json(json: &str) -> Result<StreamInfo> {
    let out: ProbeOutput = serde_json::from_str(json).context("解析 ffprobe 输出")?;
    let stream = out.streams.into_iter().next().context("没有视频流")?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => bail!("视频流缺少尺寸信息"),
    };
    let fps = [stream.avg_frame_rate, stream.r_frame_rate]
        .iter()
        .flatten()
        .filter_map(|s| parse_rational(s))
        .find(|fps| *fps > 0.0)
        .unwrap_or(0.0);
    let mut info = StreamInfo::new(width, height, fps);
    info.frame_count = stream.nb_frames.and_then(|n| n.parse().ok());
    Ok(info)
}

/// 用 ffprobe 读取视频流信息
pub fn probe(path: &Path, options: &InputOptions) -> Result<StreamInfo> {
    let output = Command::new(&options.ffprobe)
        .args(["-v", "error", "-select_streams", "v:0", "-show_entries"])
        .arg("stream=width,height,r_frame_rate,avg_frame_rate,nb_frames")
        .args(["-of", "json"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("启动 {} 失败", options.ffprobe.display()))?;
    if !output.status.success() {
        bail!(
            "ffprobe {} 失败 ({}): {}",
            path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    parse_probe_json(&String::from_utf8_lossy(&output.stdout))
        .with_context(|| format!("读取 {} 的元数据", path.display()))
}

pub struct FfmpegSource {
    child: Option<Child>,
    stdout: Option<BufReader<ChildStdout>>,
    info: StreamInfo,
    next_index: u64,
}

impl FfmpegSource {
    pub fn open(path: &Path, options: &InputOptions) -> Result<Self> {
        if !path.exists() {
            bail!("输入文件不存在: {}", path.display());
        }
        let info = probe(path, options)?;

        let mut cmd = Command::new(&options.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        if let Some(hwaccel) = &options.hwaccel {
            cmd.arg("-hwaccel").arg(hwaccel);
        }
        cmd.arg("-i")
            .arg(path)
            .args(["-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "-"]);

        let source = Self::spawn(cmd, info)?;
        info!(
            "🎞  ffmpeg 输入: {} ({}x{} @ {:.2}fps, {} 帧)",
            path.display(),
            info.width,
            info.height,
            info.fps,
            info.frame_count
                .map_or_else(|| "未知".to_string(), |n| n.to_string())
        );
        Ok(source)
    }

    /// 启动任意输出 rawvideo rgb24 的解码命令
    pub fn spawn(mut cmd: Command, info: StreamInfo) -> Result<Self> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("启动解码进程失败")?;
        let stdout = child.stdout.take().context("解码进程没有 stdout")?;
        Ok(Self {
            child: Some(child),
            stdout: Some(BufReader::with_capacity(info.frame_bytes().min(1 << 22), stdout)),
            info,
            next_index: 0,
        })
    }

    /// 读完后检查解码进程的退出状态
    fn finish(&mut self) -> Result<()> {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let status = child.wait().context("等待解码进程")?;
            debug!("解码进程退出: {status}");
            if !status.success() {
                bail!("解码进程异常退出 ({status}), 已读取 {} 帧", self.next_index);
            }
        }
        Ok(())
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };
        let mut data = vec![0u8; self.info.frame_bytes()];
        let filled = read_full(stdout, &mut data).context("读取解码输出")?;
        if filled == 0 {
            self.finish()?;
            return Ok(None);
        }
        if filled < data.len() {
            self.close();
            bail!(
                "第 {} 帧数据不完整 ({}/{} 字节)",
                self.next_index,
                filled,
                data.len()
            );
        }

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(
            Frame::new(index, self.info.width, self.info.height, data)
                .with_timestamp(self.info.timestamp(index)),
        ))
    }

    fn close(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill() {
                    warn!("⚠️  结束解码进程失败: {e}");
                }
            }
            let _ = child.wait();
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// 尽量填满 buf, 返回实际读取的字节数 (到达 EOF 时可能不足)
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
