// YUV4MPEG2 (.y4m) 读取
//
// 文件头: `YUV4MPEG2 W1920 H1080 F30000:1001 Ip A1:1 C420jpeg\n`
// 每帧:   `FRAME[ 参数]\n` + Y/U/V 平面

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use super::FrameSource;
use crate::detection::{Frame, StreamInfo};
use crate::utils::colorspace::{yuv_frame_len, yuv_planar_to_rgb};

const MAGIC: &str = "YUV4MPEG2";
const MAX_LINE: usize = 4096;

/// 色度格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chroma {
    C444,
    C420,
    Mono,
}

impl Chroma {
    fn parse(tag: &str) -> Result<Self> {
        match tag {
            "444" => Ok(Chroma::C444),
            "420" | "420jpeg" | "420paldv" | "420mpeg2" => Ok(Chroma::C420),
            "mono" => Ok(Chroma::Mono),
            other => bail!("不支持的 y4m 色度格式: C{other}"),
        }
    }

    fn subsampling(self) -> (usize, usize) {
        match self {
            Chroma::C420 => (2, 2),
            _ => (1, 1),
        }
    }

    fn frame_len(self, width: usize, height: usize) -> usize {
        match self {
            Chroma::Mono => width * height,
            _ => yuv_frame_len(width, height, self.subsampling()),
        }
    }
}

pub struct Y4mReader<R = BufReader<File>> {
    reader: Option<R>,
    info: StreamInfo,
    chroma: Chroma,
    next_index: u64,
    raw: Vec<u8>,
}

impl Y4mReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("打开 {}", path.display()))?;
        let reader = Self::from_reader(BufReader::new(file))
            .with_context(|| format!("解析 {}", path.display()))?;
        info!(
            "🎞  y4m 输入: {} ({}x{} @ {:.2}fps, {:?})",
            path.display(),
            reader.info.width,
            reader.info.height,
            reader.info.fps,
            reader.chroma
        );
        Ok(reader)
    }
}

impl<R: BufRead + Send> Y4mReader<R> {
    pub fn from_reader(mut reader: R) -> Result<Self> {
        let header = read_line(&mut reader)?.context("空文件, 缺少 y4m 文件头")?;
        let mut tokens = header.split_ascii_whitespace();
        if tokens.next() != Some(MAGIC) {
            bail!("不是 y4m 文件 (缺少 {MAGIC})");
        }

        let (mut width, mut height, mut fps) = (0u32, 0u32, 0f64);
        let mut chroma = Chroma::C420;
        for token in tokens {
            let mut chars = token.chars();
            let tag = chars.next();
            let value = chars.as_str();
            match tag {
                Some('W') => width = value.parse().context("宽度")?,
                Some('H') => height = value.parse().context("高度")?,
                Some('F') => {
                    let (n, d) = value.split_once(':').context("帧率格式")?;
                    let (n, d): (f64, f64) = (n.parse()?, d.parse()?);
                    if d > 0.0 {
                        fps = n / d;
                    }
                }
                Some('C') => chroma = Chroma::parse(value)?,
                _ => debug!("忽略 y4m 参数 {token}"),
            }
        }
        if width == 0 || height == 0 {
            bail!("y4m 文件头缺少尺寸: {header}");
        }

        Ok(Self {
            reader: Some(reader),
            info: StreamInfo::new(width, height, fps),
            chroma,
            next_index: 0,
            raw: Vec::new(),
        })
    }
}

impl<R: BufRead + Send> FrameSource for Y4mReader<R> {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let Some(line) = read_line(reader)? else {
            self.close();
            return Ok(None);
        };
        if !line.starts_with("FRAME") {
            bail!("第 {} 帧: 帧头损坏 ({line:?})", self.next_index);
        }

        let (w, h) = (self.info.width as usize, self.info.height as usize);
        self.raw.resize(self.chroma.frame_len(w, h), 0);
        if let Err(e) = reader.read_exact(&mut self.raw) {
            if e.kind() == ErrorKind::UnexpectedEof {
                bail!("第 {} 帧数据不完整 (文件被截断)", self.next_index);
            }
            return Err(e).context("读取 y4m 帧");
        }

        let mut rgb = Vec::new();
        match self.chroma {
            Chroma::Mono => rgb.extend(self.raw.iter().flat_map(|&y| [y, y, y])),
            chroma => yuv_planar_to_rgb(&self.raw, w, h, chroma.subsampling(), &mut rgb),
        }

        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(
            Frame::new(index, self.info.width, self.info.height, rgb)
                .with_timestamp(self.info.timestamp(index)),
        ))
    }

    fn close(&mut self) {
        self.reader = None;
    }
}

/// 读取一行 (不含换行); 到达文件末尾返回 None
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    let n = reader
        .by_ref()
        .take(MAX_LINE as u64)
        .read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        bail!("y4m 行过长或被截断");
    }
    buf.pop();
    Ok(Some(String::from_utf8(buf).context("y4m 行不是合法文本")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn y4m_bytes(header: &str, frames: &[&[u8]]) -> Vec<u8> {
        let mut out = format!("{header}\n").into_bytes();
        for f in frames {
            out.extend_from_slice(b"FRAME\n");
            out.extend_from_slice(f);
        }
        out
    }

    #[test]
    fn test_read_420_frames() {
        // 2x2, 4 字节亮度 + 1 + 1 色度
        let frame = [50u8, 60, 70, 80, 128, 128];
        let data = y4m_bytes("YUV4MPEG2 W2 H2 F25:1 Ip A1:1 C420jpeg", &[&frame, &frame]);
        let mut r = Y4mReader::from_reader(Cursor::new(data)).unwrap();
        assert_eq!(r.info().fps, 25.0);

        let f0 = r.next_frame().unwrap().unwrap();
        assert_eq!(f0.index, 0);
        assert_eq!(f0.data, vec![50, 50, 50, 60, 60, 60, 70, 70, 70, 80, 80, 80]);
        let f1 = r.next_frame().unwrap().unwrap();
        assert_eq!(f1.index, 1);
        assert_eq!(f1.timestamp, Some(0.04));
        assert!(r.next_frame().unwrap().is_none());
        assert!(r.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_default_chroma_is_420() {
        let data = y4m_bytes("YUV4MPEG2 W2 H2 F30:1", &[&[0, 0, 0, 0, 128, 128]]);
        let mut r = Y4mReader::from_reader(Cursor::new(data)).unwrap();
        assert!(r.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let mut data = y4m_bytes("YUV4MPEG2 W2 H2 F30:1 C444", &[&[0u8; 12]]);
        data.extend_from_slice(b"FRAME\n\x01\x02");
        let mut r = Y4mReader::from_reader(Cursor::new(data)).unwrap();
        assert!(r.next_frame().unwrap().is_some());
        let err = r.next_frame().unwrap_err();
        assert!(err.to_string().contains("不完整"));
    }

    #[test]
    fn test_rejects_bad_header() {
        assert!(Y4mReader::from_reader(Cursor::new(b"RIFF....\n".to_vec())).is_err());
        assert!(Y4mReader::from_reader(Cursor::new(b"YUV4MPEG2 F30:1\n".to_vec())).is_err());
        assert!(Y4mReader::from_reader(Cursor::new(b"YUV4MPEG2 W2 H2 C422\n".to_vec())).is_err());
        assert!(Y4mReader::from_reader(Cursor::new(Vec::new())).is_err());
    }

    #[test]
    fn test_mono() {
        let data = y4m_bytes("YUV4MPEG2 W2 H1 F30:1 Cmono", &[&[9, 200]]);
        let mut r = Y4mReader::from_reader(Cursor::new(data)).unwrap();
        let f = r.next_frame().unwrap().unwrap();
        assert_eq!(f.data, vec![9, 9, 9, 200, 200, 200]);
    }
}
