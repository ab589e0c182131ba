/// 进程间传输 (Pipe transport)
///
/// 进程拓扑下阶段之间通过匿名管道传递帧与检测结果。每条消息:
/// ```text
/// [u32 LE 头长度][bincode 头 Envelope][原始像素 payload]
/// ```
/// 头里只有元数据, 像素不经过 bincode, 避免一次多余的拷贝。
/// 消费端进程用一个读线程把管道内容灌进本地有界队列, 阶段循环与线程拓扑完全相同。
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::marker::PhantomData;
use std::thread::JoinHandle;

use anyhow::{bail, ensure, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::queue::{Outlet, PushError, QueueSender};
use super::state::{PipelineState, StopCause};
use crate::detection::{Detection, DetectionRecord, Frame};
use crate::telemetry::spawn_thread;

const MAX_HEADER_LEN: u32 = 64 << 20;
const MAX_PAYLOAD_LEN: u64 = 1 << 30;

/// 可以跨管道传输的数据: 拆成可序列化的头与原始字节
pub trait Wire: Sized + Send + 'static {
    type Header: Serialize + DeserializeOwned;

    fn into_parts(self) -> (Self::Header, Vec<u8>);

    fn from_parts(header: Self::Header, payload: Vec<u8>) -> Result<Self>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub timestamp: Option<f64>,
}

impl FrameHeader {
    fn split(frame: Frame) -> (Self, Vec<u8>) {
        let header = Self {
            index: frame.index,
            width: frame.width,
            height: frame.height,
            timestamp: frame.timestamp,
        };
        (header, frame.data)
    }

    fn join(self, data: Vec<u8>) -> Result<Frame> {
        let frame = Frame::new(self.index, self.width, self.height, data)
            .with_timestamp(self.timestamp);
        ensure!(
            frame.data.len() == frame.expected_len(),
            "帧 {} 数据长度 {} 与尺寸 {}x{} 不符",
            frame.index,
            frame.data.len(),
            frame.width,
            frame.height
        );
        Ok(frame)
    }
}

impl Wire for Frame {
    type Header = FrameHeader;

    fn into_parts(self) -> (FrameHeader, Vec<u8>) {
        FrameHeader::split(self)
    }

    fn from_parts(header: FrameHeader, payload: Vec<u8>) -> Result<Self> {
        header.join(payload)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordHeader {
    pub frame: FrameHeader,
    pub detections: Vec<Detection>,
}

impl Wire for DetectionRecord {
    type Header = RecordHeader;

    fn into_parts(self) -> (RecordHeader, Vec<u8>) {
        let (frame, data) = FrameHeader::split(self.frame);
        (
            RecordHeader {
                frame,
                detections: self.detections,
            },
            data,
        )
    }

    fn from_parts(header: RecordHeader, payload: Vec<u8>) -> Result<Self> {
        let frame = header.frame.join(payload)?;
        Ok(DetectionRecord::new(frame, header.detections))
    }
}

#[derive(Serialize, Deserialize)]
enum Envelope<H> {
    Item { header: H, len: u64 },
    End,
}

fn write_envelope<W: Write, H: Serialize>(w: &mut W, envelope: &Envelope<H>) -> io::Result<()> {
    let bytes = bincode::serialize(envelope).map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(ErrorKind::InvalidData, "消息头过大"))?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&bytes)
}

/// 写一条数据消息
pub fn write_item<W: Write, T: Wire>(w: &mut W, item: T) -> io::Result<()> {
    let (header, payload) = item.into_parts();
    write_envelope(
        w,
        &Envelope::Item {
            header,
            len: payload.len() as u64,
        },
    )?;
    w.write_all(&payload)
}

/// 写结束标记
pub fn write_end<W: Write>(w: &mut W) -> io::Result<()> {
    write_envelope::<_, ()>(w, &Envelope::End)
}

/// 读 4 字节长度前缀; 在消息边界上遇到 EOF 返回 None
fn read_prefix<R: Read>(r: &mut R) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => bail!("消息头长度不完整 ({filled}/4 字节)"),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("读取管道"),
        }
    }
    Ok(Some(u32::from_le_bytes(buf)))
}

/// 读一条消息; 管道在消息边界上关闭时返回 None
pub fn read_message<R: Read, T: Wire>(r: &mut R) -> Result<Option<super::queue::Message<T>>> {
    use super::queue::Message;

    let Some(len) = read_prefix(r)? else {
        return Ok(None);
    };
    ensure!(len <= MAX_HEADER_LEN, "消息头长度异常: {len}");
    let mut header = vec![0u8; len as usize];
    r.read_exact(&mut header).context("读取消息头")?;

    match bincode::deserialize::<Envelope<T::Header>>(&header).context("解析消息头")? {
        Envelope::End => Ok(Some(Message::End)),
        Envelope::Item { header, len } => {
            ensure!(len <= MAX_PAYLOAD_LEN, "消息体长度异常: {len}");
            let mut payload = vec![0u8; len as usize];
            r.read_exact(&mut payload).context("读取消息体")?;
            Ok(Some(Message::Item(T::from_parts(header, payload)?)))
        }
    }
}

/// 管道生产端
///
/// 每条消息写完立即 flush, 背压来自操作系统的管道缓冲区。
pub struct PipeOutlet<W: Write + Send, T> {
    writer: BufWriter<W>,
    state: PipelineState,
    closed: bool,
    broken: bool,
    _item: PhantomData<fn(T)>,
}

impl<W: Write + Send, T> PipeOutlet<W, T> {
    pub fn new(writer: W, state: &PipelineState) -> Self {
        Self {
            writer: BufWriter::with_capacity(1 << 20, writer),
            state: state.clone(),
            closed: false,
            broken: false,
            _item: PhantomData,
        }
    }

    fn send(&mut self, item: T) -> io::Result<()>
    where
        T: Wire,
    {
        write_item(&mut self.writer, item)?;
        self.writer.flush()
    }
}

impl<W: Write + Send, T: Wire> Outlet<T> for PipeOutlet<W, T> {
    fn push(&mut self, item: T) -> Result<(), PushError> {
        if self.broken || self.closed {
            return Err(PushError::Disconnected);
        }
        if self.state.is_aborted() {
            return Err(PushError::Stopped);
        }
        match self.send(item) {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.kind() != ErrorKind::BrokenPipe {
                    warn!("⚠️  写入管道失败: {e}");
                }
                self.broken = true;
                Err(PushError::Disconnected)
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.broken {
            return;
        }
        if let Err(e) = write_end(&mut self.writer).and_then(|_| self.writer.flush()) {
            debug!("结束标记未送达: {e}");
        }
    }
}

/// 启动读线程: 管道 → 本地有界队列, 返回转发的条数
///
/// 上游未发送结束标记就断开 (崩溃或被杀) 视为失败: 置停止标志后关闭本地队列。
pub fn spawn_pipe_reader<R, T>(
    name: &str,
    mut reader: R,
    mut tx: QueueSender<T>,
    state: &PipelineState,
) -> io::Result<JoinHandle<Result<u64>>>
where
    R: Read + Send + 'static,
    T: Wire,
{
    let state = state.clone();
    spawn_thread(format!("{name}-reader"), move || {
        let mut forwarded = 0u64;
        loop {
            match read_message::<_, T>(&mut reader) {
                Ok(Some(super::queue::Message::Item(item))) => match tx.push(item) {
                    Ok(()) => forwarded += 1,
                    Err(_) => return Ok(forwarded),
                },
                Ok(Some(super::queue::Message::End)) => {
                    tx.close();
                    return Ok(forwarded);
                }
                Ok(None) => {
                    warn!("⚠️  上游在结束标记之前断开 (已收到 {forwarded} 条)");
                    state.stop(StopCause::StageFailed);
                    tx.close();
                    bail!("上游意外断开");
                }
                Err(e) => {
                    state.stop(StopCause::StageFailed);
                    tx.close();
                    return Err(e.context(format!("第 {forwarded} 条消息之后")));
                }
            }
        }
    })
}
