#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use yolo_stream_rs::input::FrameSource;
use yolo_stream_rs::output::OutputSink;
use yolo_stream_rs::pipeline::PipelineState;
use yolo_stream_rs::{BBox, Detection, Frame, Model, PredictParams, StreamInfo};

pub const W: u32 = 16;
pub const H: u32 = 8;

/// 生成 `total` 帧 (None 表示无限), 可在某一帧读取失败
pub struct SyntheticSource {
    info: StreamInfo,
    next: u64,
    total: Option<u64>,
    fail_at: Option<u64>,
}

impl SyntheticSource {
    pub fn new(total: u64) -> Self {
        Self {
            info: StreamInfo {
                frame_count: Some(total),
                ..StreamInfo::new(W, H, 25.0)
            },
            next: 0,
            total: Some(total),
            fail_at: None,
        }
    }

    pub fn endless() -> Self {
        Self {
            info: StreamInfo::new(W, H, 25.0),
            next: 0,
            total: None,
            fail_at: None,
        }
    }

    pub fn failing_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn boxed(self) -> Box<dyn FrameSource> {
        Box::new(self)
    }
}

impl FrameSource for SyntheticSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.fail_at == Some(self.next) {
            bail!("corrupt packet at frame {}", self.next);
        }
        if self.total == Some(self.next) {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;
        Ok(Some(
            Frame::filled(index, W, H, [(index % 256) as u8, 64, 128])
                .with_timestamp(self.info.timestamp(index)),
        ))
    }
}

/// 每帧一个检测框; 记录每次调用的批大小, 可在某一帧失败或放慢
#[derive(Clone, Default)]
pub struct ScriptedModel {
    pub batches: Arc<Mutex<Vec<usize>>>,
    pub fail_on: Option<u64>,
    pub delay: Option<Duration>,
}

impl Model for ScriptedModel {
    fn predict(&mut self, frames: &[Frame], _: &PredictParams) -> Result<Vec<Vec<Detection>>> {
        self.batches.lock().unwrap().push(frames.len());
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if let Some(bad) = self.fail_on {
            if frames.iter().any(|f| f.index == bad) {
                bail!("CUDA out of memory");
            }
        }
        Ok(frames
            .iter()
            .map(|f| {
                vec![Detection::new(
                    (f.index % 3) as u32,
                    0.9,
                    BBox::new(1.0, 1.0, 6.0, 6.0),
                )]
            })
            .collect())
    }

    fn class_names(&self) -> Option<Vec<String>> {
        Some(vec!["car".into(), "van".into(), "bus".into()])
    }
}

#[derive(Default)]
pub struct SinkLog {
    pub written: Vec<u64>,
    pub finished: u32,
}

/// 内存输出端; 可在某一帧写失败, 或写到某一帧时请求取消
pub struct MemorySink {
    pub log: Arc<Mutex<SinkLog>>,
    pub fail_at: Option<u64>,
    pub cancel_at: Option<(u64, PipelineState)>,
}

impl MemorySink {
    pub fn new(log: &Arc<Mutex<SinkLog>>) -> Self {
        Self {
            log: log.clone(),
            fail_at: None,
            cancel_at: None,
        }
    }
}

impl OutputSink for MemorySink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.fail_at == Some(frame.index) {
            bail!("Broken pipe (os error 32)");
        }
        self.log.lock().unwrap().written.push(frame.index);
        if let Some((at, state)) = &self.cancel_at {
            if frame.index == *at {
                state.stop(yolo_stream_rs::pipeline::StopCause::Cancelled);
            }
        }
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.log.lock().unwrap().finished += 1;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}
