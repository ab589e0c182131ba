/// 检测阶段 (Detector stage)
/// 职责: 帧 → 模型推理 → DetectionRecord (每帧一条, 保持输入顺序)
///
/// 两种模式:
/// - 批处理: 从帧队列凑满 B 帧 (或遇到结束标记) 后推理一次, 最后一批不足 B 帧时原样推理
/// - 流式:   直接从视频源逐帧拉取, 没有帧队列
use std::time::Instant;

use anyhow::{ensure, Result};
use tracing::{error, info, info_span};

use super::queue::{Outlet, PushError, QueueReceiver};
use super::state::{PipelineState, StopCause};
use crate::detection::{Detection, DetectionRecord, Frame};
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::input::FrameSource;
use crate::models::{Model, PredictParams};

/// 检测阶段的共享上下文
pub struct DetectorContext<'a> {
    pub params: &'a PredictParams,
    /// 类别名; 为 None 时保留模型给出的标签
    pub names: Option<&'a [String]>,
    pub state: &'a PipelineState,
}

impl DetectorContext<'_> {
    fn label(&self, detections: &mut [Detection]) {
        let Some(names) = self.names else {
            return;
        };
        for det in detections {
            if let Some(name) = names.get(det.class_id as usize) {
                det.label.clone_from(name);
            }
        }
    }
}

/// 推理统计 (每秒输出一次)
struct InferStats {
    frames: u64,
    window_frames: u64,
    window_start: Instant,
    busy_ms: f64,
}

impl InferStats {
    fn new() -> Self {
        Self {
            frames: 0,
            window_frames: 0,
            window_start: Instant::now(),
            busy_ms: 0.0,
        }
    }

    fn record(&mut self, frames: usize, started: Instant) {
        self.frames += frames as u64;
        self.window_frames += frames as u64;
        self.busy_ms += started.elapsed().as_secs_f64() * 1000.0;
        let elapsed = self.window_start.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            let fps = self.window_frames as f64 / elapsed;
            let per_frame = self.busy_ms / self.window_frames.max(1) as f64;
            info!(
                "🔍 推理统计: 累计{}帧 | 实际{:.1}fps | 每帧{:.1}ms",
                self.frames, fps, per_frame
            );
            self.window_frames = 0;
            self.busy_ms = 0.0;
            self.window_start = Instant::now();
        }
    }
}

/// 推理一批帧, 按收集顺序生成记录
pub fn infer_batch(
    model: &mut dyn Model,
    ctx: &DetectorContext<'_>,
    frames: Vec<Frame>,
) -> Result<Vec<DetectionRecord>> {
    let results = model.predict(&frames, ctx.params)?;
    ensure!(
        results.len() == frames.len(),
        "模型返回 {} 组结果, 输入 {} 帧",
        results.len(),
        frames.len()
    );
    Ok(frames
        .into_iter()
        .zip(results)
        .map(|(frame, mut detections)| {
            ctx.label(&mut detections);
            DetectionRecord::new(frame, detections)
        })
        .collect())
}

/// 记录入队; 下游不再接收时返回 false
fn emit(out: &mut dyn Outlet<DetectionRecord>, records: Vec<DetectionRecord>) -> bool {
    for record in records {
        match out.push(record) {
            Ok(()) => {}
            Err(PushError::Stopped) => return false,
            Err(PushError::Disconnected) => {
                info!("下游已退出, 检测阶段停止");
                return false;
            }
        }
    }
    true
}

fn fail(
    op: &'static str,
    e: anyhow::Error,
    out: &mut dyn Outlet<DetectionRecord>,
    state: &PipelineState,
) -> PipelineError {
    let err = PipelineError::stage(Stage::Detector, op, e);
    error!("❌ {err}");
    state.stop(StopCause::StageFailed);
    out.close();
    err
}

/// 批处理模式, 返回产出的记录数
pub fn run_batched(
    model: &mut dyn Model,
    ctx: &DetectorContext<'_>,
    batch_size: usize,
    input: &mut QueueReceiver<Frame>,
    out: &mut dyn Outlet<DetectionRecord>,
) -> PipelineResult<u64> {
    let _span = info_span!("detector", mode = "batch", batch = batch_size).entered();
    info!("🔍 检测阶段启动 (批大小 {batch_size})");
    let batch_size = batch_size.max(1);
    let mut stats = InferStats::new();
    let mut batch: Vec<Frame> = Vec::with_capacity(batch_size);

    loop {
        // 失败或取消后丢弃未推理的帧
        if ctx.state.is_aborted() {
            info!("检测阶段收到停止信号");
            break;
        }
        let next = input.pop();
        let exhausted = next.is_none();
        if let Some(frame) = next {
            batch.push(frame);
        }
        if batch.len() == batch_size || (exhausted && !batch.is_empty()) {
            let frames = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            let n = frames.len();
            let started = Instant::now();
            match infer_batch(model, ctx, frames) {
                Ok(records) => {
                    stats.record(n, started);
                    if !emit(out, records) {
                        break;
                    }
                }
                Err(e) => {
                    model.release();
                    return Err(fail("inference", e, out, ctx.state));
                }
            }
        }
        if exhausted {
            break;
        }
    }

    out.close();
    model.release();
    info!("✅ 检测阶段结束: {} 帧", stats.frames);
    Ok(stats.frames)
}

/// 记录视频源是否读失败, 用于区分读帧错误与推理错误
struct ReadTracker<'s, S: FrameSource + ?Sized> {
    inner: &'s mut S,
    failed: bool,
}

impl<S: FrameSource + ?Sized> FrameSource for ReadTracker<'_, S> {
    fn info(&self) -> &crate::detection::StreamInfo {
        self.inner.info()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let next = self.inner.next_frame();
        if next.is_err() {
            self.failed = true;
        }
        next
    }

    fn close(&mut self) {
        self.inner.close()
    }
}

/// 流式模式: 检测阶段同时充当视频源, 返回产出的记录数
pub fn run_streaming(
    model: &mut dyn Model,
    ctx: &DetectorContext<'_>,
    source: &mut dyn FrameSource,
    out: &mut dyn Outlet<DetectionRecord>,
) -> PipelineResult<u64> {
    let _span = info_span!("detector", mode = "stream").entered();
    info!("🔍 检测阶段启动 (流式)");
    let mut stats = InferStats::new();
    let mut failure = None;
    let mut reader = ReadTracker {
        inner: &mut *source,
        failed: false,
    };

    {
        let mut stream = model.stream(&mut reader, ctx.params);
        loop {
            if ctx.state.is_aborted() {
                info!("检测阶段收到停止信号");
                break;
            }
            let started = Instant::now();
            match stream.next() {
                None => break,
                Some(Ok(mut record)) => {
                    ctx.label(&mut record.detections);
                    stats.record(1, started);
                    if !emit(out, vec![record]) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
            }
        }
    }
    let read_failed = reader.failed;
    source.close();
    model.release();

    if let Some(e) = failure {
        let op = if read_failed { "read frame" } else { "inference" };
        return Err(fail(op, e, out, ctx.state));
    }
    out.close();
    ctx.state.stop(StopCause::SourceExhausted);
    info!("✅ 检测阶段结束: {} 帧", stats.frames);
    Ok(stats.frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, StreamInfo};
    use crate::pipeline::queue::bounded;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const POLL: Duration = Duration::from_millis(10);

    /// 记录每次调用的批大小; 每帧返回一个类别为帧序号 % 3 的检测
    struct Recorder {
        batches: Arc<Mutex<Vec<usize>>>,
        fail_on: Option<u64>,
        released: Arc<Mutex<bool>>,
    }

    impl Recorder {
        fn new(fail_on: Option<u64>) -> Self {
            Self {
                batches: Arc::default(),
                fail_on,
                released: Arc::default(),
            }
        }
    }

    impl Model for Recorder {
        fn predict(&mut self, frames: &[Frame], _: &PredictParams) -> Result<Vec<Vec<Detection>>> {
            self.batches.lock().unwrap().push(frames.len());
            if let Some(bad) = self.fail_on {
                if frames.iter().any(|f| f.index == bad) {
                    anyhow::bail!("model exploded on frame {bad}");
                }
            }
            Ok(frames
                .iter()
                .map(|f| vec![Detection::new((f.index % 3) as u32, 0.9, BBox::default())])
                .collect())
        }

        fn release(&mut self) {
            *self.released.lock().unwrap() = true;
        }
    }

    struct ShortModel;

    impl Model for ShortModel {
        fn predict(&mut self, frames: &[Frame], _: &PredictParams) -> Result<Vec<Vec<Detection>>> {
            Ok(vec![Vec::new(); frames.len().saturating_sub(1)])
        }
    }

    struct Counter {
        info: StreamInfo,
        next: u64,
        total: u64,
    }

    impl FrameSource for Counter {
        fn info(&self) -> &StreamInfo {
            &self.info
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.next == self.total {
                return Ok(None);
            }
            self.next += 1;
            Ok(Some(Frame::filled(self.next - 1, 2, 2, [0, 0, 0])))
        }
    }

    fn feed(n: u64, state: &PipelineState) -> QueueReceiver<Frame> {
        let (mut tx, rx) = bounded("frames", n as usize + 1, state, POLL);
        for i in 0..n {
            tx.push(Frame::filled(i, 2, 2, [0, 0, 0])).unwrap();
        }
        tx.close();
        rx
    }

    fn drain(rx: &mut QueueReceiver<DetectionRecord>) -> Vec<DetectionRecord> {
        std::iter::from_fn(|| rx.pop()).collect()
    }

    #[test]
    fn test_partial_final_batch_as_is() {
        let state = PipelineState::local();
        let params = PredictParams::default();
        let ctx = DetectorContext {
            params: &params,
            names: None,
            state: &state,
        };
        let mut input = feed(10, &state);
        let (mut tx, mut rx) = bounded("records", 16, &state, POLL);
        let mut model = Recorder::new(None);
        let batches = model.batches.clone();

        let n = run_batched(&mut model, &ctx, 4, &mut input, &mut tx).unwrap();
        assert_eq!(n, 10);
        assert_eq!(*batches.lock().unwrap(), vec![4, 4, 2]);
        assert!(*model.released.lock().unwrap());

        let records = drain(&mut rx);
        let indices: Vec<u64> = records.iter().map(|r| r.index).collect();
        assert_eq!(indices, (0..10).collect::<Vec<_>>());
        assert!(records.iter().all(|r| r.detections.len() == 1));
    }

    #[test]
    fn test_batched_any_size_keeps_order() {
        for batch in 1..=6 {
            for n in [0u64, 1, 5, 12] {
                let state = PipelineState::local();
                let params = PredictParams::default();
                let ctx = DetectorContext {
                    params: &params,
                    names: None,
                    state: &state,
                };
                let mut input = feed(n, &state);
                let (mut tx, mut rx) = bounded("records", 16, &state, POLL);
                let mut model = Recorder::new(None);
                run_batched(&mut model, &ctx, batch, &mut input, &mut tx).unwrap();
                let indices: Vec<u64> = drain(&mut rx).iter().map(|r| r.index).collect();
                assert_eq!(indices, (0..n).collect::<Vec<_>>(), "batch {batch}, n {n}");
            }
        }
    }

    #[test]
    fn test_labels_from_names() {
        let state = PipelineState::local();
        let params = PredictParams::default();
        let names = vec!["pedestrian".to_string(), "people".to_string()];
        let ctx = DetectorContext {
            params: &params,
            names: Some(&names),
            state: &state,
        };
        let frames = (0..3).map(|i| Frame::filled(i, 2, 2, [0, 0, 0])).collect();
        let records = infer_batch(&mut Recorder::new(None), &ctx, frames).unwrap();
        assert_eq!(records[0].detections[0].label, "pedestrian");
        assert_eq!(records[1].detections[0].label, "people");
        // 超出名单的类别保持为空
        assert_eq!(records[2].detections[0].label, "");
    }

    #[test]
    fn test_result_count_mismatch_is_failure() {
        let state = PipelineState::local();
        let params = PredictParams::default();
        let ctx = DetectorContext {
            params: &params,
            names: None,
            state: &state,
        };
        let mut input = feed(3, &state);
        let (mut tx, mut rx) = bounded("records", 4, &state, POLL);
        let err = run_batched(&mut ShortModel, &ctx, 2, &mut input, &mut tx).unwrap_err();
        assert_eq!(err.failed_stage(), Stage::Detector);
        assert_eq!(state.cause(), Some(StopCause::StageFailed));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_failure_keeps_earlier_records() {
        let state = PipelineState::local();
        let params = PredictParams::default();
        let ctx = DetectorContext {
            params: &params,
            names: None,
            state: &state,
        };
        let mut input = feed(10, &state);
        let (mut tx, mut rx) = bounded("records", 16, &state, POLL);
        let mut model = Recorder::new(Some(5));
        let err = run_batched(&mut model, &ctx, 1, &mut input, &mut tx).unwrap_err();
        assert!(err.to_string().contains("model exploded on frame 5"));
        assert!(*model.released.lock().unwrap());
        let indices: Vec<u64> = drain(&mut rx).iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_streaming_mode() {
        let state = PipelineState::local();
        let params = PredictParams::default();
        let ctx = DetectorContext {
            params: &params,
            names: None,
            state: &state,
        };
        let mut source = Counter {
            info: StreamInfo::new(2, 2, 30.0),
            next: 0,
            total: 7,
        };
        let (mut tx, mut rx) = bounded("records", 16, &state, POLL);
        let mut model = Recorder::new(None);
        let batches = model.batches.clone();
        assert_eq!(
            run_streaming(&mut model, &ctx, &mut source, &mut tx).unwrap(),
            7
        );
        assert!(batches.lock().unwrap().iter().all(|&b| b == 1));
        assert_eq!(state.cause(), Some(StopCause::SourceExhausted));
        let indices: Vec<u64> = drain(&mut rx).iter().map(|r| r.index).collect();
        assert_eq!(indices, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancel_after_source_exhausted_skips_queued_frames() {
        let state = PipelineState::local();
        let params = PredictParams::default();
        let ctx = DetectorContext {
            params: &params,
            names: None,
            state: &state,
        };
        let mut input = feed(10, &state);
        state.stop(StopCause::SourceExhausted);
        state.stop(StopCause::Cancelled);
        let (mut tx, mut rx) = bounded("records", 16, &state, POLL);
        let mut model = Recorder::new(None);
        let batches = model.batches.clone();
        assert_eq!(run_batched(&mut model, &ctx, 2, &mut input, &mut tx).unwrap(), 0);
        assert!(batches.lock().unwrap().is_empty());
        assert!(*model.released.lock().unwrap());
        assert!(drain(&mut rx).is_empty());
    }

    struct Corrupt {
        info: StreamInfo,
        next: u64,
    }

    impl FrameSource for Corrupt {
        fn info(&self) -> &StreamInfo {
            &self.info
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if self.next == 3 {
                anyhow::bail!("truncated frame 3");
            }
            self.next += 1;
            Ok(Some(Frame::filled(self.next - 1, 2, 2, [0, 0, 0])))
        }
    }

    #[test]
    fn test_streaming_read_failure_names_read_frame() {
        let state = PipelineState::local();
        let params = PredictParams::default();
        let ctx = DetectorContext {
            params: &params,
            names: None,
            state: &state,
        };
        let mut source = Corrupt {
            info: StreamInfo::new(2, 2, 30.0),
            next: 0,
        };
        let (mut tx, mut rx) = bounded("records", 16, &state, POLL);
        let err = run_streaming(&mut Recorder::new(None), &ctx, &mut source, &mut tx).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Stage {
                stage: Stage::Detector,
                op: "read frame",
                ..
            }
        ));
        assert_eq!(state.cause(), Some(StopCause::StageFailed));
        let indices: Vec<u64> = drain(&mut rx).iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_streaming_model_failure_names_inference() {
        let state = PipelineState::local();
        let params = PredictParams::default();
        let ctx = DetectorContext {
            params: &params,
            names: None,
            state: &state,
        };
        let mut source = Counter {
            info: StreamInfo::new(2, 2, 30.0),
            next: 0,
            total: 7,
        };
        let (mut tx, _rx) = bounded("records", 16, &state, POLL);
        let err = run_streaming(&mut Recorder::new(Some(4)), &ctx, &mut source, &mut tx).unwrap_err();
        assert!(matches!(err, PipelineError::Stage { op: "inference", .. }));
    }
}
