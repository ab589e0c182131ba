/// 控制器 (Controller), 线程拓扑
///
/// ```text
///   批处理:  Source 线程 ──[帧队列 C]──▶ Detector 线程 ──[记录队列 C]──▶ Renderer 线程
///   流式:                  Detector 线程(自带视频源) ──[记录队列 C]──▶ Renderer 线程
/// ```
///
/// 启动顺序: 先在检测线程内加载模型并等待就绪, 失败则不启动任何阶段;
/// 成功后再启动渲染线程与读取线程。结束时无条件回收全部线程。
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::detector::{run_batched, run_streaming, DetectorContext};
use super::queue::{bounded, QueueReceiver, QueueStats};
use super::renderer::run_renderer;
use super::source::run_source;
use super::state::{PipelineState, StopCause};
use crate::config::{DetectMode, PipelineConfig};
use crate::detection::{DetectionRecord, Frame};
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::input::FrameSource;
use crate::models::{Model, PredictParams};
use crate::output::OutputSink;
use crate::renderer::Annotator;
use crate::telemetry::{spawn_thread, Report, Throughput};

/// 运行参数
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub mode: DetectMode,
    pub batch: usize,
    pub capacity: usize,
    pub poll: Duration,
    pub report_every: u64,
    /// 统计时查询显存的设备
    pub stats_device: Option<usize>,
    pub params: PredictParams,
    pub class_names: Option<Vec<String>>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for RunSettings {
    fn from(c: &PipelineConfig) -> Self {
        Self {
            mode: c.mode,
            batch: c.batch,
            capacity: c.queue_capacity,
            poll: c.poll_interval(),
            report_every: c.report_every,
            stats_device: c.stats_device(),
            params: c.params.clone(),
            class_names: c.class_names.clone(),
        }
    }
}

/// 队列水位
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReport {
    pub name: String,
    pub capacity: usize,
    pub high_water: usize,
}

impl From<&QueueStats> for QueueReport {
    fn from(s: &QueueStats) -> Self {
        Self {
            name: s.name().to_string(),
            capacity: s.capacity(),
            high_water: s.high_water(),
        }
    }
}

/// 一次运行的汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub frames: u64,
    pub elapsed: Duration,
    pub fps: f64,
    pub memory_mib: Option<u64>,
    /// 被用户中断 (已写出的帧仍然有效)
    pub cancelled: bool,
    pub queues: Vec<QueueReport>,
}

impl RunSummary {
    pub fn new(report: Report, cancelled: bool, queues: Vec<QueueReport>) -> Self {
        Self {
            frames: report.frames,
            elapsed: report.elapsed,
            fps: report.fps,
            memory_mib: report.memory_mib,
            cancelled,
            queues,
        }
    }

    pub fn log(&self) {
        for q in &self.queues {
            info!("📦 队列 {}: 最高水位 {}/{}", q.name, q.high_water, q.capacity);
        }
        let memory = self
            .memory_mib
            .map_or_else(|| "N/A".to_string(), |m| format!("{m} MiB"));
        if self.cancelled {
            warn!(
                "⏹  已中断: 输出 {} 帧 | 耗时 {:.1}s | 平均 {:.1} FPS",
                self.frames,
                self.elapsed.as_secs_f64(),
                self.fps
            );
        } else {
            info!(
                "✅ 完成: {} 帧 | 耗时 {:.1}s | 平均 {:.1} FPS | 显存 {memory}",
                self.frames,
                self.elapsed.as_secs_f64(),
                self.fps
            );
        }
    }
}

/// 在命名线程中运行一个阶段; panic 会被转换为错误并置停止标志
fn spawn_stage<T, F>(
    stage: Stage,
    state: &PipelineState,
    f: F,
) -> PipelineResult<JoinHandle<PipelineResult<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> PipelineResult<T> + Send + 'static,
{
    let guard = state.clone();
    spawn_thread(stage.as_str(), move || {
        panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
            error!("❌ [{stage}] 线程 panic");
            guard.stop(StopCause::StageFailed);
            Err(PipelineError::Panicked { stage })
        })
    })
    .map_err(|e| PipelineError::setup(stage, "spawn thread", e.into()))
}

fn join<T>(stage: Stage, handle: JoinHandle<PipelineResult<T>>) -> PipelineResult<T> {
    handle
        .join()
        .unwrap_or(Err(PipelineError::Panicked { stage }))
}

/// 检测阶段的输入
enum Feed {
    Queue(QueueReceiver<Frame>),
    Source(Box<dyn FrameSource>),
}

pub struct Controller {
    settings: RunSettings,
    state: PipelineState,
}

impl Controller {
    pub fn new(settings: RunSettings) -> Self {
        Self {
            settings,
            state: PipelineState::local(),
        }
    }

    /// 停止标志; 外部 (如 Ctrl-C) 置 `Cancelled` 即可请求停止
    pub fn state(&self) -> PipelineState {
        self.state.clone()
    }

    /// 运行一次完整的流水线
    ///
    /// `load_model` 在检测线程内调用, 模型从不跨线程移动。
    /// 返回时所有线程均已回收, 输出端已关闭。
    pub fn run<F>(
        &self,
        source: Box<dyn FrameSource>,
        load_model: F,
        sink: Box<dyn OutputSink>,
        annotator: Annotator,
    ) -> PipelineResult<RunSummary>
    where
        F: FnOnce() -> anyhow::Result<Box<dyn Model>> + Send + 'static,
    {
        let s = &self.settings;
        let state = &self.state;
        info!(
            "🚀 启动流水线: 模式 {:?} | 批大小 {} | 队列容量 {}",
            s.mode, s.batch, s.capacity
        );

        let mut queues = Vec::new();
        let (record_tx, record_rx) = bounded::<DetectionRecord>("records", s.capacity, state, s.poll);
        queues.push(record_tx.stats());

        let (feed, mut source, frame_tx) = match s.mode {
            DetectMode::Batch => {
                let (tx, rx) = bounded::<Frame>("frames", s.capacity, state, s.poll);
                queues.insert(0, tx.stats());
                (Feed::Queue(rx), Some(source), Some(tx))
            }
            DetectMode::Stream => (Feed::Source(source), None, None),
        };

        // 1. 检测线程: 加载模型 → 就绪信号 → 推理循环
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<bool>(1);
        let detector = {
            let state = state.clone();
            let params = s.params.clone();
            let names = s.class_names.clone();
            let batch = s.batch;
            let mut out = record_tx;
            spawn_stage(Stage::Detector, &self.state, move || {
                let mut model = match load_model() {
                    Ok(model) => model,
                    Err(e) => {
                        let _ = ready_tx.send(false);
                        return Err(PipelineError::setup(Stage::Detector, "load model", e));
                    }
                };
                let _ = ready_tx.send(true);
                let names = names.or_else(|| model.class_names());
                let ctx = DetectorContext {
                    params: &params,
                    names: names.as_deref(),
                    state: &state,
                };
                match feed {
                    Feed::Queue(mut rx) => run_batched(model.as_mut(), &ctx, batch, &mut rx, &mut out),
                    Feed::Source(mut src) => run_streaming(model.as_mut(), &ctx, src.as_mut(), &mut out),
                }
            })
        };
        let detector = match detector {
            Ok(handle) => handle,
            Err(e) => return Err(self.abort_setup(e, source, sink)),
        };

        if !ready_rx.recv().unwrap_or(false) {
            let err = match join(Stage::Detector, detector) {
                Err(e) => e,
                Ok(_) => PipelineError::setup(
                    Stage::Detector,
                    "load model",
                    anyhow::anyhow!("检测线程未发送就绪信号"),
                ),
            };
            return Err(self.abort_setup(err, source, sink));
        }
        info!("✅ 模型就绪");

        // 2. 渲染线程
        let renderer = {
            let state = state.clone();
            let mut rx = record_rx;
            let mut throughput = Throughput::new(s.report_every, s.stats_device);
            spawn_stage(Stage::Renderer, &self.state, move || {
                run_renderer(&mut rx, &annotator, sink, &mut throughput, &state)
            })
        };

        // 3. 读取线程 (仅批处理模式)
        let reader = match (source.take(), frame_tx) {
            (Some(mut src), Some(mut tx)) => {
                let state = state.clone();
                Some(spawn_stage(Stage::Source, &self.state, move || {
                    run_source(src.as_mut(), &mut tx, &state)
                }))
            }
            _ => None,
        };

        // 4. 回收: 不论成败都等待全部线程
        if renderer.is_err() || reader.as_ref().is_some_and(|r| r.is_err()) {
            state.stop(StopCause::StageFailed);
        }
        let mut errors = Vec::new();
        let mut report = None;
        if let Some(reader) = reader {
            if let Err(e) = reader.and_then(|h| join(Stage::Source, h)) {
                errors.push(e);
            }
        }
        if let Err(e) = join(Stage::Detector, detector) {
            errors.push(e);
        }
        match renderer.and_then(|h| join(Stage::Renderer, h)) {
            Ok(r) => report = Some(r),
            Err(e) => errors.push(e),
        }
        self.finish(errors, report, &queues)
    }

    fn finish(
        &self,
        mut errors: Vec<PipelineError>,
        report: Option<Report>,
        queues: &[std::sync::Arc<QueueStats>],
    ) -> PipelineResult<RunSummary> {
        let queues: Vec<QueueReport> = queues.iter().map(|q| QueueReport::from(q.as_ref())).collect();
        if !errors.is_empty() {
            // 按流水线顺序报告第一个错误, 其余只记录
            errors.sort_by_key(|e| stage_order(e.failed_stage()));
            let first = errors.remove(0);
            for other in &errors {
                warn!("其他阶段错误: {other}");
            }
            return Err(first);
        }
        let report = report.ok_or_else(|| PipelineError::Panicked {
            stage: Stage::Renderer,
        })?;
        let summary = RunSummary::new(
            report,
            self.state.cause() == Some(StopCause::Cancelled),
            queues,
        );
        summary.log();
        Ok(summary)
    }

    /// 启动失败: 关闭已创建的视频源与输出端, 不启动其他阶段
    fn abort_setup(
        &self,
        err: PipelineError,
        source: Option<Box<dyn FrameSource>>,
        sink: Box<dyn OutputSink>,
    ) -> PipelineError {
        error!("❌ {err}");
        self.state.stop(StopCause::StageFailed);
        if let Some(mut source) = source {
            source.close();
        }
        if let Err(e) = sink.finish() {
            warn!("关闭输出端: {e:#}");
        }
        err
    }
}

fn stage_order(stage: Stage) -> u8 {
    match stage {
        Stage::Controller => 0,
        Stage::Source => 1,
        Stage::Detector => 2,
        Stage::Renderer => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Detection, StreamInfo};
    use crate::models::NullModel;
    use std::sync::{Arc, Mutex};

    struct Counter {
        info: StreamInfo,
        next: u64,
        total: u64,
    }

    impl FrameSource for Counter {
        fn info(&self) -> &StreamInfo {
            &self.info
        }

        fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
            if self.next == self.total {
                return Ok(None);
            }
            self.next += 1;
            Ok(Some(Frame::filled(self.next - 1, 4, 4, [0, 0, 0])))
        }
    }

    fn counter(total: u64) -> Box<dyn FrameSource> {
        Box::new(Counter {
            info: StreamInfo::new(4, 4, 25.0),
            next: 0,
            total,
        })
    }

    struct Collect(Arc<Mutex<(Vec<u64>, u32)>>);

    impl OutputSink for Collect {
        fn write(&mut self, frame: &Frame) -> anyhow::Result<()> {
            self.0.lock().unwrap().0.push(frame.index);
            Ok(())
        }

        fn finish(self: Box<Self>) -> anyhow::Result<()> {
            self.0.lock().unwrap().1 += 1;
            Ok(())
        }

        fn describe(&self) -> String {
            "collect".into()
        }
    }

    struct Boxes;

    impl Model for Boxes {
        fn predict(
            &mut self,
            frames: &[Frame],
            _: &PredictParams,
        ) -> anyhow::Result<Vec<Vec<Detection>>> {
            Ok(frames
                .iter()
                .map(|_| vec![Detection::new(0, 0.8, BBox::new(0.0, 0.0, 2.0, 2.0))])
                .collect())
        }

        fn class_names(&self) -> Option<Vec<String>> {
            Some(vec!["thing".into()])
        }
    }

    fn settings(mode: DetectMode) -> RunSettings {
        RunSettings {
            mode,
            batch: 3,
            capacity: 4,
            poll: Duration::from_millis(10),
            report_every: 0,
            stats_device: None,
            ..RunSettings::default()
        }
    }

    #[test]
    fn test_batch_mode_end_to_end() {
        let log = Arc::new(Mutex::new((Vec::new(), 0)));
        let c = Controller::new(settings(DetectMode::Batch));
        let summary = c
            .run(
                counter(10),
                || Ok(Box::new(Boxes) as Box<dyn Model>),
                Box::new(Collect(log.clone())),
                Annotator::boxes_only(1),
            )
            .unwrap();
        assert_eq!(summary.frames, 10);
        assert!(!summary.cancelled);
        assert_eq!(summary.queues.len(), 2);
        assert_eq!(summary.queues[0].name, "frames");
        assert!(summary.queues.iter().all(|q| q.high_water <= q.capacity));
        let log = log.lock().unwrap();
        assert_eq!(log.0, (0..10).collect::<Vec<_>>());
        assert_eq!(log.1, 1);
        assert_eq!(c.state().cause(), Some(StopCause::SourceExhausted));
    }

    #[test]
    fn test_stream_mode_end_to_end() {
        let log = Arc::new(Mutex::new((Vec::new(), 0)));
        let c = Controller::new(settings(DetectMode::Stream));
        let summary = c
            .run(
                counter(7),
                || Ok(Box::new(NullModel::default()) as Box<dyn Model>),
                Box::new(Collect(log.clone())),
                Annotator::boxes_only(1),
            )
            .unwrap();
        assert_eq!(summary.frames, 7);
        assert_eq!(summary.queues.len(), 1);
        assert_eq!(log.lock().unwrap().0, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_load_failure_is_setup_error() {
        let log = Arc::new(Mutex::new((Vec::new(), 0)));
        let c = Controller::new(settings(DetectMode::Batch));
        let err = c
            .run(
                counter(10),
                || anyhow::bail!("missing weights"),
                Box::new(Collect(log.clone())),
                Annotator::boxes_only(1),
            )
            .unwrap_err();
        assert!(err.is_setup());
        assert_eq!(err.failed_stage(), Stage::Detector);
        let log = log.lock().unwrap();
        assert!(log.0.is_empty());
        assert_eq!(log.1, 1);
    }

    #[test]
    fn test_detector_panic_is_reported() {
        struct Explodes;
        impl Model for Explodes {
            fn predict(
                &mut self,
                _: &[Frame],
                _: &PredictParams,
            ) -> anyhow::Result<Vec<Vec<Detection>>> {
                panic!("boom");
            }
        }

        let log = Arc::new(Mutex::new((Vec::new(), 0)));
        let c = Controller::new(settings(DetectMode::Batch));
        let err = c
            .run(
                counter(10),
                || Ok(Box::new(Explodes) as Box<dyn Model>),
                Box::new(Collect(log.clone())),
                Annotator::boxes_only(1),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::Panicked { stage: Stage::Detector }));
        assert_eq!(c.state().cause(), Some(StopCause::StageFailed));
        assert_eq!(log.lock().unwrap().1, 1);
    }

    #[test]
    fn test_stage_order() {
        assert!(stage_order(Stage::Source) < stage_order(Stage::Detector));
        assert!(stage_order(Stage::Detector) < stage_order(Stage::Renderer));
    }
}
