/// 渲染阶段 (Renderer/Encoder stage)
/// 职责: 按序接收 DetectionRecord → 绘制 → 写入输出端 → 周期性输出吞吐统计
use tracing::{error, info, info_span};

use super::queue::QueueReceiver;
use super::state::{PipelineState, StopCause};
use crate::detection::DetectionRecord;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::output::OutputSink;
use crate::renderer::Annotator;
use crate::telemetry::{Report, Throughput};

/// 运行渲染循环, 返回最终统计
///
/// 输出端在所有路径上都恰好 `finish` 一次。
pub fn run_renderer(
    input: &mut QueueReceiver<DetectionRecord>,
    annotator: &Annotator,
    sink: Box<dyn OutputSink>,
    throughput: &mut Throughput,
    state: &PipelineState,
) -> PipelineResult<Report> {
    let _span = info_span!("renderer").entered();
    info!("🎨 渲染阶段启动: {}", sink.describe());

    let mut sink = sink;
    let mut last: Option<u64> = None;
    let mut failure = None;

    while let Some(record) = input.pop() {
        if let Some(prev) = last {
            if record.index <= prev {
                failure = Some(PipelineError::Ordering {
                    stage: Stage::Renderer,
                    last: prev,
                    got: record.index,
                });
                break;
            }
        }
        last = Some(record.index);

        let frame = match annotator.render(record) {
            Ok(frame) => frame,
            Err(e) => {
                failure = Some(PipelineError::stage(Stage::Renderer, "draw overlay", e));
                break;
            }
        };
        if let Err(e) = sink.write(&frame) {
            failure = Some(PipelineError::stage(Stage::Renderer, "write frame", e));
            break;
        }
        throughput.tick();
    }

    if let Some(err) = &failure {
        error!("❌ {err}");
        state.stop(StopCause::StageFailed);
    }

    // 先关闭输出端再报告, 编码进程在这里退出
    let finished = sink.finish();
    if let Some(err) = failure {
        if let Err(e) = finished {
            error!("❌ 关闭输出端: {e:#}");
        }
        return Err(err);
    }
    if let Err(e) = finished {
        state.stop(StopCause::StageFailed);
        return Err(PipelineError::stage(Stage::Renderer, "close output", e));
    }

    let report = throughput.snapshot();
    report.log("渲染完成");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Frame;
    use crate::pipeline::queue::{bounded, Outlet};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Log {
        written: Vec<u64>,
        finished: u32,
    }

    struct MemorySink {
        log: Arc<Mutex<Log>>,
        fail_at: Option<u64>,
    }

    impl OutputSink for MemorySink {
        fn write(&mut self, frame: &Frame) -> anyhow::Result<()> {
            if self.fail_at == Some(frame.index) {
                anyhow::bail!("Broken pipe");
            }
            self.log.lock().unwrap().written.push(frame.index);
            Ok(())
        }

        fn finish(self: Box<Self>) -> anyhow::Result<()> {
            self.log.lock().unwrap().finished += 1;
            Ok(())
        }

        fn describe(&self) -> String {
            "memory".into()
        }
    }

    fn records(indices: &[u64], state: &PipelineState) -> QueueReceiver<DetectionRecord> {
        let (mut tx, rx) = bounded("records", indices.len() + 1, state, Duration::from_millis(10));
        for &i in indices {
            tx.push(DetectionRecord::new(Frame::filled(i, 4, 4, [9, 9, 9]), vec![]))
                .unwrap();
        }
        tx.close();
        rx
    }

    #[test]
    fn test_writes_in_order_and_finishes_once() {
        let state = PipelineState::local();
        let mut rx = records(&[0, 1, 2, 3], &state);
        let log = Arc::new(Mutex::new(Log::default()));
        let sink = Box::new(MemorySink {
            log: log.clone(),
            fail_at: None,
        });
        let mut tp = Throughput::new(2, None);
        let report =
            run_renderer(&mut rx, &Annotator::boxes_only(2), sink, &mut tp, &state).unwrap();
        assert_eq!(report.frames, 4);
        let log = log.lock().unwrap();
        assert_eq!(log.written, vec![0, 1, 2, 3]);
        assert_eq!(log.finished, 1);
    }

    #[test]
    fn test_sink_failure_still_finishes() {
        let state = PipelineState::local();
        let mut rx = records(&[0, 1, 2, 3, 4], &state);
        let log = Arc::new(Mutex::new(Log::default()));
        let sink = Box::new(MemorySink {
            log: log.clone(),
            fail_at: Some(2),
        });
        let mut tp = Throughput::new(0, None);
        let err = run_renderer(&mut rx, &Annotator::boxes_only(2), sink, &mut tp, &state)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Stage {
                stage: Stage::Renderer,
                op: "write frame",
                ..
            }
        ));
        assert_eq!(state.cause(), Some(StopCause::StageFailed));
        let log = log.lock().unwrap();
        assert_eq!(log.written, vec![0, 1]);
        assert_eq!(log.finished, 1);
    }

    #[test]
    fn test_out_of_order_record_rejected() {
        let state = PipelineState::local();
        let mut rx = records(&[0, 2, 1], &state);
        let log = Arc::new(Mutex::new(Log::default()));
        let sink = Box::new(MemorySink {
            log: log.clone(),
            fail_at: None,
        });
        let mut tp = Throughput::new(0, None);
        let err = run_renderer(&mut rx, &Annotator::boxes_only(1), sink, &mut tp, &state)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Ordering { last: 2, got: 1, .. }));
        assert_eq!(log.lock().unwrap().finished, 1);
    }
}
