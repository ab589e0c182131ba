/// 读取阶段 (Source stage)
/// 职责: 视频源 → 逐帧入队 → 结束时发送结束标记并置停止标志
use tracing::{error, info, info_span, warn};

use super::queue::{Outlet, PushError};
use super::state::{PipelineState, StopCause};
use crate::detection::Frame;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::input::FrameSource;

/// 运行读取循环, 返回成功入队的帧数
///
/// 队列满时阻塞, 从不丢帧。读到结尾或读取失败都会发送结束标记;
/// 读取失败同时作为阶段错误返回。
pub fn run_source(
    source: &mut dyn FrameSource,
    out: &mut dyn Outlet<Frame>,
    state: &PipelineState,
) -> PipelineResult<u64> {
    let _span = info_span!("source").entered();
    info!("🎬 读取阶段启动");

    let mut sent = 0u64;
    let result = loop {
        if state.is_aborted() {
            info!("读取阶段收到停止信号");
            break Ok(());
        }
        match source.next_frame() {
            Ok(Some(frame)) => match out.push(frame) {
                Ok(()) => sent += 1,
                Err(PushError::Stopped) => break Ok(()),
                Err(PushError::Disconnected) => {
                    warn!("⚠️  下游已退出, 停止读取");
                    break Ok(());
                }
            },
            Ok(None) => break Ok(()),
            Err(e) => break Err(PipelineError::stage(Stage::Source, "read frame", e)),
        }
    };
    source.close();

    match result {
        Ok(()) => {
            out.close();
            state.stop(StopCause::SourceExhausted);
            info!("✅ 读取阶段结束: {sent} 帧");
            Ok(sent)
        }
        Err(e) => {
            error!("❌ {e}");
            state.stop(StopCause::StageFailed);
            out.close();
            Err(e)
        }
    }
}
