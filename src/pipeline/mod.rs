/// 视频处理流水线 (Video Processing Pipeline)
///
/// 三个阶段, 通过有界队列串联:
/// - Source:   读取视频帧 (批处理模式下独立运行)
/// - Detector: 目标检测 (批处理或流式)
/// - Renderer: 绘制检测框并写入输出
///
/// 两种拓扑共用同一套阶段循环:
/// - 线程: [`Controller`], 进程内 crossbeam 队列
/// - 进程: [`ProcessPipeline`], 子进程之间用管道, 进程内再接本地队列
///
/// 停止语义见 [`PipelineState`]: 源读完不会打断消费者, 失败或取消会让所有阶段尽快退出。
use std::sync::Once;

use tracing::warn;

pub mod controller;
pub mod detector;
pub mod ipc;
pub mod process;
pub mod queue;
pub mod renderer;
pub mod source;
pub mod state;

pub use controller::{Controller, QueueReport, RunSettings, RunSummary};
pub use process::{run_worker, Job, ProcessPipeline};
pub use queue::{bounded, Message, Outlet, PushError, QueueReceiver, QueueSender};
pub use state::{PipelineState, StopCause};

/// Ctrl-C 时置 `Cancelled`; 每个进程只安装一次
pub fn cancel_on_interrupt(state: &PipelineState) {
    static HANDLER: Once = Once::new();

    let state = state.clone();
    HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            if state.stop(StopCause::Cancelled) {
                warn!("⏹  收到中断信号, 正在停止...");
            }
        }) {
            warn!("安装 Ctrl-C 处理函数失败: {err}");
        }
    });
}
