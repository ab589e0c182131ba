/// 流水线错误类型
///
/// 协作方(模型、视频源、输出端)内部使用 `anyhow::Result`,
/// 到达阶段边界时统一包装为 [`PipelineError`],并标明出错的阶段与操作。
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// 读取视频帧
    Source,
    /// 模型推理
    Detector,
    /// 绘制 + 编码输出
    Renderer,
    /// 控制器本身(启动、回收)
    Controller,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Source => "source",
            Stage::Detector => "detector",
            Stage::Renderer => "renderer",
            Stage::Controller => "controller",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// 启动阶段失败,没有任何帧被处理
    #[error("[{stage}] 启动失败 ({op}): {source:#}")]
    Setup {
        stage: Stage,
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// 运行中失败,已处理的帧保留在输出中
    #[error("[{stage}] {op} 失败: {source:#}")]
    Stage {
        stage: Stage,
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// 记录乱序(检测阶段的保序约束被破坏)
    #[error("[{stage}] 帧序号乱序: 期望 > {last}, 收到 {got}")]
    Ordering { stage: Stage, last: u64, got: u64 },

    #[error("[{stage}] 线程 panic")]
    Panicked { stage: Stage },

    /// 跨进程拓扑下子进程非正常退出
    #[error("[{stage}] 子进程异常退出 ({status}): {message}")]
    Worker {
        stage: Stage,
        status: String,
        message: String,
    },
}

impl PipelineError {
    pub fn setup(stage: Stage, op: &'static str, source: anyhow::Error) -> Self {
        PipelineError::Setup { stage, op, source }
    }

    pub fn stage(stage: Stage, op: &'static str, source: anyhow::Error) -> Self {
        PipelineError::Stage { stage, op, source }
    }

    /// 出错的阶段
    pub fn failed_stage(&self) -> Stage {
        match self {
            PipelineError::Setup { stage, .. }
            | PipelineError::Stage { stage, .. }
            | PipelineError::Ordering { stage, .. }
            | PipelineError::Panicked { stage }
            | PipelineError::Worker { stage, .. } => *stage,
        }
    }

    pub fn is_setup(&self) -> bool {
        matches!(self, PipelineError::Setup { .. })
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
