/// 模型统一接口与实现
///
/// # 架构说明
///
/// 流水线只依赖 [`Model`] trait, 具体推理后端对它是黑盒:
/// - **Yolo**: ONNX Runtime 推理 (CUDA / CPU), 文件: `yolo.rs`
///   - 锚点网格输出 `[B, 4+nc, N]` (v8/v11, 需要 NMS)
///   - 端到端输出 `[B, N, 6]` (v10/v26, 无需 NMS)
/// - **NullModel**: 不做推理, 每帧返回空结果; 用于测量纯 I/O 吞吐
///
/// ## 推理参数
/// 置信度、IoU、类别过滤等参数通过 [`PredictParams`] 原样传给模型,
/// 流水线本身不解释它们。
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::detection::{Detection, DetectionRecord, Frame};
use crate::input::FrameSource;

pub mod null;
#[cfg(feature = "onnx")]
pub mod yolo;

pub use null::NullModel;
#[cfg(feature = "onnx")]
pub use yolo::Yolo;

/// 推理精度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// FP32
    Full,
    /// FP16 (默认)
    #[default]
    Half,
}

/// 推理参数, 原样传给模型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictParams {
    /// 推理分辨率 (正方形边长)
    pub imgsz: u32,
    /// GPU 序号
    pub device: usize,
    pub precision: Precision,
    /// 置信度阈值
    pub conf: f32,
    /// NMS IoU 阈值
    pub iou: f32,
    /// 跨类别 NMS
    pub agnostic_nms: bool,
    /// 每帧最多保留的检测数
    pub max_det: usize,
    /// 只保留这些类别 (None 表示全部)
    pub classes: Option<Vec<u32>>,
}

impl Default for PredictParams {
    fn default() -> Self {
        Self {
            imgsz: 960,
            device: 0,
            precision: Precision::Half,
            conf: 0.15,
            iou: 0.7,
            agnostic_nms: false,
            max_det: 4000,
            classes: None,
        }
    }
}

impl PredictParams {
    /// 类别是否通过过滤
    pub fn keeps_class(&self, class_id: u32) -> bool {
        self.classes
            .as_ref()
            .map_or(true, |classes| classes.contains(&class_id))
    }
}

/// 统一的检测模型接口
///
/// ## 核心流程
/// ```text
/// 帧批次 → predict → 每帧一组检测结果 (顺序与输入一致)
/// ```
///
/// 模型与其设备上下文只属于检测阶段所在的线程/进程, 不会被共享。
pub trait Model: Send {
    /// 批量推理
    ///
    /// # Returns
    /// * 与 `frames` 等长, 第 i 项对应 `frames[i]`
    fn predict(&mut self, frames: &[Frame], params: &PredictParams) -> Result<Vec<Vec<Detection>>>;

    /// 逐帧流式推理: 直接从视频源拉帧, 每帧就绪即产出
    ///
    /// 默认实现基于 `predict`, 有原生流式接口的后端可以重写。
    fn stream<'a>(
        &'a mut self,
        source: &'a mut dyn FrameSource,
        params: &'a PredictParams,
    ) -> Box<dyn Iterator<Item = Result<DetectionRecord>> + 'a> {
        let mut done = false;
        Box::new(std::iter::from_fn(move || {
            if done {
                return None;
            }
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    done = true;
                    return None;
                }
                Err(e) => {
                    done = true;
                    return Some(Err(e.context("读取视频帧")));
                }
            };
            let result = self
                .predict(std::slice::from_ref(&frame), params)
                .and_then(|mut ys| {
                    anyhow::ensure!(ys.len() == 1, "模型返回 {} 组结果, 期望 1", ys.len());
                    Ok(DetectionRecord::new(frame, ys.remove(0)))
                });
            if result.is_err() {
                done = true;
            }
            Some(result)
        }))
    }

    /// 模型自带的类别名
    fn class_names(&self) -> Option<Vec<String>> {
        None
    }

    /// 打印模型信息
    fn summary(&self) {}

    /// 释放设备缓存, 检测阶段退出时调用一次
    fn release(&mut self) {}
}

/// 模型加载选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub params: PredictParams,
    /// 不加载模型, 使用 NullModel
    pub dry_run: bool,
}

/// 在当前线程/进程中创建模型
pub fn load(spec: &ModelSpec) -> Result<Box<dyn Model>> {
    if spec.dry_run {
        return Ok(Box::new(NullModel::default()));
    }
    load_onnx(spec)
}

#[cfg(feature = "onnx")]
fn load_onnx(spec: &ModelSpec) -> Result<Box<dyn Model>> {
    let model = Yolo::new(&spec.path, &spec.params)?;
    model.summary();
    Ok(Box::new(model))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(spec: &ModelSpec) -> Result<Box<dyn Model>> {
    anyhow::bail!(
        "未启用 onnx 特性, 无法加载 {}; 使用 --dry-run 或重新编译",
        spec.path.display()
    )
}
