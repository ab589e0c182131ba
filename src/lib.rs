// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 配置 (JSON + 命令行)
pub mod detection; // 帧与检测结果
pub mod error; // 流水线错误
pub mod input; // 视频输入
pub mod logging; // 日志初始化
pub mod models; // 模型接口与具体实现
#[cfg(feature = "onnx")]
pub mod ort_backend; // ONNX Runtime 推理后端
pub mod output; // 视频输出
pub mod pipeline; // 三阶段流水线
pub mod renderer; // 检测框绘制
pub mod telemetry; // 吞吐统计
pub mod utils;

pub use crate::config::{DetectMode, PipelineConfig, RunArgs, Topology};
pub use crate::detection::{BBox, Detection, DetectionRecord, Frame, StreamInfo};
pub use crate::error::{PipelineError, PipelineResult, Stage};
pub use crate::models::{Model, ModelSpec, PredictParams, Precision};
pub use crate::pipeline::{Controller, PipelineState, ProcessPipeline, RunSettings, RunSummary};

/// 按置信度降序排序后做 NMS, 原地保留幸存者
///
/// `agnostic` 为 false 时只在同类别之间抑制。
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32, agnostic: bool) {
    xs.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            if !agnostic && xs[prev_index].class_id != xs[index].class_id {
                continue;
            }
            if xs[prev_index].bbox.iou(&xs[index].bbox) > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S",
        delimiter, delimiter, delimiter, delimiter, delimiter
    );
    let now = chrono::Utc::now();
    match chrono::FixedOffset::east_opt(8 * 60 * 60) {
        // Beijing
        Some(offset) => now.with_timezone(&offset).format(&fmt).to_string(),
        None => now.format(&fmt).to_string(),
    }
}
