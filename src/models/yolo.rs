// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLO 检测模型 (ONNX Runtime)
// 包含: letterbox 预处理、批推理、两种输出布局的后处理

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use fast_image_resize as fr;
use ndarray::{ArrayView2, ArrayView3, Axis};
use tracing::{debug, info, warn};

use super::{Model, PredictParams};
use crate::detection::{BBox, Detection, Frame};
use crate::non_max_suppression;
use crate::ort_backend::OrtBackend;

/// letterbox 填充灰度
const PAD_VALUE: f32 = 114.0 / 255.0;
const CXYWH_OFFSET: usize = 4;

/// 输出布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// `[B, 4+nc, N]`, 每列一个候选框, 需要 NMS
    Anchors { nc: usize, candidates: usize },
    /// `[B, N, 6]`, 每行 `x1 y1 x2 y2 conf cls`, 已经过 NMS
    EndToEnd { rows: usize },
}

impl OutputLayout {
    pub fn detect(shape: &[usize]) -> Result<Self> {
        ensure!(shape.len() == 3, "输出应为三维张量, 实际 {shape:?}");
        let (a, b) = (shape[1], shape[2]);
        if b == 6 && a > b {
            return Ok(OutputLayout::EndToEnd { rows: a });
        }
        ensure!(a > CXYWH_OFFSET, "无法识别的输出形状 {shape:?}");
        Ok(OutputLayout::Anchors {
            nc: a - CXYWH_OFFSET,
            candidates: b,
        })
    }
}

/// 等比缩放系数与缩放后尺寸
pub fn scale_wh(w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
    let r = (w1 / w0).min(h1 / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

/// 把一帧 letterbox 到 `dst` (CHW, 已填充 PAD_VALUE), 图像贴在左上角; 返回缩放系数
pub fn letterbox_into(
    frame: &Frame,
    (height, width): (usize, usize),
    resizer: &mut fr::Resizer,
    dst: &mut [f32],
) -> Result<f32> {
    ensure!(dst.len() == 3 * height * width, "输入缓冲区大小不符");
    let (ratio, w_new, h_new) = scale_wh(
        frame.width as f32,
        frame.height as f32,
        width as f32,
        height as f32,
    );
    let (w_new, h_new) = ((w_new as u32).clamp(1, width as u32), (h_new as u32).clamp(1, height as u32));

    let src = fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
        .context("创建缩放源图")?;
    let mut resized = fr::images::Image::new(w_new, h_new, fr::PixelType::U8x3);
    let options =
        fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    resizer
        .resize(&src, &mut resized, Some(&options))
        .context("缩放帧")?;

    let plane = height * width;
    let (w_new, h_new) = (w_new as usize, h_new as usize);
    let raw = resized.buffer();
    for y in 0..h_new {
        for x in 0..w_new {
            let p = (y * w_new + x) * 3;
            let o = y * width + x;
            dst[o] = raw[p] as f32 / 255.0;
            dst[plane + o] = raw[p + 1] as f32 / 255.0;
            dst[2 * plane + o] = raw[p + 2] as f32 / 255.0;
        }
    }
    Ok(ratio)
}

/// 解码锚点网格输出 (单张图, `C × N`)
pub fn decode_anchors(
    pred: ArrayView2<'_, f32>,
    ratio: f32,
    (w0, h0): (f32, f32),
    params: &PredictParams,
) -> Vec<Detection> {
    let mut data = Vec::new();
    for cand in pred.axis_iter(Axis(1)) {
        let Some((id, &confidence)) = cand
            .iter()
            .skip(CXYWH_OFFSET)
            .enumerate()
            .reduce(|max, x| if x.1 > max.1 { x } else { max })
        else {
            continue;
        };
        if confidence < params.conf || !params.keeps_class(id as u32) {
            continue;
        }
        let bbox = BBox::from_cxcywh(
            cand[0] / ratio,
            cand[1] / ratio,
            cand[2] / ratio,
            cand[3] / ratio,
        )
        .clamp(w0, h0);
        data.push(Detection::new(id as u32, confidence, bbox));
    }
    non_max_suppression(&mut data, params.iou, params.agnostic_nms);
    data.truncate(params.max_det);
    data
}

/// 解码端到端输出 (单张图, `N × 6`)
pub fn decode_end_to_end(
    pred: ArrayView2<'_, f32>,
    ratio: f32,
    (w0, h0): (f32, f32),
    params: &PredictParams,
) -> Vec<Detection> {
    let mut data: Vec<Detection> = pred
        .axis_iter(Axis(0))
        .filter_map(|row| {
            let confidence = row[4];
            let id = row[5].max(0.0).round() as u32;
            if confidence < params.conf || !params.keeps_class(id) {
                return None;
            }
            let bbox = BBox::new(row[0] / ratio, row[1] / ratio, row[2] / ratio, row[3] / ratio)
                .clamp(w0, h0);
            Some(Detection::new(id, confidence, bbox))
        })
        .collect();
    data.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    data.truncate(params.max_det);
    data
}

/// YOLO 检测模型
pub struct Yolo {
    engine: OrtBackend,
    path: PathBuf,
    /// 推理输入尺寸 (h, w)
    size: (usize, usize),
    resizer: fr::Resizer,
    profile: bool,
}

impl Yolo {
    pub fn new(path: &Path, params: &PredictParams) -> Result<Self> {
        let t = Instant::now();
        let engine = OrtBackend::build(path, params.device)?;
        let imgsz = params.imgsz as usize;
        let size = match engine.size() {
            Some(fixed) => {
                if fixed != (imgsz, imgsz) {
                    warn!(
                        "⚠️  模型输入固定为 {}x{}, 忽略推理分辨率 {imgsz}",
                        fixed.1, fixed.0
                    );
                }
                fixed
            }
            None => (imgsz, imgsz),
        };
        info!("模型加载耗时 {:?}", t.elapsed());
        Ok(Self {
            engine,
            path: path.to_path_buf(),
            size,
            resizer: fr::Resizer::new(),
            profile: std::env::var_os("YOLO_PROFILE").is_some(),
        })
    }

    /// 推理一组帧, 组大小不超过模型固定批大小
    fn run_chunk(&mut self, frames: &[Frame], params: &PredictParams) -> Result<Vec<Vec<Detection>>> {
        let (h, w) = self.size;
        let plane = 3 * h * w;
        // 固定批大小的模型: 不足的部分用填充图补齐, 结果丢弃
        let rows = self.engine.batch().unwrap_or(frames.len()).max(frames.len());

        let t_pre = Instant::now();
        let mut input = vec![PAD_VALUE; rows * plane];
        let mut ratios = Vec::with_capacity(frames.len());
        for (frame, dst) in frames.iter().zip(input.chunks_exact_mut(plane)) {
            ratios.push(letterbox_into(frame, self.size, &mut self.resizer, dst)?);
        }

        let t_run = Instant::now();
        let (shape, data) = self.engine.run([rows, 3, h, w], input)?;
        let t_post = Instant::now();

        let layout = OutputLayout::detect(&shape)?;
        ensure!(shape[0] >= frames.len(), "模型输出批大小 {} < {}", shape[0], frames.len());
        let preds = ArrayView3::from_shape((shape[0], shape[1], shape[2]), &data)
            .context("整理模型输出")?;

        let mut ys = Vec::with_capacity(frames.len());
        for (idx, (frame, ratio)) in frames.iter().zip(ratios).enumerate() {
            let pred = preds.index_axis(Axis(0), idx);
            let wh = (frame.width as f32, frame.height as f32);
            let dets = match layout {
                OutputLayout::Anchors { .. } => decode_anchors(pred, ratio, wh, params),
                OutputLayout::EndToEnd { .. } => decode_end_to_end(pred, ratio, wh, params),
            };
            ys.push(dets);
        }

        if self.profile {
            debug!(
                "[预处理] {:?} | [推理] {:?} | [后处理] {:?}",
                t_run - t_pre,
                t_post - t_run,
                t_post.elapsed()
            );
        }
        Ok(ys)
    }
}

impl Model for Yolo {
    fn predict(&mut self, frames: &[Frame], params: &PredictParams) -> Result<Vec<Vec<Detection>>> {
        for frame in frames {
            if frame.data.len() != frame.expected_len() {
                bail!("帧 {} 数据长度与尺寸不符", frame.index);
            }
        }
        let chunk = self.engine.batch().unwrap_or(frames.len()).max(1);
        let mut ys = Vec::with_capacity(frames.len());
        for group in frames.chunks(chunk) {
            ys.extend(self.run_chunk(group, params)?);
        }
        Ok(ys)
    }

    fn class_names(&self) -> Option<Vec<String>> {
        let names = self.engine.names();
        (!names.is_empty()).then(|| names.to_vec())
    }

    fn summary(&self) {
        self.engine.summary(&self.path);
    }

    fn release(&mut self) {
        info!("释放模型: {}", self.path.display());
    }
}
