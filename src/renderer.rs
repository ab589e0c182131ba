/// 检测结果绘制 (Annotator)
///
/// 绘制是单条 DetectionRecord 的纯函数: 检测框 + 类别/置信度标签 + 左上角计数。
/// 没有可用字体时只画框, 不画文字。
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{info, warn};

use crate::detection::{Detection, DetectionRecord, Frame};

/// 高亮调色板 (按类别循环)
pub const PALETTE: [[u8; 3]; 12] = [
    [255, 0, 0],     // 红色
    [0, 255, 0],     // 绿色
    [0, 0, 255],     // 蓝色
    [255, 255, 0],   // 黄色
    [255, 0, 255],   // 品红
    [0, 255, 255],   // 青色
    [255, 128, 0],   // 橙色
    [255, 0, 128],   // 粉红
    [128, 255, 0],   // 黄绿
    [0, 128, 255],   // 天蓝
    [255, 255, 255], // 白色
    [128, 0, 255],   // 紫色
];

/// 未指定字体时依次尝试
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\msyh.ttc",
    "C:\\Windows\\Fonts\\arial.ttf",
];

pub fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

fn load_font(path: &Path) -> Result<FontVec> {
    let data = std::fs::read(path).with_context(|| format!("读取字体 {}", path.display()))?;
    FontVec::try_from_vec_and_index(data, 0)
        .map_err(|e| anyhow::anyhow!("解析字体 {}: {e}", path.display()))
}

pub struct Annotator {
    font: Option<FontVec>,
    line_width: u32,
}

impl Annotator {
    /// `font` 为 None 时在常见系统路径中查找
    pub fn new(font: Option<&PathBuf>, line_width: u32) -> Self {
        let font = match font {
            Some(path) => match load_font(path) {
                Ok(font) => Some(font),
                Err(e) => {
                    warn!("⚠️  {e:#}, 不绘制文字");
                    None
                }
            },
            None => FONT_CANDIDATES
                .iter()
                .map(Path::new)
                .filter(|p| p.exists())
                .find_map(|p| load_font(p).ok()),
        };
        match &font {
            Some(_) => info!("🔤 字体已加载"),
            None => warn!("⚠️  未找到可用字体, 只绘制检测框"),
        }
        Self {
            font,
            line_width: line_width.max(1),
        }
    }

    /// 只画框
    pub fn boxes_only(line_width: u32) -> Self {
        Self {
            font: None,
            line_width: line_width.max(1),
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// 绘制一条记录, 返回带标注的帧 (序号不变)
    pub fn render(&self, record: DetectionRecord) -> Result<Frame> {
        let DetectionRecord {
            frame, detections, ..
        } = record;
        let Frame {
            index,
            width,
            height,
            data,
            timestamp,
        } = frame;
        let mut canvas =
            RgbImage::from_raw(width, height, data).context("帧数据长度与尺寸不一致")?;

        for det in &detections {
            self.draw_box(&mut canvas, det);
        }
        if let Some(font) = &self.font {
            for det in &detections {
                Self::draw_label(&mut canvas, font, det);
            }
            Self::draw_readout(&mut canvas, font, &detections);
        }

        Ok(Frame::new(index, width, height, canvas.into_raw()).with_timestamp(timestamp))
    }

    fn draw_box(&self, canvas: &mut RgbImage, det: &Detection) {
        let (w, h) = (canvas.width() as f32, canvas.height() as f32);
        let b = det.bbox.clamp(w, h);
        if b.width() < 1. || b.height() < 1. {
            return;
        }
        let color = class_color(det.class_id);
        for k in 0..self.line_width as i32 {
            let rect = Rect::at(b.x1 as i32 - k, b.y1 as i32 - k).of_size(
                (b.width() as i32 + 2 * k).max(1) as u32,
                (b.height() as i32 + 2 * k).max(1) as u32,
            );
            draw_hollow_rect_mut(canvas, rect, color);
        }
    }

    fn label_scale(canvas: &RgbImage) -> PxScale {
        PxScale::from((canvas.height() as f32 / 54.).clamp(12., 48.))
    }

    fn draw_label(canvas: &mut RgbImage, font: &FontVec, det: &Detection) {
        let text = if det.label.is_empty() {
            format!("class {} {:.2}", det.class_id, det.confidence)
        } else {
            format!("{} {:.2}", det.label, det.confidence)
        };
        let scale = Self::label_scale(canvas);
        let (tw, th) = text_size(scale, font, &text);
        let x = det.bbox.x1.max(0.) as i32;
        let y = (det.bbox.y1 as i32 - th as i32 - 4).max(0);
        draw_filled_rect_mut(
            canvas,
            Rect::at(x, y).of_size(tw.max(1) + 4, th.max(1) + 4),
            class_color(det.class_id),
        );
        draw_text_mut(canvas, Rgb([0, 0, 0]), x + 2, y + 2, scale, font, &text);
    }

    /// 左上角: 总数 + 数量最多的几个类别
    fn draw_readout(canvas: &mut RgbImage, font: &FontVec, detections: &[Detection]) {
        let scale = PxScale::from(Self::label_scale(canvas).y * 1.5);
        let mut lines = vec![format!("Detections: {}", detections.len())];
        let summary = class_summary(detections, 3);
        if !summary.is_empty() {
            lines.push(summary);
        }

        let mut y = 20;
        for line in lines {
            let (tw, th) = text_size(scale, font, &line);
            draw_filled_rect_mut(
                canvas,
                Rect::at(16, y - 4).of_size(tw.max(1) + 8, th.max(1) + 8),
                Rgb([0, 0, 0]),
            );
            draw_text_mut(canvas, Rgb([0, 255, 0]), 20, y, scale, font, &line);
            y += th as i32 + 12;
        }
    }
}

/// 按数量降序的类别统计, 例如 `car 12  pedestrian 5`
pub fn class_summary(detections: &[Detection], top: usize) -> String {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for det in detections {
        let name = if det.label.is_empty() {
            format!("class {}", det.class_id)
        } else {
            det.label.clone()
        };
        *counts.entry(name).or_default() += 1;
    }
    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts
        .into_iter()
        .take(top)
        .map(|(name, n)| format!("{name} {n}"))
        .collect::<Vec<_>>()
        .join("  ")
}
