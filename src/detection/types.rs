/// 流水线数据结构定义
/// Data structures flowing between pipeline stages
use serde::{Deserialize, Serialize};

// ========== 视频流信息 ==========

/// 视频流元数据 (Source 打开时确定, 输出端按此创建)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// 容器声明的总帧数 (可能缺失)
    pub frame_count: Option<u64>,
}

impl StreamInfo {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            frame_count: None,
        }
    }

    /// 单帧 RGB24 字节数
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// 第 index 帧的时间戳(秒)
    pub fn timestamp(&self, index: u64) -> Option<f64> {
        (self.fps > 0.0).then(|| index as f64 / self.fps)
    }
}

// ========== 帧 ==========

/// 原始视频帧 (RGB24 紧凑排列)
///
/// 入队即转移所有权, 生成后不再修改。
#[derive(Clone, PartialEq)]
pub struct Frame {
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    pub timestamp: Option<f64>,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("bytes", &self.data.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl Frame {
    pub fn new(index: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            width,
            height,
            data,
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Option<f64>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 纯色帧, 测试与空跑时使用
    pub fn filled(index: u64, width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self::new(index, width, height, data)
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

// ========== 检测结果 ==========

/// 检测框 (源图像素坐标, 左上 + 右下)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 从中心点 + 宽高构造
    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2., cy - h / 2., cx + w / 2., cy + h / 2.)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// 裁剪到图像范围内
    pub fn clamp(self, width: f32, height: f32) -> Self {
        Self::new(
            self.x1.clamp(0., width),
            self.y1.clamp(0., height),
            self.x2.clamp(0., width),
            self.y2.clamp(0., height),
        )
    }

    pub fn intersection_area(&self, another: &BBox) -> f32 {
        let l = self.x1.max(another.x1);
        let r = self.x2.min(another.x2);
        let t = self.y1.max(another.y1);
        let b = self.y2.min(another.y2);
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn union(&self, another: &BBox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &BBox) -> f32 {
        let union = self.union(another);
        if union <= 0. {
            return 0.;
        }
        self.intersection_area(another) / union
    }
}

/// 单个检测目标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    /// 类别名 (由检测阶段填入, 可为空)
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
}

impl Detection {
    pub fn new(class_id: u32, confidence: f32, bbox: BBox) -> Self {
        Self {
            class_id,
            label: String::new(),
            confidence,
            bbox,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// 检测记录: 每个输入帧恰好对应一条, 序号相同
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRecord {
    pub index: u64,
    pub frame: Frame,
    pub detections: Vec<Detection>,
}

impl DetectionRecord {
    pub fn new(frame: Frame, detections: Vec<Detection>) -> Self {
        Self {
            index: frame.index,
            frame,
            detections,
        }
    }
}
