/// 检测数据 (Detection data)
///
/// 阶段之间传递的数据结构:
/// - Frame:           Source → Detector
/// - DetectionRecord: Detector → Renderer
pub mod types;

pub use types::{BBox, Detection, DetectionRecord, Frame, StreamInfo};
