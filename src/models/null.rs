// 空模型: 不推理, 每帧返回空检测结果
// 用于测量解码/编码链路的纯吞吐, 以及无 GPU 环境下跑通完整拓扑

use anyhow::Result;
use tracing::info;

use super::{Model, PredictParams};
use crate::detection::{Detection, Frame};

#[derive(Debug, Default)]
pub struct NullModel {
    frames: u64,
}

impl Model for NullModel {
    fn predict(&mut self, frames: &[Frame], _params: &PredictParams) -> Result<Vec<Vec<Detection>>> {
        self.frames += frames.len() as u64;
        Ok(vec![Vec::new(); frames.len()])
    }

    fn summary(&self) {
        info!("🧪 空模型 (dry run): 不执行推理");
    }

    fn release(&mut self) {
        info!("🧪 空模型共处理 {} 帧", self.frames);
    }
}
