// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端
// 负责: 会话创建 (CUDA 优先, CPU 兜底)、输入张量元信息、类别名元数据、执行推理

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use half::f16;
use once_cell::sync::Lazy;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::Tensor;
use regex::Regex;
use tracing::{info, warn};

/// Ultralytics 导出的 `names` 元数据: `{0: 'person', 1: 'bicycle', ...}`
static NAME_ENTRY: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r#"(\d+)\s*:\s*['"]([^'"]*)['"]"#).ok());

/// 解析类别名元数据, 按类别序号排序
pub fn parse_names(meta: &str) -> Vec<String> {
    let Some(re) = NAME_ENTRY.as_ref() else {
        return Vec::new();
    };
    let mut entries: Vec<(usize, String)> = re
        .captures_iter(meta)
        .filter_map(|c| Some((c[1].parse().ok()?, c[2].to_string())))
        .collect();
    entries.sort_by_key(|(i, _)| *i);
    entries.into_iter().map(|(_, name)| name).collect()
}

/// 输入元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    F32,
    F16,
}

pub struct OrtBackend {
    session: Session,
    input_kind: InputKind,
    /// 固定批大小; None 表示动态
    batch: Option<usize>,
    /// 固定输入尺寸 (h, w); None 表示动态
    size: Option<(usize, usize)>,
    names: Vec<String>,
}

impl OrtBackend {
    pub fn build(path: &Path, device: usize) -> Result<Self> {
        if !path.exists() {
            bail!("模型文件不存在: {}", path.display());
        }
        let session = Session::builder()
            .context("创建 ORT 会话构建器")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("设置图优化级别")?
            .with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(device as i32)
                .build()])
            .context("注册 CUDA 执行提供者")?
            .commit_from_file(path)
            .with_context(|| format!("加载模型 {}", path.display()))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| anyhow!("模型没有输入"))?;
        let input_kind = match input.input_type.tensor_type() {
            Some(TensorElementType::Float32) => InputKind::F32,
            Some(TensorElementType::Float16) => InputKind::F16,
            other => bail!("不支持的输入类型: {other:?}"),
        };
        let dims: Vec<i64> = input
            .input_type
            .tensor_shape()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        if dims.len() != 4 {
            bail!("输入应为 NCHW 四维张量, 实际 {dims:?}");
        }
        let fixed = |d: i64| (d > 0).then_some(d as usize);
        let batch = fixed(dims[0]);
        let size = fixed(dims[2]).zip(fixed(dims[3]));

        let names = match session.metadata().and_then(|m| m.custom("names")) {
            Ok(Some(meta)) => parse_names(&meta),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("读取模型元数据失败: {e}");
                Vec::new()
            }
        };

        Ok(Self {
            session,
            input_kind,
            batch,
            size,
            names,
        })
    }

    pub fn input_kind(&self) -> InputKind {
        self.input_kind
    }

    pub fn batch(&self) -> Option<usize> {
        self.batch
    }

    pub fn size(&self) -> Option<(usize, usize)> {
        self.size
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// 执行推理, 返回第一个输出的形状与数据 (统一转为 f32)
    pub fn run(&mut self, shape: [usize; 4], data: Vec<f32>) -> Result<(Vec<usize>, Vec<f32>)> {
        let outputs = match self.input_kind {
            InputKind::F32 => {
                let x = Tensor::from_array((shape, data.into_boxed_slice()))?;
                self.session.run(ort::inputs![x])?
            }
            InputKind::F16 => {
                let half: Vec<f16> = data.into_iter().map(f16::from_f32).collect();
                let x = Tensor::from_array((shape, half.into_boxed_slice()))?;
                self.session.run(ort::inputs![x])?
            }
        };

        let y = &outputs[0];
        let (shape, data) = match y.try_extract_tensor::<f32>() {
            Ok((shape, data)) => (dims(shape), data.to_vec()),
            Err(_) => {
                let (shape, data) = y
                    .try_extract_tensor::<f16>()
                    .context("读取模型输出")?;
                (dims(shape), data.iter().map(|v| v.to_f32()).collect())
            }
        };
        Ok((shape, data))
    }

    pub fn summary(&self, path: &Path) {
        info!(
            "🧠 模型: {} | 输入 {:?} | 批大小 {} | 尺寸 {} | 类别数 {}",
            path.display(),
            self.input_kind,
            self.batch.map_or_else(|| "动态".to_string(), |b| b.to_string()),
            self.size
                .map_or_else(|| "动态".to_string(), |(h, w)| format!("{w}x{h}")),
            self.names.len()
        );
    }
}

fn dims(shape: &[i64]) -> Vec<usize> {
    shape.iter().map(|&d| d.max(0) as usize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        let meta = "{0: 'pedestrian', 2: 'bicycle', 1: \"people\"}";
        assert_eq!(parse_names(meta), vec!["pedestrian", "people", "bicycle"]);
        assert!(parse_names("").is_empty());
    }
}
