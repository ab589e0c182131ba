/// 流水线配置
///
/// 三层来源, 后者覆盖前者: 默认值 → `--config` JSON 文件 → 命令行参数。
/// 同一份 `PipelineConfig` 也作为任务描述交给子进程。
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::input::InputOptions;
use crate::models::{ModelSpec, PredictParams, Precision};
use crate::output::{EncoderSettings, SinkKind};

/// VisDrone 数据集类别 (无人机航拍)
pub const VISDRONE_NAMES: [&str; 10] = [
    "pedestrian",
    "people",
    "bicycle",
    "car",
    "van",
    "truck",
    "tricycle",
    "awning-tricycle",
    "bus",
    "motor",
];

/// 检测模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DetectMode {
    /// 固定批大小 (默认)
    #[default]
    Batch,
    /// 逐帧流式, 检测阶段直接读取视频源
    Stream,
}

/// 运行拓扑
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// 同一进程内三个线程
    #[default]
    Threads,
    /// 三个子进程, 管道相连
    Processes,
}

/// 分辨率预设
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Preset {
    /// 960 推理分辨率, 队列 128
    #[value(name = "960")]
    P960,
    /// 1280 推理分辨率, 队列 30 (帧更大, 限制内存)
    #[value(name = "1280")]
    P1280,
}

impl Preset {
    pub fn imgsz(self) -> u32 {
        match self {
            Preset::P960 => 960,
            Preset::P1280 => 1280,
        }
    }

    pub fn queue_capacity(self) -> usize {
        match self {
            Preset::P960 => 128,
            Preset::P1280 => 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input: PathBuf,
    /// None 时生成 `annotated_<时间>.mp4`
    pub output: Option<PathBuf>,
    pub model: PathBuf,
    #[serde(flatten)]
    pub params: PredictParams,
    pub batch: usize,
    pub queue_capacity: usize,
    pub mode: DetectMode,
    pub topology: Topology,
    /// 队列超时轮询间隔 (毫秒)
    pub poll_interval_ms: u64,
    /// 每 K 帧输出一次统计, 0 关闭
    pub report_every: u64,
    /// 统计中查询显存
    pub gpu_stats: bool,
    pub sink: SinkKind,
    pub encoder: EncoderSettings,
    pub decoder: InputOptions,
    /// 类别名, 覆盖模型自带的名称
    pub class_names: Option<Vec<String>>,
    pub font: Option<PathBuf>,
    pub line_width: u32,
    /// 不加载模型, 只测 I/O 吞吐
    pub dry_run: bool,
    /// 进程拓扑下等待子进程就绪的超时 (秒)
    pub startup_timeout_secs: u64,
    pub log_level: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: None,
            model: PathBuf::from("models/yolov8m-visdrone.onnx"),
            params: PredictParams::default(),
            batch: 4,
            queue_capacity: 128,
            mode: DetectMode::Batch,
            topology: Topology::Threads,
            poll_interval_ms: 100,
            report_every: 30,
            gpu_stats: true,
            sink: SinkKind::Auto,
            encoder: EncoderSettings::default(),
            decoder: InputOptions::default(),
            class_names: None,
            font: None,
            line_width: 2,
            dry_run: false,
            startup_timeout_secs: 300,
            log_level: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置 {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("解析配置 {}", path.display()))?;
        info!("📄 已加载配置: {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("写入配置 {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.input.as_os_str().is_empty(), "缺少输入视频 (--input)");
        ensure!(self.batch >= 1, "批大小必须 >= 1");
        ensure!(self.queue_capacity >= 1, "队列容量必须 >= 1");
        ensure!(self.poll_interval_ms >= 1, "轮询间隔必须 >= 1ms");
        ensure!(
            (0.0..=1.0).contains(&self.params.conf),
            "置信度阈值必须在 [0, 1] 内"
        );
        ensure!(
            (0.0..=1.0).contains(&self.params.iou),
            "IoU 阈值必须在 [0, 1] 内"
        );
        ensure!(
            self.params.imgsz >= 32 && self.params.imgsz % 32 == 0,
            "推理分辨率 {} 必须是 32 的倍数",
            self.params.imgsz
        );
        ensure!(self.params.max_det >= 1, "max_det 必须 >= 1");
        Ok(())
    }

    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("annotated_{}.mp4", crate::gen_time_string("-"))))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec {
            path: self.model.clone(),
            params: self.params.clone(),
            dry_run: self.dry_run,
        }
    }

    /// 查询显存用的设备序号
    pub fn stats_device(&self) -> Option<usize> {
        self.gpu_stats.then_some(self.params.device)
    }
}

/// 读取类别名: `visdrone` 关键字或每行一个名称的文本文件
pub fn load_names(spec: &str) -> Result<Vec<String>> {
    if spec.eq_ignore_ascii_case("visdrone") {
        return Ok(VISDRONE_NAMES.iter().map(|s| s.to_string()).collect());
    }
    let text = std::fs::read_to_string(spec).with_context(|| format!("读取类别名 {spec}"))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// 视频检测参数
#[derive(Parser, Debug, Clone, Default)]
pub struct RunArgs {
    /// JSON 配置文件 (命令行参数优先)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 输入视频 (.mp4/.mov/..., 或 .y4m)
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// 输出视频 (.y4m 直接写入, 其他格式交给 ffmpeg 编码)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// ONNX 模型
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// 分辨率预设 (设置推理分辨率与队列容量)
    #[arg(long, value_enum)]
    pub preset: Option<Preset>,

    /// 推理分辨率
    #[arg(long)]
    pub imgsz: Option<u32>,

    /// 批大小
    #[arg(short, long)]
    pub batch: Option<usize>,

    /// 队列容量
    #[arg(long)]
    pub queue: Option<usize>,

    /// 检测模式
    #[arg(long, value_enum)]
    pub mode: Option<DetectMode>,

    /// 运行拓扑
    #[arg(long, value_enum)]
    pub topology: Option<Topology>,

    /// 推理精度
    #[arg(long, value_enum)]
    pub precision: Option<Precision>,

    /// 置信度阈值
    #[arg(long)]
    pub conf: Option<f32>,

    /// NMS IoU 阈值
    #[arg(long)]
    pub iou: Option<f32>,

    /// 跨类别 NMS
    #[arg(long)]
    pub agnostic_nms: bool,

    /// 每帧最多检测数
    #[arg(long)]
    pub max_det: Option<usize>,

    /// 只保留这些类别, 例如 `--classes 0,1,2`
    #[arg(long, value_delimiter = ',')]
    pub classes: Option<Vec<u32>>,

    /// GPU 序号
    #[arg(long)]
    pub device: Option<usize>,

    /// 输出类型
    #[arg(long, value_enum)]
    pub sink: Option<SinkKind>,

    /// 编码程序 (默认 ffmpeg)
    #[arg(long)]
    pub encoder_program: Option<PathBuf>,

    /// 视频编码器 (h264_nvenc / libx264 / auto ...)
    #[arg(long)]
    pub codec: Option<String>,

    /// 编码预设
    #[arg(long)]
    pub encoder_preset: Option<String>,

    /// 编码码率
    #[arg(long)]
    pub bitrate: Option<String>,

    /// 硬件解码, 例如 cuda
    #[arg(long)]
    pub hwaccel: Option<String>,

    /// 类别名: visdrone 或文本文件 (每行一个)
    #[arg(long)]
    pub names: Option<String>,

    /// 标注字体 (.ttf/.ttc)
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// 每 K 帧输出一次统计
    #[arg(long)]
    pub report_every: Option<u64>,

    /// 不查询显存
    #[arg(long)]
    pub no_gpu_stats: bool,

    /// 不加载模型, 只测 I/O 吞吐
    #[arg(long)]
    pub dry_run: bool,

    /// 日志级别 (RUST_LOG 优先)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl RunArgs {
    /// 合并配置文件与命令行参数
    pub fn into_config(self) -> Result<PipelineConfig> {
        let mut c = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(preset) = self.preset {
            c.params.imgsz = preset.imgsz();
            c.queue_capacity = preset.queue_capacity();
        }
        if let Some(v) = self.input {
            c.input = v;
        }
        if let Some(v) = self.output {
            c.output = Some(v);
        }
        if let Some(v) = self.model {
            c.model = v;
        }
        if let Some(v) = self.imgsz {
            c.params.imgsz = v;
        }
        if let Some(v) = self.batch {
            c.batch = v;
        }
        if let Some(v) = self.queue {
            c.queue_capacity = v;
        }
        if let Some(v) = self.mode {
            c.mode = v;
        }
        if let Some(v) = self.topology {
            c.topology = v;
        }
        if let Some(v) = self.precision {
            c.params.precision = v;
        }
        if let Some(v) = self.conf {
            c.params.conf = v;
        }
        if let Some(v) = self.iou {
            c.params.iou = v;
        }
        if self.agnostic_nms {
            c.params.agnostic_nms = true;
        }
        if let Some(v) = self.max_det {
            c.params.max_det = v;
        }
        if let Some(v) = self.classes {
            c.params.classes = Some(v);
        }
        if let Some(v) = self.device {
            c.params.device = v;
        }
        if let Some(v) = self.sink {
            c.sink = v;
        }
        if let Some(v) = self.encoder_program {
            c.encoder.program = v;
        }
        if let Some(v) = self.codec {
            c.encoder.codec = v;
        }
        if let Some(v) = self.encoder_preset {
            c.encoder.preset = v;
        }
        if let Some(v) = self.bitrate {
            c.encoder.bitrate = v;
        }
        if let Some(v) = self.hwaccel {
            c.decoder.hwaccel = Some(v);
        }
        if let Some(spec) = self.names {
            c.class_names = Some(load_names(&spec)?);
        }
        if let Some(v) = self.font {
            c.font = Some(v);
        }
        if let Some(v) = self.report_every {
            c.report_every = v;
        }
        if self.no_gpu_stats {
            c.gpu_stats = false;
        }
        if self.dry_run {
            c.dry_run = true;
        }
        if let Some(v) = self.log_level {
            c.log_level = v;
        }

        c.validate()?;
        Ok(c)
    }
}
