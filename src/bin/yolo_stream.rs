/// 视频目标检测流水线
///
/// 读取视频 → 批量/流式 YOLO 推理 → 绘制检测框 → 编码输出
///
/// 子命令:
/// - run:    运行流水线 (线程或多进程拓扑)
/// - probe:  打印视频参数
/// - worker: 多进程拓扑下的子进程入口 (内部使用)
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tracing::{error, info};

use yolo_stream_rs::config::{PipelineConfig, RunArgs, Topology};
use yolo_stream_rs::error::{PipelineError, PipelineResult, Stage};
use yolo_stream_rs::input::{self, InputOptions};
use yolo_stream_rs::logging::init_logging;
use yolo_stream_rs::pipeline::{self, process, Controller, Job, ProcessPipeline, RunSettings, RunSummary};
use yolo_stream_rs::renderer::Annotator;
use yolo_stream_rs::{models, output};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// 被 Ctrl-C 中断时的退出码
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(author, version, about = "视频目标检测流水线", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 检测视频并输出带标注的视频
    Run(RunArgs),

    /// 打印视频参数 (JSON)
    Probe {
        /// 输入视频
        input: PathBuf,

        /// 硬件解码, 例如 cuda
        #[arg(long)]
        hwaccel: Option<String>,
    },

    #[command(hide = true)]
    Worker {
        #[arg(long, value_enum)]
        stage: Stage,

        #[arg(long)]
        job: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Probe { input, hwaccel } => probe(input, hwaccel),
        Commands::Worker { stage, job } => worker(stage, job),
    }
}

fn run(args: RunArgs) -> ExitCode {
    init_logging(args.log_level.as_deref().unwrap_or("info"));
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ 配置错误: {e:#}");
            return ExitCode::from(2);
        }
    };

    info!("🚀 视频检测启动");
    info!("📹 输入: {}", config.input.display());
    info!("📦 模型: {}", if config.dry_run { "(dry-run)".into() } else { config.model.display().to_string() });

    let result = match config.topology {
        Topology::Threads => run_threads(&config),
        Topology::Processes => run_processes(config),
    };

    match result {
        Ok(summary) if summary.cancelled => ExitCode::from(EXIT_CANCELLED),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {e}");
            if e.is_setup() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run_threads(config: &PipelineConfig) -> PipelineResult<RunSummary> {
    let output_path = config.output_path();
    let source = input::open(&config.input, &config.decoder)
        .map_err(|e| PipelineError::setup(Stage::Source, "open input", e))?;
    let info = *source.info();
    info!(
        "🎞  {}x{} @ {:.2} fps, {} 帧",
        info.width,
        info.height,
        info.fps,
        info.frame_count
            .map_or_else(|| "未知".to_string(), |n| n.to_string())
    );

    let sink = output::open(&output_path, &info, config.sink, &config.encoder)
        .map_err(|e| PipelineError::setup(Stage::Renderer, "open output", e))?;
    info!("💾 输出: {}", output_path.display());
    let annotator = Annotator::new(config.font.as_ref(), config.line_width);

    let controller = Controller::new(RunSettings::from(config));
    pipeline::cancel_on_interrupt(&controller.state());
    let spec = config.model_spec();
    controller.run(source, move || models::load(&spec), sink, annotator)
}

fn run_processes(config: PipelineConfig) -> PipelineResult<RunSummary> {
    let setup = |op: &'static str, e: anyhow::Error| PipelineError::setup(Stage::Controller, op, e);
    let info = input::stream_info(&config.input, &config.decoder)
        .map_err(|e| PipelineError::setup(Stage::Source, "probe input", e))?;
    if !config.dry_run && !config.model.is_file() {
        return Err(PipelineError::setup(
            Stage::Detector,
            "load model",
            anyhow::anyhow!("模型文件不存在: {}", config.model.display()),
        ));
    }
    let exe = std::env::current_exe().map_err(|e| setup("locate executable", e.into()))?;
    let pipeline = ProcessPipeline::new(config, info, exe).map_err(|e| setup("prepare run dir", e))?;
    info!("💾 输出: {}", pipeline.output().display());
    pipeline::cancel_on_interrupt(&pipeline.state());
    pipeline.run()
}

fn probe(path: PathBuf, hwaccel: Option<String>) -> ExitCode {
    init_logging("warn");
    let options = InputOptions {
        hwaccel,
        ..Default::default()
    };
    match input::stream_info(&path, &options).and_then(|info| Ok(serde_json::to_string_pretty(&info)?)) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn worker(stage: Stage, job_path: PathBuf) -> ExitCode {
    let job = match Job::load(&job_path) {
        Ok(job) => job,
        Err(e) => {
            // 日志尚未初始化
            eprintln!("❌ {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&job.config.log_level);
    let result = process::validate_stage(&job, stage).and_then(|_| process::run_worker(stage, &job));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ [{stage}] {e:#}");
            ExitCode::FAILURE
        }
    }
}
