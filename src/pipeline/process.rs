/// 进程拓扑 (Process topology)
///
/// 每个阶段是当前可执行文件的一个子进程 (`worker --stage <S> --job <job.json>`),
/// 相邻阶段通过匿名管道连接:
///
/// ```text
///   控制器 ──gate──▶ source ──stdout│stdin──▶ detector ──stdout│stdin──▶ renderer
/// ```
///
/// 运行目录 (临时目录) 内的约定:
/// - `job.json`:               配置 + 视频参数 + 输出路径
/// - `<stage>.ready`:          子进程初始化完成 (模型已加载、输出已打开)
/// - `<stage>.err`:            子进程失败原因
/// - `stop`:                   停止标志 (内容为停止原因)
/// - `renderer.summary.json`:  渲染进程的最终统计
///
/// 第一个阶段 (批处理下为 source, 流式下为 detector) 的 stdin 是启动闸门:
/// 全部子进程就绪后控制器写入 `go`, 之后帧才开始流动。
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, info_span, warn};

use super::controller::{QueueReport, RunSummary};
use super::detector::{run_batched, run_streaming, DetectorContext};
use super::ipc::{spawn_pipe_reader, PipeOutlet};
use super::queue::{bounded, Outlet};
use super::renderer::run_renderer;
use super::source::run_source;
use super::state::{PipelineState, StopCause};
use crate::config::{DetectMode, PipelineConfig};
use crate::detection::{DetectionRecord, Frame, StreamInfo};
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::renderer::Annotator;
use crate::telemetry::{Report, Throughput};
use crate::{input, models, output};

const JOB_FILE: &str = "job.json";
const STOP_FILE: &str = "stop";
const GATE_OPEN: &str = "go";
const HANDSHAKE_POLL: Duration = Duration::from_millis(50);

/// 交给子进程的任务描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub config: PipelineConfig,
    pub info: StreamInfo,
    pub output: PathBuf,
    pub run_dir: PathBuf,
}

impl Job {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("读取任务 {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("解析任务 {}", path.display()))
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("写入任务 {}", path.display()))
    }

    fn file(&self, stage: Stage, suffix: &str) -> PathBuf {
        self.run_dir.join(format!("{stage}.{suffix}"))
    }

    fn state(&self) -> PipelineState {
        PipelineState::marker(self.run_dir.join(STOP_FILE))
    }

    fn stages(&self) -> &'static [Stage] {
        match self.config.mode {
            DetectMode::Batch => &[Stage::Source, Stage::Detector, Stage::Renderer],
            DetectMode::Stream => &[Stage::Detector, Stage::Renderer],
        }
    }
}

/// 渲染进程写出的统计
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkerSummary {
    report: Report,
    queue: QueueReport,
}

struct Worker {
    stage: Stage,
    child: Child,
}

/// 多进程流水线
pub struct ProcessPipeline {
    job: Job,
    job_path: PathBuf,
    exe: PathBuf,
    state: PipelineState,
    _run_dir: tempfile::TempDir,
}

impl ProcessPipeline {
    /// 创建运行目录并写入任务; `exe` 为可执行文件 (通常是 `current_exe()`)
    pub fn new(config: PipelineConfig, info: StreamInfo, exe: PathBuf) -> Result<Self> {
        let run_dir = tempfile::Builder::new()
            .prefix("yolo-stream-")
            .tempdir()
            .context("创建运行目录")?;
        let job = Job {
            output: config.output_path(),
            config,
            info,
            run_dir: run_dir.path().to_path_buf(),
        };
        let job_path = job.run_dir.join(JOB_FILE);
        job.save(&job_path)?;
        Ok(Self {
            state: job.state(),
            job,
            job_path,
            exe,
            _run_dir: run_dir,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state.clone()
    }

    pub fn output(&self) -> &Path {
        &self.job.output
    }

    /// 启动全部子进程并等待结束
    pub fn run(&self) -> PipelineResult<RunSummary> {
        info!(
            "🚀 启动多进程流水线: 模式 {:?} | 运行目录 {}",
            self.job.config.mode,
            self.job.run_dir.display()
        );
        let (mut workers, gate) = match self.spawn_all() {
            Ok(spawned) => spawned,
            Err((err, mut workers)) => {
                self.state.stop(StopCause::StageFailed);
                kill_all(&mut workers);
                return Err(err);
            }
        };

        if let Err(err) = self.handshake(&mut workers) {
            error!("❌ {err}");
            drop(gate);
            self.state.stop(StopCause::StageFailed);
            kill_all(&mut workers);
            return Err(err);
        }

        if self.state.is_aborted() {
            // 启动期间被取消: 关闭闸门, 让各阶段以零帧正常结束
            drop(gate);
        } else {
            open_gate(gate);
            info!("✅ 全部子进程就绪, 开始处理");
        }

        let mut errors = Vec::new();
        for worker in &mut workers {
            match worker.child.wait() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    self.state.stop(StopCause::StageFailed);
                    errors.push(self.worker_error(worker.stage, status));
                }
                Err(e) => {
                    self.state.stop(StopCause::StageFailed);
                    errors.push(PipelineError::stage(worker.stage, "wait worker", e.into()));
                }
            }
        }
        if !errors.is_empty() {
            let first = errors.remove(0);
            for other in &errors {
                warn!("其他阶段错误: {other}");
            }
            return Err(first);
        }

        let summary = self.read_summary()?;
        summary.log();
        Ok(summary)
    }

    fn command(&self, stage: Stage) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg("worker")
            .arg("--stage")
            .arg(stage.as_str())
            .arg("--job")
            .arg(&self.job_path)
            .stderr(Stdio::inherit());
        cmd
    }

    #[allow(clippy::result_large_err)]
    fn spawn_all(&self) -> Result<(Vec<Worker>, ChildStdin), (PipelineError, Vec<Worker>)> {
        let mut workers: Vec<Worker> = Vec::new();
        let mut upstream: Option<Stdio> = None;
        let mut gate = None;
        let stages = self.job.stages();

        for (i, &stage) in stages.iter().enumerate() {
            let mut cmd = self.command(stage);
            match upstream.take() {
                Some(stdin) => cmd.stdin(stdin),
                None => cmd.stdin(Stdio::piped()),
            };
            if i + 1 < stages.len() {
                cmd.stdout(Stdio::piped());
            } else {
                cmd.stdout(Stdio::null());
            }
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    let err = PipelineError::setup(
                        stage,
                        "spawn worker",
                        anyhow!(e).context(format!("启动 {}", self.exe.display())),
                    );
                    return Err((err, workers));
                }
            };
            info!("🧩 子进程 {stage} 已启动 (pid {})", child.id());
            if gate.is_none() {
                gate = child.stdin.take();
            }
            upstream = child.stdout.take().map(Stdio::from);
            workers.push(Worker { stage, child });
        }

        match gate {
            Some(gate) => Ok((workers, gate)),
            None => {
                let err = PipelineError::setup(
                    Stage::Controller,
                    "spawn worker",
                    anyhow!("无法获取启动闸门"),
                );
                Err((err, workers))
            }
        }
    }

    /// 等待每个子进程写出 `.ready`; 任何 `.err`、提前退出或超时都视为启动失败
    fn handshake(&self, workers: &mut [Worker]) -> PipelineResult<()> {
        let timeout = Duration::from_secs(self.job.config.startup_timeout_secs.max(1));
        let started = Instant::now();
        loop {
            let mut ready = 0;
            for worker in workers.iter_mut() {
                let stage = worker.stage;
                if let Some(message) = self.error_message(stage) {
                    return Err(PipelineError::setup(stage, "start worker", anyhow!(message)));
                }
                if self.job.file(stage, "ready").exists() {
                    ready += 1;
                    continue;
                }
                match worker.child.try_wait() {
                    Ok(Some(status)) => {
                        let message = self
                            .error_message(stage)
                            .unwrap_or_else(|| format!("就绪前退出 ({status})"));
                        return Err(PipelineError::setup(stage, "start worker", anyhow!(message)));
                    }
                    Ok(None) => {}
                    Err(e) => return Err(PipelineError::setup(stage, "start worker", e.into())),
                }
            }
            if ready == workers.len() {
                return Ok(());
            }
            if self.state.is_aborted() {
                return Ok(());
            }
            if started.elapsed() > timeout {
                return Err(PipelineError::setup(
                    Stage::Controller,
                    "start worker",
                    anyhow!("等待子进程就绪超时 ({}s)", timeout.as_secs()),
                ));
            }
            thread::sleep(HANDSHAKE_POLL);
        }
    }

    fn error_message(&self, stage: Stage) -> Option<String> {
        fs::read_to_string(self.job.file(stage, "err")).ok()
    }

    fn worker_error(&self, stage: Stage, status: ExitStatus) -> PipelineError {
        let message = self
            .error_message(stage)
            .unwrap_or_else(|| "没有错误信息".to_string());
        let err = PipelineError::Worker {
            stage,
            status: status.to_string(),
            message,
        };
        error!("❌ {err}");
        err
    }

    fn read_summary(&self) -> PipelineResult<RunSummary> {
        let path = self.job.file(Stage::Renderer, "summary.json");
        let summary: WorkerSummary = fs::read(&path)
            .context("读取渲染统计")
            .and_then(|bytes| serde_json::from_slice(&bytes).context("解析渲染统计"))
            .map_err(|e| PipelineError::stage(Stage::Controller, "collect summary", e))?;
        Ok(RunSummary::new(
            summary.report,
            self.state.cause() == Some(StopCause::Cancelled),
            vec![summary.queue],
        ))
    }
}

fn open_gate(mut gate: ChildStdin) {
    if let Err(e) = writeln!(gate, "{GATE_OPEN}").and_then(|_| gate.flush()) {
        warn!("⚠️  打开启动闸门失败: {e}");
    }
}

fn kill_all(workers: &mut [Worker]) {
    for worker in workers.iter_mut() {
        let _ = worker.child.kill();
    }
    for worker in workers.iter_mut() {
        let _ = worker.child.wait();
    }
}

// ========== 子进程一侧 ==========

/// 子进程入口
///
/// 失败时把原因写入 `<stage>.err` 并置停止标志, 由控制器读取。
pub fn run_worker(stage: Stage, job: &Job) -> Result<()> {
    let _span = info_span!("worker", stage = %stage, pid = std::process::id()).entered();
    let state = job.state();
    super::cancel_on_interrupt(&state);

    let result = match stage {
        Stage::Source => source_worker(job, &state),
        Stage::Detector => detector_worker(job, &state),
        Stage::Renderer => renderer_worker(job, &state),
        Stage::Controller => Err(anyhow!("controller 不是子进程阶段")),
    };
    if let Err(e) = &result {
        state.stop(StopCause::StageFailed);
        if let Err(write_err) = fs::write(job.file(stage, "err"), format!("{e:#}")) {
            error!("写入错误文件失败: {write_err}");
        }
    }
    result
}

fn mark_ready(job: &Job, stage: Stage) -> Result<()> {
    fs::write(job.file(stage, "ready"), b"").context("写入就绪标记")
}

/// 等待闸门; 闸门被关闭 (控制器放弃启动) 时返回 false
fn wait_gate() -> Result<bool> {
    let mut line = String::new();
    let n = io::stdin().lock().read_line(&mut line).context("读取启动闸门")?;
    Ok(n > 0 && line.trim() == GATE_OPEN)
}

/// 消费端结束后回收读线程
///
/// 调用前必须先丢弃本地队列的接收端, 读线程入队时才会看到断开。
/// 中止时读线程可能阻塞在管道读取上, 不等待。
fn finish_reader(handle: thread::JoinHandle<Result<u64>>, state: &PipelineState) {
    if state.is_aborted() {
        return;
    }
    match handle.join() {
        Ok(Ok(n)) => info!("管道读线程结束: {n} 条"),
        Ok(Err(e)) => warn!("⚠️  管道读线程: {e:#}"),
        Err(_) => warn!("⚠️  管道读线程 panic"),
    }
}

fn source_worker(job: &Job, state: &PipelineState) -> Result<()> {
    let c = &job.config;
    let mut source = input::open(&c.input, &c.decoder)
        .map_err(|e| PipelineError::setup(Stage::Source, "open input", e))?;
    mark_ready(job, Stage::Source)?;

    let mut out = PipeOutlet::<_, Frame>::new(io::stdout(), state);
    if !wait_gate()? {
        info!("启动闸门已关闭, 不读取");
        source.close();
        out.close();
        return Ok(());
    }
    run_source(source.as_mut(), &mut out, state)?;
    Ok(())
}

fn detector_worker(job: &Job, state: &PipelineState) -> Result<()> {
    let c = &job.config;
    let mut model = models::load(&c.model_spec())
        .map_err(|e| PipelineError::setup(Stage::Detector, "load model", e))?;
    let names = c.class_names.clone().or_else(|| model.class_names());
    let ctx = DetectorContext {
        params: &c.params,
        names: names.as_deref(),
        state,
    };
    let mut out = PipeOutlet::<_, DetectionRecord>::new(io::stdout(), state);

    match c.mode {
        DetectMode::Batch => {
            mark_ready(job, Stage::Detector)?;
            let (tx, mut rx) = bounded::<Frame>("frames", c.queue_capacity, state, c.poll_interval());
            let reader = spawn_pipe_reader("frames", io::stdin(), tx, state)?;
            let result = run_batched(model.as_mut(), &ctx, c.batch, &mut rx, &mut out);
            drop(rx);
            finish_reader(reader, state);
            result?;
        }
        DetectMode::Stream => {
            let mut source = input::open(&c.input, &c.decoder)
                .map_err(|e| PipelineError::setup(Stage::Detector, "open input", e))?;
            mark_ready(job, Stage::Detector)?;
            if !wait_gate()? {
                info!("启动闸门已关闭, 不读取");
                source.close();
                model.release();
                out.close();
                return Ok(());
            }
            run_streaming(model.as_mut(), &ctx, source.as_mut(), &mut out)?;
        }
    }
    Ok(())
}

fn renderer_worker(job: &Job, state: &PipelineState) -> Result<()> {
    let c = &job.config;
    let sink = output::open(&job.output, &job.info, c.sink, &c.encoder)
        .map_err(|e| PipelineError::setup(Stage::Renderer, "open output", e))?;
    let annotator = Annotator::new(c.font.as_ref(), c.line_width);
    mark_ready(job, Stage::Renderer)?;

    let (tx, mut rx) =
        bounded::<DetectionRecord>("records", c.queue_capacity, state, c.poll_interval());
    let stats = tx.stats();
    let reader = spawn_pipe_reader("records", io::stdin(), tx, state)?;
    let mut throughput = Throughput::new(c.report_every, c.stats_device());
    let result = run_renderer(&mut rx, &annotator, sink, &mut throughput, state);
    drop(rx);
    finish_reader(reader, state);
    let report = result?;

    let summary = WorkerSummary {
        report,
        queue: QueueReport::from(stats.as_ref()),
    };
    let path = job.file(Stage::Renderer, "summary.json");
    fs::write(&path, serde_json::to_vec_pretty(&summary)?)
        .with_context(|| format!("写入 {}", path.display()))?;
    Ok(())
}

/// 检查任务文件里的阶段组合是否可用
pub fn validate_stage(job: &Job, stage: Stage) -> Result<()> {
    if !job.stages().contains(&stage) {
        bail!("{:?} 模式下没有 {stage} 子进程", job.config.mode);
    }
    Ok(())
}
