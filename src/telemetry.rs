/// 吞吐统计与设备显存
///
/// 渲染阶段每处理 K 帧输出一次: 已处理帧数、耗时、平均 FPS、显存占用。
use std::io;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::info;

/// 带名字的线程, 继承当前 tracing dispatcher
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// 通过 nvidia-smi 读取显存占用 (MiB); 没有 NVIDIA 驱动时返回 None
pub fn device_memory_mib(device: usize) -> Option<u64> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.used",
            "--format=csv,noheader,nounits",
        ])
        .arg(format!("--id={device}"))
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_memory(&String::from_utf8_lossy(&output.stdout))
}

fn parse_memory(text: &str) -> Option<u64> {
    text.lines().next()?.trim().parse().ok()
}

/// 一次统计快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub frames: u64,
    pub elapsed: Duration,
    pub fps: f64,
    pub memory_mib: Option<u64>,
}

impl Report {
    pub fn log(&self, prefix: &str) {
        let memory = self
            .memory_mib
            .map_or_else(|| "N/A".to_string(), |m| format!("{m} MiB"));
        info!(
            "📊 {prefix}: {} 帧 | 耗时 {:.1}s | 平均 {:.1} FPS | 显存 {memory}",
            self.frames,
            self.elapsed.as_secs_f64(),
            self.fps
        );
    }
}

/// 吞吐计数器
pub struct Throughput {
    started: Instant,
    frames: u64,
    every: u64,
    device: Option<usize>,
}

impl Throughput {
    /// `every` 为 0 时不做周期输出; `device` 为 None 时不查询显存
    pub fn new(every: u64, device: Option<usize>) -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            every,
            device,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// 记一帧; 每 `every` 帧返回一次快照并写日志
    pub fn tick(&mut self) -> Option<Report> {
        self.frames += 1;
        if self.every == 0 || self.frames % self.every != 0 {
            return None;
        }
        let report = self.snapshot();
        report.log("进度");
        Some(report)
    }

    pub fn snapshot(&self) -> Report {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        Report {
            frames: self.frames,
            elapsed,
            fps: if secs > 0.0 {
                self.frames as f64 / secs
            } else {
                0.0
            },
            memory_mib: self.device.and_then(device_memory_mib),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_every_k() {
        let mut t = Throughput::new(3, None);
        let reports: Vec<_> = (0..10).filter_map(|_| t.tick()).collect();
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[2].frames, 9);
        assert_eq!(reports[0].memory_mib, None);
        assert_eq!(t.frames(), 10);
    }

    #[test]
    fn test_tick_disabled() {
        let mut t = Throughput::new(0, None);
        assert!((0..100).all(|_| t.tick().is_none()));
        assert_eq!(t.snapshot().frames, 100);
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("10240\n"), Some(10240));
        assert_eq!(parse_memory(" 512 \n1024\n"), Some(512));
        assert_eq!(parse_memory("[N/A]"), None);
        assert_eq!(parse_memory(""), None);
    }

    #[test]
    fn test_spawn_named_thread() {
        let h = spawn_thread("worker-x", || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(h.join().unwrap().as_deref(), Some("worker-x"));
    }
}
