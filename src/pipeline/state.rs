/// 流水线停止标志
///
/// 只会从"运行"变为"停止"一次, 之后不可逆。停止原因最多再变一次:
/// 源读完 (`SourceExhausted`) 之后仍可被失败或取消覆盖, 失败/取消则是最终原因。
///
/// 两种实现:
/// - 线程拓扑: 原子变量
/// - 进程拓扑: 标记文件 (`stop` 与 `stop.abort`, 各自只能被独占创建一次)
use std::fmt;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCause {
    /// 视频源读完 (正常结束, 下游继续排空队列)
    SourceExhausted,
    /// 某个阶段失败
    StageFailed,
    /// 用户取消 (Ctrl-C)
    Cancelled,
}

impl StopCause {
    fn code(self) -> u8 {
        match self {
            StopCause::SourceExhausted => 1,
            StopCause::StageFailed => 2,
            StopCause::Cancelled => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(StopCause::SourceExhausted),
            2 => Some(StopCause::StageFailed),
            3 => Some(StopCause::Cancelled),
            _ => None,
        }
    }

    /// 失败或取消: 消费者不必再等待结束标记
    pub fn is_abort(self) -> bool {
        matches!(self, StopCause::StageFailed | StopCause::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StopCause::SourceExhausted => "source-exhausted",
            StopCause::StageFailed => "stage-failed",
            StopCause::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StopCause {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "source-exhausted" => Ok(StopCause::SourceExhausted),
            "stage-failed" => Ok(StopCause::StageFailed),
            "cancelled" => Ok(StopCause::Cancelled),
            other => anyhow::bail!("未知停止原因: {other}"),
        }
    }
}

enum Backing {
    Local(AtomicU8),
    Marker { stop: PathBuf, abort: PathBuf },
}

/// 独占创建标记文件, 内容 (停止原因) 与文件同时可见
fn create_marker(path: &Path, cause: StopCause) -> bool {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let created = tempfile::NamedTempFile::new_in(dir).and_then(|mut tmp| {
        tmp.write_all(cause.as_str().as_bytes())?;
        tmp.persist_noclobber(path).map(|_| ()).map_err(|e| e.error)
    });
    match created {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => false,
        Err(e) => {
            warn!("⚠️  创建停止标记失败 {}: {e}", path.display());
            false
        }
    }
}

fn read_marker(path: &Path) -> Option<StopCause> {
    std::fs::read_to_string(path).ok()?.parse().ok()
}

/// 共享停止标志, clone 后指向同一状态
#[derive(Clone)]
pub struct PipelineState {
    inner: Arc<Backing>,
}

impl fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineState")
            .field("cause", &self.cause())
            .finish()
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::local()
    }
}

impl PipelineState {
    /// 进程内 (线程共享) 的停止标志
    pub fn local() -> Self {
        Self {
            inner: Arc::new(Backing::Local(AtomicU8::new(0))),
        }
    }

    /// 跨进程的停止标志, 以 `path` (或 `path.abort`) 是否存在表示是否已停止
    pub fn marker(path: impl Into<PathBuf>) -> Self {
        let stop = path.into();
        let mut abort = stop.clone().into_os_string();
        abort.push(".abort");
        Self {
            inner: Arc::new(Backing::Marker {
                stop,
                abort: abort.into(),
            }),
        }
    }

    /// 请求停止; 返回本次调用是否改变了停止原因
    ///
    /// 未停止时任何原因都生效; 已因源读完停止时只有失败或取消生效。
    pub fn stop(&self, cause: StopCause) -> bool {
        let changed = match self.inner.as_ref() {
            Backing::Local(flag) => {
                let mut current = flag.load(Ordering::Acquire);
                loop {
                    let replace = current == 0
                        || (cause.is_abort() && current == StopCause::SourceExhausted.code());
                    if !replace {
                        break false;
                    }
                    match flag.compare_exchange(current, cause.code(), Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => break true,
                        Err(actual) => current = actual,
                    }
                }
            }
            Backing::Marker { stop, abort } => {
                if cause.is_abort() {
                    let won = create_marker(abort, cause);
                    if won {
                        create_marker(stop, cause);
                    }
                    won
                } else {
                    !abort.exists() && create_marker(stop, cause)
                }
            }
        };
        if changed {
            info!("⏹  流水线停止: {cause}");
        }
        changed
    }

    pub fn is_stopped(&self) -> bool {
        match self.inner.as_ref() {
            Backing::Local(flag) => flag.load(Ordering::Acquire) != 0,
            Backing::Marker { stop, abort } => stop.exists() || abort.exists(),
        }
    }

    /// 当前停止原因, 未停止时为 None
    pub fn cause(&self) -> Option<StopCause> {
        match self.inner.as_ref() {
            Backing::Local(flag) => StopCause::from_code(flag.load(Ordering::Acquire)),
            Backing::Marker { stop, abort } => read_marker(abort).or_else(|| read_marker(stop)),
        }
    }

    /// 因失败或取消而停止; 此时消费者在输入队列为空时即可退出
    pub fn is_aborted(&self) -> bool {
        self.cause().is_some_and(StopCause::is_abort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_transitions_once() {
        let state = PipelineState::local();
        assert!(!state.is_stopped());
        assert_eq!(state.cause(), None);

        assert!(state.stop(StopCause::StageFailed));
        assert!(!state.stop(StopCause::SourceExhausted));
        assert!(!state.stop(StopCause::Cancelled));

        assert!(state.is_stopped());
        assert_eq!(state.cause(), Some(StopCause::StageFailed));
        assert!(state.is_aborted());
    }

    #[test]
    fn test_failure_after_source_exhausted() {
        let state = PipelineState::local();
        assert!(state.stop(StopCause::SourceExhausted));
        assert!(!state.is_aborted());
        assert!(!state.stop(StopCause::SourceExhausted));

        assert!(state.stop(StopCause::StageFailed));
        assert!(state.is_aborted());
        assert!(!state.stop(StopCause::Cancelled));
        assert!(!state.stop(StopCause::SourceExhausted));
        assert_eq!(state.cause(), Some(StopCause::StageFailed));
    }

    #[test]
    fn test_cancel_after_source_exhausted() {
        let state = PipelineState::local();
        state.stop(StopCause::SourceExhausted);
        assert!(state.stop(StopCause::Cancelled));
        assert_eq!(state.cause(), Some(StopCause::Cancelled));
    }

    #[test]
    fn test_marker_failure_after_source_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop");
        let a = PipelineState::marker(&path);
        let b = PipelineState::marker(&path);

        assert!(a.stop(StopCause::SourceExhausted));
        assert!(b.is_stopped());
        assert!(!b.is_aborted());
        assert!(b.stop(StopCause::StageFailed));
        assert!(a.is_aborted());
        assert!(!a.stop(StopCause::Cancelled));
        assert!(!a.stop(StopCause::SourceExhausted));
        assert_eq!(a.cause(), Some(StopCause::StageFailed));
    }

    #[test]
    fn test_marker_abort_first() {
        let dir = tempfile::tempdir().unwrap();
        let state = PipelineState::marker(dir.path().join("stop"));
        assert!(state.stop(StopCause::Cancelled));
        assert!(!state.stop(StopCause::SourceExhausted));
        assert_eq!(state.cause(), Some(StopCause::Cancelled));
    }

    #[test]
    fn test_clones_share_state() {
        let state = PipelineState::local();
        let other = state.clone();
        other.stop(StopCause::SourceExhausted);
        assert!(state.is_stopped());
        assert!(!state.is_aborted());
    }

    #[test]
    fn test_concurrent_stop_single_winner() {
        let state = PipelineState::local();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = state.clone();
                std::thread::spawn(move || {
                    let cause = if i % 2 == 0 {
                        StopCause::Cancelled
                    } else {
                        StopCause::StageFailed
                    };
                    s.stop(cause)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_marker_state_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stop");
        let a = PipelineState::marker(&path);
        let b = PipelineState::marker(&path);

        assert!(!a.is_stopped());
        assert!(b.stop(StopCause::Cancelled));
        assert!(!a.stop(StopCause::SourceExhausted));
        assert!(a.is_stopped());
        assert_eq!(a.cause(), Some(StopCause::Cancelled));
        assert!(a.is_aborted());
    }

    #[test]
    fn test_cause_parse() {
        for cause in [
            StopCause::SourceExhausted,
            StopCause::StageFailed,
            StopCause::Cancelled,
        ] {
            assert_eq!(cause.as_str().parse::<StopCause>().unwrap(), cause);
        }
        assert!("bogus".parse::<StopCause>().is_err());
    }
}
