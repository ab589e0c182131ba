/// 有界队列 (Bounded queue)
///
/// 基于 crossbeam-channel 的 `bounded(C)`, 消息为 `Item(T) | End`。
/// 生产者满时带超时阻塞, 消费者空时带超时阻塞, 每次超时都重新检查停止标志,
/// 因此取消或失败后任何一端都不会无限期卡住。
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use thiserror::Error;

use super::state::PipelineState;

/// 队列消息: 数据或结束标记
#[derive(Debug, Clone, PartialEq)]
pub enum Message<T> {
    Item(T),
    End,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    /// 流水线已因失败/取消而停止, 放弃入队
    #[error("流水线已停止")]
    Stopped,
    /// 消费端已退出
    #[error("下游已断开")]
    Disconnected,
}

/// 生产端接口: 进程内队列与进程间管道共用
pub trait Outlet<T>: Send {
    /// 入队, 队列满时阻塞 (背压)
    fn push(&mut self, item: T) -> Result<(), PushError>;

    /// 发送结束标记, 重复调用只生效一次
    fn close(&mut self);
}

/// 队列统计 (容量与最高水位)
#[derive(Debug)]
pub struct QueueStats {
    name: &'static str,
    capacity: usize,
    high_water: AtomicUsize,
    pushed: AtomicU64,
}

impl QueueStats {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 观测到的最大队列长度 (含结束标记)
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    /// 已入队的数据条数 (不含结束标记)
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

pub struct QueueSender<T> {
    tx: Sender<Message<T>>,
    state: PipelineState,
    poll: Duration,
    stats: Arc<QueueStats>,
    closed: bool,
}

pub struct QueueReceiver<T> {
    rx: Receiver<Message<T>>,
    state: PipelineState,
    poll: Duration,
    stats: Arc<QueueStats>,
    ended: bool,
}

/// 创建容量为 `capacity` 的队列, 两端共享停止标志
pub fn bounded<T>(
    name: &'static str,
    capacity: usize,
    state: &PipelineState,
    poll: Duration,
) -> (QueueSender<T>, QueueReceiver<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let stats = Arc::new(QueueStats {
        name,
        capacity,
        high_water: AtomicUsize::new(0),
        pushed: AtomicU64::new(0),
    });
    (
        QueueSender {
            tx,
            state: state.clone(),
            poll,
            stats: stats.clone(),
            closed: false,
        },
        QueueReceiver {
            rx,
            state: state.clone(),
            poll,
            stats,
            ended: false,
        },
    )
}

impl<T> QueueSender<T> {
    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    fn send(&self, mut msg: Message<T>) -> Result<(), PushError> {
        loop {
            match self.tx.send_timeout(msg, self.poll) {
                Ok(()) => {
                    self.stats
                        .high_water
                        .fetch_max(self.tx.len(), Ordering::Relaxed);
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.state.is_aborted() {
                        return Err(PushError::Stopped);
                    }
                    msg = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(PushError::Disconnected),
            }
        }
    }
}

impl<T: Send> Outlet<T> for QueueSender<T> {
    fn push(&mut self, item: T) -> Result<(), PushError> {
        if self.closed {
            return Err(PushError::Disconnected);
        }
        self.send(Message::Item(item))?;
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // 消费端已退出或流水线已中止时, 断开连接即可让对方结束
        let _ = self.send(Message::End);
    }
}

impl<T> QueueReceiver<T> {
    pub fn stats(&self) -> Arc<QueueStats> {
        self.stats.clone()
    }

    /// 取下一条数据; 返回 None 表示此输入已结束
    ///
    /// 结束条件: 收到结束标记、生产端全部断开、或流水线因失败/取消停止且队列已空。
    /// 源读完 (SourceExhausted) 不会让消费者提前退出, 结束标记总会随后到达。
    pub fn pop(&mut self) -> Option<T> {
        if self.ended {
            return None;
        }
        loop {
            match self.rx.recv_timeout(self.poll) {
                Ok(Message::Item(item)) => return Some(item),
                Ok(Message::End) | Err(RecvTimeoutError::Disconnected) => {
                    self.ended = true;
                    return None;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.state.is_aborted() && self.rx.is_empty() {
                        self.ended = true;
                        return None;
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::StopCause;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(10);

    #[test]
    fn test_fifo_and_end() {
        let state = PipelineState::local();
        let (mut tx, mut rx) = bounded::<u32>("test", 4, &state, POLL);
        for i in 0..3 {
            tx.push(i).unwrap();
        }
        tx.close();
        tx.close();
        assert_eq!(rx.pop(), Some(0));
        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), None);
        assert_eq!(rx.pop(), None);
        assert!(rx.is_empty(), "second close must not enqueue another End");
    }

    #[test]
    fn test_push_blocks_until_consumer_drains() {
        let state = PipelineState::local();
        let (mut tx, mut rx) = bounded::<u32>("test", 2, &state, POLL);
        let stats = tx.stats();
        let producer = std::thread::spawn(move || {
            for i in 0..20 {
                tx.push(i).unwrap();
            }
            tx.close();
        });
        let mut got = Vec::new();
        while let Some(v) = rx.pop() {
            std::thread::sleep(Duration::from_millis(1));
            got.push(v);
        }
        producer.join().unwrap();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
        assert!(stats.high_water() <= 2);
        assert_eq!(stats.pushed(), 20);
    }

    #[test]
    fn test_full_queue_gives_up_after_abort() {
        let state = PipelineState::local();
        let (mut tx, _rx) = bounded::<u32>("test", 1, &state, POLL);
        tx.push(1).unwrap();
        let s = state.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            s.stop(StopCause::Cancelled);
        });
        let start = Instant::now();
        assert_eq!(tx.push(2), Err(PushError::Stopped));
        assert!(start.elapsed() < Duration::from_secs(2));
        stopper.join().unwrap();
    }

    #[test]
    fn test_source_exhausted_does_not_abort_producer() {
        let state = PipelineState::local();
        state.stop(StopCause::SourceExhausted);
        let (mut tx, mut rx) = bounded::<u32>("test", 1, &state, POLL);
        tx.push(1).unwrap();
        let consumer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            let a = rx.pop();
            let b = rx.pop();
            (a, b)
        });
        // 队列已满, 但停止原因是正常结束: 等待消费者腾出空间
        tx.push(2).unwrap();
        assert_eq!(consumer.join().unwrap(), (Some(1), Some(2)));
    }

    #[test]
    fn test_pop_returns_none_when_aborted_and_empty() {
        let state = PipelineState::local();
        let (tx, mut rx) = bounded::<u32>("test", 1, &state, POLL);
        state.stop(StopCause::StageFailed);
        assert_eq!(rx.pop(), None);
        drop(tx);
    }

    #[test]
    fn test_pop_drains_items_before_abort_exit() {
        let state = PipelineState::local();
        let (mut tx, mut rx) = bounded::<u32>("test", 3, &state, POLL);
        tx.push(7).unwrap();
        tx.push(8).unwrap();
        state.stop(StopCause::Cancelled);
        assert_eq!(rx.pop(), Some(7));
        assert_eq!(rx.pop(), Some(8));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn test_disconnected_endpoints() {
        let state = PipelineState::local();
        let (mut tx, rx) = bounded::<u32>("test", 1, &state, POLL);
        drop(rx);
        assert_eq!(tx.push(1), Err(PushError::Disconnected));

        let (tx, mut rx) = bounded::<u32>("test", 1, &state, POLL);
        drop(tx);
        assert_eq!(rx.pop(), None);
    }
}
