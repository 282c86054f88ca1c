//! 请求上下文
//!
//! 携带取消信号和可选的截止时间。取消基于 `tokio::sync::watch`，
//! 与后台任务的停机信号同一套机制。

use crate::error::{Result, RuleError};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// 请求上下文
#[derive(Debug, Clone)]
pub struct RequestContext {
    cancel_rx: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// 取消句柄，调用 [`CancelHandle::cancel`] 或 Drop 都会触发取消
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

impl RequestContext {
    /// 不会被取消、没有截止时间的上下文
    pub fn background() -> Self {
        Self {
            cancel_rx: None,
            deadline: None,
        }
    }

    /// 可手动取消的上下文
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                cancel_rx: Some(rx),
                deadline: None,
            },
            CancelHandle { tx },
        )
    }

    /// 以外部停机信号作为取消源
    pub fn from_shutdown(shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            cancel_rx: Some(shutdown_rx),
            deadline: None,
        }
    }

    /// 在当前上下文基础上增加超时，取更早的截止时间
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 当前是否已取消或超时
    pub fn is_cancelled(&self) -> bool {
        let signalled = self.cancel_rx.as_ref().is_some_and(|rx| *rx.borrow());
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        signalled || expired
    }

    /// 已取消时返回 `Cancelled`
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RuleError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 等待取消或超时；背景上下文永不完成
    pub async fn cancelled(&self) {
        let signal = async {
            match self.cancel_rx.clone() {
                Some(mut rx) => {
                    // 发送端关闭（句柄已 Drop）也视为取消
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        let timer = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = signal => {}
            _ = timer => {}
        }
    }

    /// 在上下文约束下等待一个 future，取消时返回 `Cancelled`
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(RuleError::Cancelled),
            res = fut => res,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}
