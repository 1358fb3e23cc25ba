use super::{
    errors::PoolError,
    iterable::TaskStream,
    result::PoolResult,
    value::Value,
};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How a task settled: a plain value, or a stream for generator methods.
#[derive(Debug)]
pub enum Reply {
    Value(Value),
    Stream(TaskStream<Value>),
}

impl Reply {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Reply::Value(value) => Some(value),
            Reply::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<TaskStream<Value>> {
        match self {
            Reply::Stream(stream) => Some(stream),
            Reply::Value(_) => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Reply::Stream(_))
    }
}

/// Handle to a dispatched task. Resolves exactly once.
pub struct TaskHandle {
    signal: Option<CancellationToken>,
    receiver: oneshot::Receiver<PoolResult<Reply>>,
}

impl TaskHandle {
    pub(crate) fn new(
        receiver: oneshot::Receiver<PoolResult<Reply>>,
        signal: Option<CancellationToken>,
    ) -> Self {
        Self { signal, receiver }
    }

    pub(crate) fn settled(result: PoolResult<Reply>, signal: Option<CancellationToken>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx, signal)
    }

    /// Fires the signal the task was invoked with. Returns false when it had none.
    #[inline]
    pub fn cancel(&self) -> bool {
        match &self.signal {
            Some(signal) => {
                signal.cancel();
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.signal.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

impl Future for TaskHandle {
    type Output = PoolResult<Reply>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(res) => Poll::Ready(
                res.unwrap_or_else(|_| Err(PoolError::Destroyed("Thread pool was dropped".into()))),
            ),
            Poll::Pending => Poll::Pending,
        }
    }
}
