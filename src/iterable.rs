//! Push-to-pull bridge for streamed results.
//!
//! The producer half ([`StreamController`]) is fed by the pool as
//! `GENERATOR_YIELD` / `RESPONSE` messages arrive; the consumer half
//! ([`TaskStream`]) is handed to the caller. Termination is monotonic: once
//! ended or errored, nothing further is delivered.

use crate::{errors::PoolError, queue::Queue};
use futures::Stream;
use parking_lot::Mutex;
use std::{
    fmt,
    future::{poll_fn, Future},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

type Pulled<T> = Result<Option<T>, PoolError>;

struct ChannelState<T> {
    values: Queue<T>,
    requests: Queue<oneshot::Sender<Pulled<T>>>,
    is_ended: bool,
    is_done: bool,
    error: Option<PoolError>,
    /// Cancelled once nothing more can be pulled.
    done: CancellationToken,
}

enum Next<T> {
    Ready(Pulled<T>),
    Wait(oneshot::Receiver<Pulled<T>>),
}

impl<T> ChannelState<T> {
    fn new() -> Self {
        Self {
            values: Queue::new(),
            requests: Queue::new(),
            is_ended: false,
            is_done: false,
            error: None,
            done: CancellationToken::new(),
        }
    }

    fn write(&mut self, mut value: T) {
        if self.is_ended {
            return;
        }
        while let Some(request) = self.requests.shift() {
            // a pull whose receiver is gone hands the value to the next one
            match request.send(Ok(Some(value))) {
                Ok(()) => return,
                Err(returned) => match returned {
                    Ok(Some(v)) => value = v,
                    _ => return,
                },
            }
        }
        self.values.push(value);
    }

    fn end(&mut self) {
        if self.is_ended {
            return;
        }
        self.is_ended = true;
        if self.values.is_empty() {
            self.finish();
        }
    }

    fn finish(&mut self) {
        self.is_done = true;
        while let Some(request) = self.requests.shift() {
            let _ = request.send(Ok(None));
        }
        self.done.cancel();
    }

    fn fail(&mut self, err: PoolError) {
        if self.is_done {
            return;
        }
        self.is_ended = true;
        self.is_done = true;
        while let Some(request) = self.requests.shift() {
            let _ = request.send(Err(err.clone()));
        }
        self.values.clear();
        self.requests.clear();
        self.error = Some(err);
        self.done.cancel();
    }

    fn next(&mut self) -> Next<T> {
        if self.is_done {
            return Next::Ready(match &self.error {
                Some(err) => Err(err.clone()),
                None => Ok(None),
            });
        }
        match self.values.shift() {
            Some(value) => {
                if self.is_ended && self.values.is_empty() {
                    self.finish();
                }
                Next::Ready(Ok(Some(value)))
            }
            None => {
                let (tx, rx) = oneshot::channel();
                self.requests.push(tx);
                Next::Wait(rx)
            }
        }
    }
}

pub fn channel<T>() -> (StreamController<T>, TaskStream<T>) {
    let state = Arc::new(Mutex::new(ChannelState::new()));
    (
        StreamController { state: state.clone() },
        TaskStream {
            state,
            pending: None,
            exhausted: false,
        },
    )
}

/// Producer half.
pub struct StreamController<T> {
    state: Arc<Mutex<ChannelState<T>>>,
}

impl<T> StreamController<T> {
    pub fn yield_value(&self, value: T) {
        self.state.lock().write(value);
    }

    pub fn resolve(&self) {
        self.state.lock().end();
    }

    pub fn reject(&self, err: PoolError) {
        self.state.lock().fail(err);
    }

    /// True once the producer side is finished, whether or not the
    /// consumer has drained it.
    pub fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.is_ended || state.is_done
    }

    /// True once the consumer has seen the end: the last value was pulled,
    /// or the channel errored.
    pub fn is_done(&self) -> bool {
        self.state.lock().is_done
    }

    /// Token cancelled when [`is_done`](Self::is_done) becomes true.
    pub fn finished(&self) -> CancellationToken {
        self.state.lock().done.clone()
    }
}

impl<T> Drop for StreamController<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !state.is_ended {
            state.fail(PoolError::Destroyed("Stream producer dropped before completion".into()));
        }
    }
}

/// Consumer half of a streamed task result.
///
/// `pull` follows the channel exactly: after an error every further pull
/// rejects again. The [`Stream`] impl instead ends after yielding the first
/// error.
pub struct TaskStream<T> {
    state: Arc<Mutex<ChannelState<T>>>,
    pending: Option<oneshot::Receiver<Pulled<T>>>,
    exhausted: bool,
}

impl<T> TaskStream<T> {
    pub fn poll_pull(&mut self, cx: &mut Context<'_>) -> Poll<Pulled<T>> {
        let mut rx = match self.pending.take() {
            Some(rx) => rx,
            None => match self.state.lock().next() {
                Next::Ready(result) => return Poll::Ready(result),
                Next::Wait(rx) => rx,
            },
        };
        match Pin::new(&mut rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // requests are only dropped unanswered once the channel is cleared
            Poll::Ready(Err(_)) => Poll::Ready(self.state.lock().next_settled()),
            Poll::Pending => {
                self.pending = Some(rx);
                Poll::Pending
            }
        }
    }

    /// Next value, `Ok(None)` once the producer has finished.
    pub async fn pull(&mut self) -> Pulled<T> {
        poll_fn(|cx| self.poll_pull(cx)).await
    }

    /// Stops consumption early. Later pulls reject with "Iteration cancelled".
    pub fn close(&mut self) {
        self.state.lock().fail(PoolError::Aborted("Iteration cancelled".into()));
    }

    /// Forces the channel into the errored state with `err`.
    pub fn throw(&mut self, err: PoolError) -> PoolError {
        self.state.lock().fail(err.clone());
        err
    }
}

impl<T> ChannelState<T> {
    fn next_settled(&self) -> Pulled<T> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(None),
        }
    }
}

/// An abandoned consumer ends the stream, so the producer side stops waiting
/// for pulls that will never come.
impl<T> Drop for TaskStream<T> {
    fn drop(&mut self) {
        self.state.lock().fail(PoolError::Aborted("Iteration cancelled".into()));
    }
}

impl<T> Stream for TaskStream<T> {
    type Item = Result<T, PoolError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.exhausted {
            return Poll::Ready(None);
        }
        match this.poll_pull(cx) {
            Poll::Ready(Ok(Some(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Ok(None)) => {
                this.exhausted = true;
                Poll::Ready(None)
            }
            Poll::Ready(Err(err)) => {
                this.exhausted = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for TaskStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskStream")
            .field("buffered", &state.values.len())
            .field("ended", &state.is_ended)
            .field("errored", &state.error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn buffered_values_then_done() {
        let (tx, mut rx) = channel();
        tx.yield_value(1);
        tx.yield_value(2);
        tx.resolve();
        tx.yield_value(3);

        assert_eq!(rx.pull().await, Ok(Some(1)));
        assert_eq!(rx.pull().await, Ok(Some(2)));
        assert_eq!(rx.pull().await, Ok(None));
        assert_eq!(rx.pull().await, Ok(None));
    }

    #[tokio::test]
    async fn waiting_pull_is_satisfied_by_yield() {
        let (tx, mut rx) = channel();
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.yield_value("late");
            tx.resolve();
        });

        assert_eq!(rx.pull().await, Ok(Some("late")));
        assert_eq!(rx.pull().await, Ok(None));
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn reject_discards_buffer() {
        let (tx, mut rx) = channel();
        tx.yield_value(1);
        tx.reject(PoolError::Task("boom".into()));
        tx.yield_value(2);

        assert_eq!(rx.pull().await, Err(PoolError::Task("boom".into())));
        assert_eq!(rx.pull().await, Err(PoolError::Task("boom".into())));
    }

    #[tokio::test]
    async fn reject_after_done_is_ignored() {
        let (tx, mut rx) = channel::<u8>();
        tx.resolve();
        tx.reject(PoolError::Task("late".into()));
        assert_eq!(rx.pull().await, Ok(None));
    }

    #[tokio::test]
    async fn close_forces_error() {
        let (tx, mut rx) = channel();
        tx.yield_value(1);
        rx.close();
        assert!(tx.is_closed());
        assert_eq!(rx.pull().await, Err(PoolError::Aborted("Iteration cancelled".into())));
    }

    #[tokio::test]
    async fn finished_after_last_pull() {
        let (tx, mut rx) = channel();
        let finished = tx.finished();
        tx.yield_value(1);
        tx.resolve();
        assert!(tx.is_closed());
        assert!(!tx.is_done(), "a value is still buffered");
        assert!(!finished.is_cancelled());

        assert_eq!(rx.pull().await, Ok(Some(1)));
        assert!(tx.is_done());
        assert!(finished.is_cancelled());
    }

    #[tokio::test]
    async fn dropping_consumer_finishes() {
        let (tx, rx) = channel();
        tx.yield_value("unread");
        tx.resolve();
        drop(rx);
        assert!(tx.is_done());
        assert!(tx.finished().is_cancelled());
    }

    #[tokio::test]
    async fn stream_fuses_after_error() {
        let (tx, rx) = channel();
        tx.yield_value(1);
        drop(tx);

        let items: Vec<_> = rx.collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(PoolError::Destroyed(_))));
    }
}
