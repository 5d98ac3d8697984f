//! Cancellation and deadline propagation for backend calls.

use std::future::Future;
use std::io;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Operation, Result};
use crate::object_store::ByteStream;

/// Carries the cancellation signal and optional deadline of one logical request.
///
/// Every [`StorageBackend`](crate::object_store::StorageBackend) call receives one and
/// returns [`Error::Cancelled`] or [`Error::TimedOut`] as soon as either fires, dropping
/// the in-flight I/O future.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tightens the deadline; a later deadline than the current one is ignored.
    pub fn with_deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < at => current,
            _ => at,
        });
        self
    }

    /// A context cancelled together with this one, which can also be cancelled alone.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run `fut`, giving up early if the context is cancelled or its deadline passes.
    pub async fn run<T, F>(&self, op: Operation, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                op,
                key: key.to_string(),
            });
        }

        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled { op, key: key.to_string() }),
            _ = deadline => Err(Error::TimedOut { op, key: key.to_string() }),
            result = fut => result,
        }
    }

    /// Make a content stream honor this context: once it is cancelled or past its deadline
    /// the stream yields one error and ends.
    pub fn guard_stream(&self, op: Operation, key: &str, stream: ByteStream) -> ByteStream {
        let state = (stream, self.clone(), key.to_string(), false);
        Box::pin(futures::stream::unfold(
            state,
            move |(mut stream, cx, key, done)| async move {
                if done {
                    return None;
                }
                let next = cx
                    .run(op, &key, async { Ok::<_, Error>(stream.next().await) })
                    .await;
                match next {
                    Ok(Some(item)) => Some((item, (stream, cx, key, false))),
                    Ok(None) => None,
                    Err(e) => {
                        let err = io::Error::new(io::ErrorKind::Interrupted, e.to_string());
                        Some((Err(err), (stream, cx, key, true)))
                    }
                }
            },
        ))
    }
}
