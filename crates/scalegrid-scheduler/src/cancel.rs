//! Hierarchical cancellation tokens.
//!
//! A [`CancelToken`] is cancelled when any of these happens: `cancel` is
//! called on it, its parent is cancelled, or its deadline passes. Every
//! cancellation carries a cause string; the first cause recorded wins.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

struct Inner {
    tx: watch::Sender<Option<String>>,
    parent: Option<CancelToken>,
    deadline: Option<(Instant, String)>,
}

/// Cloneable handle; clones share the same cancellation state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cause", &self.cause())
            .finish()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A root token that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// A token cancelled together with `self`, but cancellable on its own.
    pub fn child(&self) -> Self {
        Self::build(Some(self.clone()), None)
    }

    /// A child that additionally expires after `timeout` with `cause`.
    pub fn child_with_timeout(&self, timeout: Duration, cause: impl Into<String>) -> Self {
        Self::build(
            Some(self.clone()),
            Some((Instant::now() + timeout, cause.into())),
        )
    }

    fn build(parent: Option<CancelToken>, deadline: Option<(Instant, String)>) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                tx,
                parent,
                deadline,
            }),
        }
    }

    /// Cancel this token and its children. Later causes are ignored.
    pub fn cancel(&self, cause: impl Into<String>) {
        let cause = cause.into();
        let recorded = self.inner.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause.clone());
            true
        });
        if recorded {
            debug!(%cause, "cancellation requested");
        }
    }

    /// The cause if this token is cancelled.
    ///
    /// An explicit cause on this token takes precedence over the parent's,
    /// which takes precedence over an expired deadline.
    pub fn cause(&self) -> Option<String> {
        if let Some(cause) = self.inner.tx.borrow().clone() {
            return Some(cause);
        }
        if let Some(cause) = self.inner.parent.as_ref().and_then(CancelToken::cause) {
            return Some(cause);
        }
        match &self.inner.deadline {
            Some((at, cause)) if Instant::now() >= *at => Some(cause.clone()),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }

    /// True if cancelled by the deadline alone.
    pub fn deadline_expired(&self) -> bool {
        self.inner.tx.borrow().is_none()
            && !self
                .inner
                .parent
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
            && self
                .inner
                .deadline
                .as_ref()
                .is_some_and(|(at, _)| Instant::now() >= *at)
    }

    /// Resolves with the cause once the token is cancelled.
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = String> + Send + '_>> {
        Box::pin(async move {
            if let Some(cause) = self.cause() {
                return cause;
            }
            let mut rx = self.inner.tx.subscribe();

            let own = async {
                let cause = rx
                    .wait_for(Option::is_some)
                    .await
                    .map(|c| c.clone().unwrap_or_default());
                match cause {
                    Ok(cause) => cause,
                    Err(_) => std::future::pending().await,
                }
            };
            let deadline = async {
                match &self.inner.deadline {
                    Some((at, cause)) => {
                        tokio::time::sleep_until(*at).await;
                        cause.clone()
                    }
                    None => std::future::pending().await,
                }
            };
            let parent = async {
                match &self.inner.parent {
                    Some(parent) => parent.cancelled().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cause = own => cause,
                cause = parent => cause,
                cause = deadline => cause,
            }
        })
    }
}
