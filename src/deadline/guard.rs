use std::future::{poll_fn, Future};
use std::pin::pin;
use std::task::Poll;

use crate::deadline::registry::DeadlineRegistry;
use crate::error::Cancelled;
use crate::utils::CancelToken;

impl DeadlineRegistry {
    /// Run `op` under this registry's idle deadline and under `parent`.
    ///
    /// Exactly one of {natural result, deadline exceeded, shutdown,
    /// parent cancelled} is delivered, no matter how many of those fire
    /// concurrently: the registration's state word is the one-shot
    /// exchange every path must win to produce an effect. A losing
    /// natural completion drops its result and reports the cancellation
    /// that beat it.
    ///
    /// On natural completion the registration is disposed, not cancelled,
    /// so no callback ever fires for a finished operation. When the
    /// registry is already stopped, `op` is dropped unpolled.
    pub async fn guard<F>(&self, parent: &CancelToken, op: F) -> Result<F::Output, Cancelled>
    where
        F: Future,
    {
        let registration = match self.register() {
            Ok(registration) => registration,
            Err(stopped) => return Err(stopped.into()),
        };

        let mut op = pin!(op);
        let mut parent_cancelled = pin!(parent.cancelled());

        poll_fn(|cx| {
            let node = registration.node();
            // Arm before reading the state: a cancel that lands after the
            // read finds the fresh waker and re-polls us.
            node.arm(cx.waker());
            if let Some(reason) = node.cancel_reason() {
                return Poll::Ready(Err(reason));
            }

            if parent_cancelled.as_mut().poll(cx).is_ready() {
                // Claim the slot without firing the cancel path; if a
                // sweep won the race, its verdict stands.
                let reason = if node.dispose() {
                    Cancelled::Parent
                } else {
                    node.cancel_reason().unwrap_or(Cancelled::Parent)
                };
                return Poll::Ready(Err(reason));
            }

            match op.as_mut().poll(cx) {
                Poll::Ready(out) => {
                    if node.dispose() {
                        Poll::Ready(Ok(out))
                    } else {
                        Poll::Ready(Err(node.cancel_reason().unwrap_or(Cancelled::Shutdown)))
                    }
                }
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }
}
