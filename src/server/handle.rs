use std::fmt;
use std::net::SocketAddr;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ServerError;
use crate::utils::{CancelToken, HealthFlag};

/// Read-only view onto a running server's task tree.
///
/// Exposes the root task (awaiting it waits for full shutdown), the
/// accept loop's completion, and the bound-address future. Dropping the
/// handle detaches from the server but does not stop it.
pub struct ServerHandle {
    root: Option<JoinHandle<Result<(), ServerError>>>,
    accept_done: Option<oneshot::Receiver<()>>,
    bound_addr: Option<oneshot::Receiver<Result<SocketAddr, ServerError>>>,
    addr: Option<SocketAddr>,
    cancel: CancelToken,
    health: HealthFlag,
}

impl ServerHandle {
    pub(crate) fn new(
        root: JoinHandle<Result<(), ServerError>>,
        accept_done: oneshot::Receiver<()>,
        bound_addr: oneshot::Receiver<Result<SocketAddr, ServerError>>,
        cancel: CancelToken,
        health: HealthFlag,
    ) -> Self {
        Self {
            root: Some(root),
            accept_done: Some(accept_done),
            bound_addr: Some(bound_addr),
            addr: None,
            cancel,
            health,
        }
    }

    /// Local address once binding succeeds, or the bind error.
    ///
    /// A successful address is cached and returned on every later call;
    /// a bind error is yielded once, after which the server counts as
    /// closed.
    pub async fn bound_addr(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(addr) = self.addr {
            return Ok(addr);
        }
        let rx = self.bound_addr.take().ok_or(ServerError::Closed)?;
        match rx.await {
            Ok(Ok(addr)) => {
                self.addr = Some(addr);
                Ok(addr)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ServerError::Closed),
        }
    }

    /// Completes once the accept loop has exited, success or failure.
    /// Connection tasks may still be draining at that point.
    pub async fn accept_done(&mut self) {
        if let Some(rx) = self.accept_done.take() {
            let _ = rx.await;
        }
    }

    /// True while the accept loop is bound and accepting.
    #[inline]
    pub fn is_accepting(&self) -> bool {
        self.health.get()
    }

    /// Root cancel token; connection tasks hold children of it.
    #[inline]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Begin shutdown without waiting for it.
    #[inline]
    pub fn initiate_stop(&self) {
        self.cancel.cancel();
    }

    /// Full shutdown: the accept loop exits, every outstanding connection
    /// task is cancelled, and the call returns only once no connection
    /// socket remains open.
    pub async fn stop(self) -> Result<(), ServerError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the server to end without initiating shutdown.
    pub async fn join(mut self) -> Result<(), ServerError> {
        match self.root.take() {
            Some(root) => root.await.unwrap_or(Err(ServerError::Closed)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("addr", &self.addr)
            .field("is_accepting", &self.is_accepting())
            .field("cancel", &self.cancel)
            .finish()
    }
}
