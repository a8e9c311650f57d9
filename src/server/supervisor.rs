use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::config::ServerConfig;
use crate::deadline::DeadlineRegistry;
use crate::error::ServerError;
use crate::server::conn::{Bind, Handler, Listener, ServerConnection, TcpBinder};
use crate::server::handle::ServerHandle;
use crate::server::tracker::TaskGroup;
use crate::utils::{CancelToken, HealthFlag};

/// Start a TCP server with `config`, invoking `handler` for every
/// accepted connection.
///
/// Returns immediately; binding happens inside the accept task and its
/// outcome is read from [`ServerHandle::bound_addr`]. Each connection
/// runs in its own task under the shared idle-deadline registry: a
/// connection whose handler outlives the idle timeout is cancelled and
/// its socket closed on the next registry activity.
pub fn start_server<H>(config: ServerConfig, handler: H) -> Result<ServerHandle, ServerError>
where
    H: Handler<TcpStream>,
{
    config.validate()?;
    let binder = TcpBinder::from(&config);
    Ok(serve(binder, config.idle_timeout(), handler))
}

/// Spawn the root/accept task pair over any bind capability.
///
/// The root task owns the whole tree: it supervises the accept task and,
/// once that exits (explicit stop, listener closed, or accept fault),
/// runs the shutdown cascade: stop the registry, cancel every
/// outstanding connection task, wait until the last socket is closed.
pub fn serve<B, H>(binder: B, idle_timeout: Duration, handler: H) -> ServerHandle
where
    B: Bind,
    H: Handler<<B::Listener as Listener>::Io>,
{
    let registry = Arc::new(DeadlineRegistry::new(idle_timeout));
    let cancel = CancelToken::new_root();
    let health = HealthFlag::new(false);
    let group = TaskGroup::new();
    let (addr_tx, addr_rx) = oneshot::channel();
    let (accept_tx, accept_rx) = oneshot::channel();

    let root = tokio::spawn({
        let registry = Arc::clone(&registry);
        let accept_cancel = cancel.new_child();
        let health = health.clone();
        async move {
            let accept = tokio::spawn(accept_loop(
                binder,
                handler,
                Arc::clone(&registry),
                accept_cancel,
                Arc::clone(&group),
                health,
                addr_tx,
            ));

            let result = match accept.await {
                Ok(result) => result,
                Err(err) => {
                    tracing::error!("[Server] accept task panicked: {err}");
                    Err(ServerError::Closed)
                }
            };
            let _ = accept_tx.send(());

            // Accept loop is done: reclaim whatever already expired, then
            // cancel every remaining connection task and wait for the last
            // socket to close. Stop is synchronous from the caller's point
            // of view.
            registry.sweep();
            registry.stop();
            tracing::debug!("[Server] draining {} connection task(s)", group.len());
            group.quiesce().await;
            tracing::info!("[Server] drained, all connection tasks finished");
            result
        }
    });

    ServerHandle::new(root, accept_rx, addr_rx, cancel, health)
}

async fn accept_loop<B, H>(
    binder: B,
    handler: H,
    registry: Arc<DeadlineRegistry>,
    cancel: CancelToken,
    group: Arc<TaskGroup>,
    health: HealthFlag,
    addr_tx: oneshot::Sender<Result<SocketAddr, ServerError>>,
) -> Result<(), ServerError>
where
    B: Bind,
    H: Handler<<B::Listener as Listener>::Io>,
{
    let mut listener = match binder.bind().await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("[Server] bind failed: {err}");
            let twin = io::Error::new(err.kind(), err.to_string());
            let _ = addr_tx.send(Err(ServerError::Bind(twin)));
            return Err(ServerError::Bind(err));
        }
    };
    let local = match listener.local_addr() {
        Ok(local) => local,
        Err(err) => {
            let twin = io::Error::new(err.kind(), err.to_string());
            let _ = addr_tx.send(Err(ServerError::Bind(twin)));
            return Err(ServerError::Bind(err));
        }
    };
    let _ = addr_tx.send(Ok(local));
    health.up();
    tracing::info!("[Server] listening on {local}");

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("[Server] stop requested, draining");
                break Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((io, peer)) => spawn_connection(io, peer, &handler, &registry, &cancel, &group),
                // A closed listener is the normal end of the loop, not a fault.
                Err(err) if is_listener_closed(&err) => {
                    tracing::debug!("[Server] listener closed, draining");
                    break Ok(());
                }
                Err(err) => {
                    tracing::error!("[Server] accept failed: {err}");
                    break Err(ServerError::Accept(err));
                }
            }
        }
    };
    health.down();
    // The listener drops here, releasing the bound socket before the drain.
    result
}

fn spawn_connection<Io, H>(
    io: Io,
    peer: SocketAddr,
    handler: &H,
    registry: &Arc<DeadlineRegistry>,
    cancel: &CancelToken,
    group: &Arc<TaskGroup>,
) where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    H: Handler<Io>,
{
    let conn = ServerConnection::new(io, peer);
    let id = conn.id;
    let handler = handler.clone();
    let registry = Arc::clone(registry);
    let token = cancel.new_child();
    let permit = group.enter();

    tokio::spawn(async move {
        let _permit = permit;
        tracing::debug!("[Server] {id} accepted from {peer}");
        match registry.guard(&token, handler.handle(conn)).await {
            Ok(Ok(())) => tracing::debug!("[Server] {id} finished"),
            // Isolated: reported to the failure sink, never escalated to
            // the accept loop or sibling connections.
            Ok(Err(err)) => tracing::error!("[Server] {id} handler failed: {err:#}"),
            Err(cancelled) => tracing::debug!("[Server] {id} {cancelled}"),
        }
        // Dropping the connection halves closes the socket.
    });
}

fn is_listener_closed(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::NotConnected)
}
