//! Forward supervisors
//!
//! A running forward is one spawned task that accepts connections (a local
//! TCP listener, or forwarded channels routed to it by its client), splices
//! each one in its own task, and fires the heartbeat callback on its tick.
//! Cancelling the forward stops accepting, closes the listener and waits a
//! bounded time for the splices to finish.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use cp_core::ForwardError;
use cp_models::{ForwardKey, ForwardSide};

use super::transport::{BoxedStream, InboundChannel, SshTransport};

/// Called on every tick of a forward
pub type TickCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Queued inbound channels per remote forward
const REMOTE_ROUTE_CAPACITY: usize = 32;

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Listen on the agent host, connect through the endpoint
#[derive(Clone)]
pub struct LocalForwardRequest {
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    /// Period of `tick_cb`; zero disables it
    pub tick: Duration,
    pub tick_cb: Option<TickCallback>,
}

/// Listen on the endpoint, connect from the agent host
#[derive(Clone)]
pub struct RemoteForwardRequest {
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
    /// Period of `tick_cb`; zero disables it
    pub tick: Duration,
    pub tick_cb: Option<TickCallback>,
}

/// Either direction, as stored by a client
#[derive(Clone)]
pub enum ForwardRequest {
    Local(LocalForwardRequest),
    Remote(RemoteForwardRequest),
}

impl ForwardRequest {
    /// Key of the tunnel this request opens on `endpoint_id`
    pub fn key(&self, endpoint_id: &str) -> ForwardKey {
        match self {
            ForwardRequest::Local(req) => {
                ForwardKey::new(endpoint_id, ForwardSide::Local, &req.local_addr, req.local_port)
            }
            ForwardRequest::Remote(req) => ForwardKey::new(
                endpoint_id,
                ForwardSide::Remote,
                &req.remote_addr,
                req.remote_port,
            ),
        }
    }
}

impl fmt::Debug for ForwardRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardRequest::Local(req) => write!(
                f,
                "L {}:{} -> {}:{}",
                req.local_addr, req.local_port, req.remote_addr, req.remote_port
            ),
            ForwardRequest::Remote(req) => write!(
                f,
                "R {}:{} -> {}:{}",
                req.remote_addr, req.remote_port, req.local_addr, req.local_port
            ),
        }
    }
}

/// Handle to a spawned forward supervisor
pub(crate) struct RunningForward {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RunningForward {
    /// Cancel the supervisor and wait up to `grace` for it to drain
    pub(crate) async fn stop(self, grace: Duration) {
        self.cancel.cancel();
        let mut task = self.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::warn!("Forward did not drain in time, aborting");
            task.abort();
        }
    }
}

/// Bind the local listener and start serving it.
///
/// Binding happens before this returns so failures reach the caller.
pub(crate) async fn start_local(
    transport: Arc<dyn SshTransport>,
    req: &LocalForwardRequest,
    parent: &CancellationToken,
    grace: Duration,
) -> Result<RunningForward, ForwardError> {
    let addr = host_port(&req.local_addr, req.local_port);
    let listener = TcpListener::bind((req.local_addr.as_str(), req.local_port))
        .await
        .map_err(|source| ForwardError::Bind {
            addr: addr.clone(),
            source,
        })?;
    tracing::info!(
        listen = %addr,
        target = %host_port(&req.remote_addr, req.remote_port),
        "Local forward listening"
    );

    let cancel = parent.child_token();
    let task = tokio::spawn(run_local(
        listener,
        transport,
        req.clone(),
        cancel.clone(),
        grace,
    ));
    Ok(RunningForward { cancel, task })
}

/// Ask the endpoint for the remote listener and start serving its channels.
///
/// Returns the sender the client routes inbound channels for this
/// listener into.
pub(crate) async fn start_remote(
    transport: Arc<dyn SshTransport>,
    req: &RemoteForwardRequest,
    parent: &CancellationToken,
    grace: Duration,
) -> Result<(RunningForward, mpsc::Sender<InboundChannel>), ForwardError> {
    transport
        .request_remote_listener(&req.remote_addr, req.remote_port)
        .await?;
    tracing::info!(
        listen = %host_port(&req.remote_addr, req.remote_port),
        target = %host_port(&req.local_addr, req.local_port),
        "Remote forward listening"
    );

    let (tx, rx) = mpsc::channel(REMOTE_ROUTE_CAPACITY);
    let cancel = parent.child_token();
    let task = tokio::spawn(run_remote(rx, transport, req.clone(), cancel.clone(), grace));
    Ok((RunningForward { cancel, task }, tx))
}

async fn run_local(
    listener: TcpListener,
    transport: Arc<dyn SshTransport>,
    req: LocalForwardRequest,
    cancel: CancellationToken,
    grace: Duration,
) {
    let mut splices = JoinSet::new();
    let mut ticks = JoinSet::new();
    let mut ticker = tick_interval(req.tick);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tracing::debug!(%peer, port = req.local_port, "Accepted local connection");
                    let transport = Arc::clone(&transport);
                    let host = req.remote_addr.clone();
                    let port = req.remote_port;
                    let cancel = cancel.clone();
                    splices.spawn(async move {
                        match transport.open_direct(&host, port, peer).await {
                            Ok(stream) => splice(socket, stream, cancel).await,
                            Err(e) => {
                                tracing::warn!(%peer, error = %e, "Failed to open tunnel channel");
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(port = req.local_port, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            },
            _ = next_tick(&mut ticker) => fire_tick(&mut ticks, &req.tick_cb),
            Some(_) = splices.join_next(), if !splices.is_empty() => {}
            Some(_) = ticks.join_next(), if !ticks.is_empty() => {}
        }
    }

    drop(listener);
    ticks.abort_all();
    drain(splices, grace).await;
    tracing::info!(port = req.local_port, "Local forward closed");
}

async fn run_remote(
    mut inbound: mpsc::Receiver<InboundChannel>,
    transport: Arc<dyn SshTransport>,
    req: RemoteForwardRequest,
    cancel: CancellationToken,
    grace: Duration,
) {
    let mut splices = JoinSet::new();
    let mut ticks = JoinSet::new();
    let mut ticker = tick_interval(req.tick);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            channel = inbound.recv() => match channel {
                Some(channel) => {
                    tracing::debug!(originator = %channel.originator, port = req.remote_port, "Inbound tunnel channel");
                    let target = (req.local_addr.clone(), req.local_port);
                    let cancel = cancel.clone();
                    splices.spawn(async move {
                        match TcpStream::connect((target.0.as_str(), target.1)).await {
                            Ok(socket) => splice(socket, channel.stream, cancel).await,
                            Err(e) => {
                                tracing::warn!(
                                    target = %host_port(&target.0, target.1),
                                    error = %e,
                                    "Failed to dial forward target"
                                );
                            }
                        }
                    });
                }
                None => break,
            },
            _ = next_tick(&mut ticker) => fire_tick(&mut ticks, &req.tick_cb),
            Some(_) = splices.join_next(), if !splices.is_empty() => {}
            Some(_) = ticks.join_next(), if !ticks.is_empty() => {}
        }
    }

    inbound.close();
    let cancel_listener = transport.cancel_remote_listener(&req.remote_addr, req.remote_port);
    match tokio::time::timeout(grace, cancel_listener).await {
        Ok(Err(e)) => tracing::debug!(error = %e, "Failed to cancel remote listener"),
        Err(_) => tracing::debug!("Timed out cancelling remote listener"),
        Ok(Ok(())) => {}
    }
    ticks.abort_all();
    drain(splices, grace).await;
    tracing::info!(port = req.remote_port, "Remote forward closed");
}

/// Copy both ways until either side closes or the forward is cancelled.
/// I/O errors only end this pair.
async fn splice(mut socket: TcpStream, mut stream: BoxedStream, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut socket, &mut stream) => match result {
            Ok((up, down)) => tracing::debug!(up, down, "Splice finished"),
            Err(e) => tracing::debug!(error = %e, "Splice ended with error"),
        }
    }
    let _ = socket.shutdown().await;
    let _ = stream.shutdown().await;
}

async fn drain(mut splices: JoinSet<()>, grace: Duration) {
    let all = async { while splices.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, all).await.is_err() {
        tracing::warn!("Splices did not drain in time, aborting");
    }
}

fn tick_interval(tick: Duration) -> Option<Interval> {
    if tick.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn fire_tick(ticks: &mut JoinSet<()>, tick_cb: &Option<TickCallback>) {
    if let Some(cb) = tick_cb {
        ticks.spawn(cb());
    }
}

/// `host:port`, bracketing IPv6 literals
pub(crate) fn host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
