use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    select,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    protocol::{ServerFrame, read_frame, write_frame},
    session::{OutboundQueue, Session, outbound_channel},
    state::ServerState,
};

const SHUTDOWN_REASON: &str = "Server shutting down";

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    config: ServerConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            state: ServerState::new(config.capacity),
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared registries, for inspection while the server runs.
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            state,
            config,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &config);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_shutdown(state: &ServerState) {
    info!(sessions = state.session_count(), "server shutting down");
    state.shutdown(SHUTDOWN_REASON);
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    config: &ServerConfig,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state, config.write_timeout),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    write_timeout: Option<Duration>,
) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state, write_timeout).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    write_timeout: Option<Duration>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let (outbound, queue) = outbound_channel();

    let session = match state.admit(outbound) {
        Ok(session) => session,
        Err(err) => {
            info!(%peer, capacity = state.capacity(), error = %err, "rejecting connection");
            write_frame(
                &mut writer,
                &ServerFrame::Error {
                    reason: err.to_string(),
                },
            )
            .await?;
            writer.shutdown().await?;
            return Ok(());
        }
    };
    info!(%peer, session = session.id(), "client connected");

    let writer_task = tokio::spawn(run_writer(
        writer,
        queue,
        Arc::clone(&session),
        write_timeout,
    ));

    let mut reader = BufReader::new(reader);
    if let Err(err) = run_receive_loop(&session, &mut reader).await {
        debug!(session = session.id(), error = ?err, "connection read failed");
    }
    session.teardown();

    writer_task.await?;
    info!(%peer, session = session.id(), "client disconnected");
    Ok(())
}

/// Reads and dispatches frames until the peer leaves or the session is torn
/// down from elsewhere.
async fn run_receive_loop<R>(session: &Arc<Session>, reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            _ = session.closed() => return Ok(()),
            line = read_frame(reader) => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if session.handle_line(&line).is_break() {
                    return Ok(());
                }
            }
        }
    }
}

/// Drains the session's outbound queue onto the socket.
///
/// The queue ends once the session drops its sender during teardown; whatever
/// was queued before that is still written, then the socket is shut down.
async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut queue: OutboundQueue,
    session: Arc<Session>,
    write_timeout: Option<Duration>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(err) = write_with_deadline(&mut writer, &frame, write_timeout).await {
            debug!(session = session.id(), error = ?err, "connection write failed");
            session.teardown();
            return;
        }
    }

    if let Err(err) = writer.shutdown().await {
        debug!(session = session.id(), error = ?err, "failed to shut down connection");
    }
}

async fn write_with_deadline<W>(
    writer: &mut W,
    frame: &ServerFrame,
    deadline: Option<Duration>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match deadline {
        Some(limit) => timeout(limit, write_frame(writer, frame))
            .await
            .unwrap_or_else(|_| {
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write deadline exceeded",
                ))
            }),
        None => write_frame(writer, frame).await,
    }
}
