//! The TCP control server.
//!
//! Line-framed (`LinesCodec`, 1 KiB limit, CR tolerated), many
//! concurrent clients up to the configured cap. Writes to the worker
//! never block on a client: broadcasts fan out through a
//! `tokio::sync::broadcast` channel, and a client that cannot keep up
//! simply misses messages instead of stalling anyone else.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use ao_types::LoopMode;

use crate::protocol::{handle_line, Action, ProtocolCtx};

/// Protocol line limit.
pub const MAX_LINE: usize = 1024;

/// Accept clients until the listener fails or the runtime is torn
/// down. `shutdown_tx` is signalled when a client issues `shutdown`.
pub async fn serve(
    listener: TcpListener,
    ctx: Arc<ProtocolCtx>,
    bcast: broadcast::Sender<String>,
    shutdown_tx: mpsc::Sender<()>,
) -> std::io::Result<()> {
    let nclients = Arc::new(AtomicUsize::new(0));
    loop {
        let (socket, peer) = listener.accept().await?;
        let count = nclients.clone();
        if count.load(Ordering::Relaxed) >= ctx.server.max_clients {
            warn!("refusing {}: client limit reached", peer);
            let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE));
            let _ = framed.send("400 TOO MANY CLIENTS".to_string()).await;
            continue;
        }
        count.fetch_add(1, Ordering::Relaxed);
        info!("client connected from {}", peer);

        // subscribe before announcing, so no client misses a
        // broadcast sent between its accept and its first poll
        let rx = bcast.subscribe();
        let _ = bcast.send("200 OK CLIENT CONNECTED".to_string());

        let ctx = ctx.clone();
        let bcast = bcast.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = client_task(socket, rx, &ctx, &bcast, &shutdown_tx).await {
                debug!("client {} ended with error: {}", peer, e);
            }
            count.fetch_sub(1, Ordering::Relaxed);
            info!("client {} disconnected", peer);
            let _ = bcast.send("200 OK CLIENT DISCONNECTED".to_string());
        });
    }
}

async fn client_task(
    socket: TcpStream,
    mut rx: broadcast::Receiver<String>,
    ctx: &ProtocolCtx,
    bcast: &broadcast::Sender<String>,
    shutdown_tx: &mpsc::Sender<()>,
) -> Result<(), tokio_util::codec::LinesCodecError> {
    let framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE));
    let (mut sink, mut lines) = framed.split();

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) => {
                    // tolerate CRLF line endings
                    let line = line.trim_end_matches('\r');
                    for action in handle_line(ctx, line) {
                        match action {
                            Action::Reply(msg) => sink.send(msg).await?,
                            Action::Broadcast(msg) => {
                                let _ = bcast.send(msg);
                            }
                            Action::Close => return Ok(()),
                            Action::Shutdown => {
                                let _ = bcast.send("200 OK SHUTTING DOWN NOW".to_string());
                                ctx.shared.set_mode(LoopMode::Shutdown);
                                let _ = shutdown_tx.send(()).await;
                                return Ok(());
                            }
                        }
                    }
                }
                Some(Err(tokio_util::codec::LinesCodecError::MaxLineLengthExceeded)) => {
                    let _ = sink
                        .send(format!("400 COMMAND IGNORED: TOO LONG (MAX: {})", MAX_LINE))
                        .await;
                    return Ok(());
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
            msg = rx.recv() => match msg {
                Ok(msg) => sink.send(msg).await?,
                // this client fell behind; drop what it missed
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("client lagged, {} broadcasts dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}
