// Unix socket request interface and the worker thread that owns all state

use crate::backends::RuleExecutor;
use crate::dispatch::{Dispatcher, Request, RequestError, Response};
use anyhow::{Context, Result};
use std::future::Future;
use std::path::Path;
use std::thread;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

/// Requests waiting for the worker before senders start to block
pub const QUEUE_DEPTH: usize = 64;

/// Longest accepted request line, newline excluded
pub const MAX_REQUEST_LEN: usize = 64 * 1024;

/// A request plus the channel its response goes back on
pub type Job = (Request, oneshot::Sender<Response>);

/// Run the dispatcher on its own thread until every job sender is dropped
///
/// Requests are handled strictly one at a time in arrival order. When the
/// channel closes the dispatcher removes all shaping before the thread exits.
pub fn spawn_worker<E>(
    mut dispatcher: Dispatcher<E>,
    mut jobs: mpsc::Receiver<Job>,
) -> Result<thread::JoinHandle<()>>
where
    E: RuleExecutor + 'static,
{
    thread::Builder::new()
        .name("ratelimitd-worker".to_string())
        .spawn(move || {
            while let Some((request, reply)) = jobs.blocking_recv() {
                let response = dispatcher.handle(request);
                // Client may have hung up
                let _ = reply.send(response);
            }

            log::info!("Request channel closed, tearing down");
            dispatcher.shutdown();
        })
        .context("Failed to spawn worker thread")
}

/// Bind the request socket, replacing a stale socket file if present
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        log::debug!("Removing stale socket {:?}", path);
        std::fs::remove_file(path).context(format!("Failed to remove {:?}", path))?;
    }

    let listener = UnixListener::bind(path).context(format!("Failed to bind {:?}", path))?;
    log::info!("Listening on {:?}", path);
    Ok(listener)
}

/// Accept connections until `shutdown` resolves
///
/// Open connections are aborted on shutdown so that the last job sender
/// is gone once this returns.
pub async fn serve<F>(listener: UnixListener, jobs: mpsc::Sender<Job>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    log::debug!("Accepted connection");
                    let jobs = jobs.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, jobs).await {
                            log::debug!("Connection ended: {:#}", e);
                        }
                    });
                }
                Err(e) => log::warn!("Accept failed: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
    Ok(())
}

/// One JSON request per line in, one JSON response per line out
///
/// A line longer than `MAX_REQUEST_LEN` is answered with an error and the
/// connection closed.
async fn handle_connection(stream: UnixStream, jobs: mpsc::Sender<Job>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_REQUEST_LEN as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(());
        }

        let oversized = buf.len() > MAX_REQUEST_LEN && buf.last() != Some(&b'\n');
        let response = if oversized {
            let e = RequestError::InvalidArgument(format!(
                "request exceeds {} bytes",
                MAX_REQUEST_LEN
            ));
            log::info!("Rejected request: {}", e);
            Response::error(&e)
        } else {
            let line = String::from_utf8_lossy(&buf);
            if line.trim().is_empty() {
                continue;
            }
            match Request::from_json(&line) {
                Ok(request) => submit(&jobs, request).await,
                Err(e) => {
                    log::info!("Rejected request: {}", e);
                    Response::error(&e)
                }
            }
        };

        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;

        if oversized {
            return Ok(());
        }
    }
}

async fn submit(jobs: &mpsc::Sender<Job>, request: Request) -> Response {
    let (reply, response) = oneshot::channel();
    if jobs.send((request, reply)).await.is_err() {
        return Response::error(&RequestError::Internal("daemon is shutting down".to_string()));
    }

    response.await.unwrap_or_else(|_| {
        Response::error(&RequestError::Internal("request was dropped".to_string()))
    })
}
