//! Control-plane Unix socket server (§3, §4.6).
//!
//! One connection, one command, one response — no persistent session, no
//! pipelining. `wharf` the CLI dials in, writes a `Command`, reads back a
//! `Response`, and disconnects.

use std::future::Future;
use std::path::Path;
use tokio::net::{UnixListener, UnixStream};

use wharf_core::{Command, ErrorKind, Response};
use wharf_socket::serve_one_shot_connection;

pub struct SocketServer {
    path: String,
}

fn prepare_socket_path(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn restrict_socket_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

impl SocketServer {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub async fn run<F, Fut>(&self, handler: F) -> std::io::Result<()>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let path = Path::new(&self.path);
        prepare_socket_path(path)?;

        let listener = UnixListener::bind(&self.path)?;
        #[cfg(unix)]
        restrict_socket_permissions(path)?;
        tracing::info!(path = %self.path, "control socket listening");

        let handler = std::sync::Arc::new(handler);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            tracing::error!(error = %e, "control socket connection error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "control socket accept error");
                }
            }
        }
    }
}

async fn handle_connection<F, Fut>(
    stream: UnixStream,
    handler: std::sync::Arc<F>,
) -> std::io::Result<()>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    serve_one_shot_connection(
        stream,
        move |cmd| {
            tracing::debug!(command = ?cmd, "received command");
            handler(cmd)
        },
        |e| Response::err(ErrorKind::Invalid, format!("invalid request: {e}")),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::sleep;

    #[test]
    fn prepare_socket_path_removes_stale_file_and_creates_parent() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("nested").join("wharf.sock");
        std::fs::create_dir_all(socket_path.parent().unwrap()).unwrap();
        std::fs::write(&socket_path, b"stale").unwrap();

        prepare_socket_path(&socket_path).unwrap();

        assert!(socket_path.parent().unwrap().exists());
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn handle_connection_returns_invalid_for_bad_json() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let handler = std::sync::Arc::new(|_cmd: Command| async move { Response::ok_empty() });
        let server_task = tokio::spawn(handle_connection(server, handler));

        client.write_all(b"not-json").await.unwrap();
        client.shutdown().await.unwrap();

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let resp: Response = serde_json::from_slice(&raw).unwrap();
        assert!(!resp.is_ok());
        assert_eq!(resp.kind, Some(ErrorKind::Invalid));

        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_serves_one_command_per_connection_on_a_fresh_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("wharf.sock");
        let path_str = socket_path.to_string_lossy().to_string();

        let server = SocketServer::new(path_str.clone());
        let server_task = tokio::spawn(async move {
            let _ = server
                .run(|cmd| async move {
                    match cmd {
                        Command::List => Response::ok(serde_json::json!([])),
                        _ => Response::err(ErrorKind::Invalid, "unexpected command"),
                    }
                })
                .await;
        });

        let mut ready = false;
        for _ in 0..100 {
            if let Ok(meta) = std::fs::metadata(&socket_path)
                && meta.file_type().is_socket()
            {
                ready = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(ready, "socket was not created at {}", socket_path.display());

        let mut client = UnixStream::connect(&path_str).await.unwrap();
        client.write_all(br#"{"command":"list"}"#).await.unwrap();
        client.shutdown().await.unwrap();

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let resp: Response = serde_json::from_slice(&raw).unwrap();
        assert!(resp.is_ok());

        server_task.abort();
        let _ = server_task.await;
    }
}
