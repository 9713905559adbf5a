//! Framing for the control-plane Unix socket.
//!
//! Per connection: the client writes one JSON object and shuts down its
//! write half; the server reads until EOF, decodes the request, runs the
//! handler, writes one JSON object back, and closes the connection. There is
//! no length prefix and no newline framing — request and response are each
//! a single JSON object delimited by the connection close.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Read a single JSON object from `reader` until EOF.
pub async fn read_json_request<R, T>(reader: &mut R, max_bytes: usize) -> std::io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let mut limited = reader.take(max_bytes as u64 + 1);
    limited.read_to_end(&mut buf).await?;
    if buf.len() > max_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("request exceeds max length ({} > {})", buf.len(), max_bytes),
        ));
    }

    let s = std::str::from_utf8(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    serde_json::from_str::<T>(s)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Write a single JSON object to `writer`, flush it, and shut down the write
/// half so the peer sees EOF after the object.
pub async fn write_json_response<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

/// Serve exactly one request/response exchange on `stream`.
pub async fn serve_one_shot_connection<Req, Resp, F, Fut, InvalidResp>(
    stream: UnixStream,
    handler: F,
    invalid_response: InvalidResp,
) -> std::io::Result<()>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = Resp>,
    InvalidResp: FnOnce(std::io::Error) -> Resp,
{
    let (mut reader, mut writer) = stream.into_split();

    let resp = match read_json_request::<_, Req>(&mut reader, DEFAULT_MAX_REQUEST_BYTES).await {
        Ok(req) => handler(req).await,
        Err(e) => invalid_response(e),
    };

    write_json_response(&mut writer, &resp).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    struct Req {
        n: u64,
    }
    #[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
    struct Resp {
        ok: bool,
        n: u64,
    }

    #[tokio::test]
    async fn round_trips_a_single_request_and_response() {
        let (a, b) = UnixStream::pair().unwrap();
        let server = tokio::spawn(async move {
            serve_one_shot_connection(
                a,
                |req: Req| async move { Resp { ok: true, n: req.n } },
                |_e| Resp { ok: false, n: 0 },
            )
            .await
            .unwrap();
        });

        let (mut r, mut w) = b.into_split();
        w.write_all(br#"{"n":7}"#).await.unwrap();
        w.shutdown().await.unwrap();

        let mut raw = Vec::new();
        r.read_to_end(&mut raw).await.unwrap();
        let resp: Resp = serde_json::from_slice(&raw).unwrap();
        assert_eq!(resp, Resp { ok: true, n: 7 });

        server.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_json_yields_invalid_response() {
        let (a, b) = UnixStream::pair().unwrap();
        let server = tokio::spawn(async move {
            serve_one_shot_connection(
                a,
                |_req: Req| async move { Resp { ok: true, n: 0 } },
                |_e| Resp { ok: false, n: 0 },
            )
            .await
            .unwrap();
        });

        let (mut r, mut w) = b.into_split();
        w.write_all(b"{not json}").await.unwrap();
        w.shutdown().await.unwrap();

        let mut raw = Vec::new();
        r.read_to_end(&mut raw).await.unwrap();
        let resp: Resp = serde_json::from_slice(&raw).unwrap();
        assert_eq!(resp, Resp { ok: false, n: 0 });

        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_requests_over_the_size_limit() {
        let (a, b) = UnixStream::pair().unwrap();
        let server_task = tokio::spawn(async move {
            let (mut reader, _writer) = a.into_split();
            read_json_request::<_, serde_json::Value>(&mut reader, 8).await
        });

        let (_r, mut w) = b.into_split();
        w.write_all(b"123456789").await.unwrap();
        w.shutdown().await.unwrap();

        let err = server_task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
