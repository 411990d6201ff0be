use crate::utils::error::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Read/write chunk size for the relay loop, per the protocol's relay buffer
/// size (matches the reference implementation's `RELAY_BUFFER_SIZE`).
const BUFFER_SIZE: usize = 4096;

/// Bidirectionally copy bytes between `client` and `upstream` until either
/// side closes or errors. Both directions run as separate tasks so that a
/// stalled upload doesn't block a download already in flight; closing
/// either half cancels the other via `token`.
pub async fn relay_tcp(client: TcpStream, upstream: TcpStream) -> Result<()> {
    let (mut client_rd, mut client_wr) = client.into_split();
    let (mut upstream_rd, mut upstream_wr) = upstream.into_split();

    let token = CancellationToken::new();

    let upload_token = token.clone();
    let upload = tokio::spawn(async move {
        let result = copy_with_cancellation(&mut client_rd, &mut upstream_wr, &upload_token).await;
        upload_token.cancel();
        result
    });

    let download_token = token.clone();
    let download = tokio::spawn(async move {
        let result = copy_with_cancellation(&mut upstream_rd, &mut client_wr, &download_token).await;
        download_token.cancel();
        result
    });

    let (upload_result, download_result) = tokio::join!(upload, download);

    upload_result.map_err(|e| std::io::Error::other(e.to_string()))??;
    download_result.map_err(|e| std::io::Error::other(e.to_string()))??;

    debug!("TCP relay finished");
    Ok(())
}

async fn copy_with_cancellation<R, W>(
    reader: &mut R,
    writer: &mut W,
    token: &CancellationToken,
) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            result = reader.read(&mut buf) => result?,
        };

        if n == 0 {
            writer.shutdown().await.ok();
            return Ok(());
        }

        trace!(bytes = n, "relayed chunk");
        writer.write_all(&buf[..n]).await?;
    }
}
