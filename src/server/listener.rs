use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// The fixed 24-byte HTTP/2 connection preface. Cleartext clients speaking
/// prior-knowledge h2c open with it; nothing in HTTP/1.x starts "PRI ".
const H2_PREFACE_HEAD: &[u8] = b"PRI ";

/// Peek at the first bytes of a cleartext connection to decide between
/// HTTP/1.1 and prior-knowledge HTTP/2. The consumed bytes are replayed to
/// the returned stream.
pub async fn sniff_h2_preface<S>(mut stream: S) -> io::Result<(bool, Rewind<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(24);

    while buf.len() < H2_PREFACE_HEAD.len() {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
    }

    let is_h2 = buf.starts_with(H2_PREFACE_HEAD);
    Ok((is_h2, Rewind::new(buf.freeze(), stream)))
}

/// IO wrapper that replays sniffed bytes before reading from the inner
/// stream.
pub struct Rewind<S> {
    prefix: Option<Bytes>,
    inner: S,
}

impl<S> Rewind<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(prefix) = self.prefix.as_mut() {
            let n = std::cmp::min(prefix.len(), buf.remaining());
            buf.put_slice(&prefix.split_to(n));
            if prefix.is_empty() {
                self.prefix = None;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
