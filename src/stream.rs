//! The duplex byte stream owned by a session, plaintext or TLS-wrapped.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pub enum MailStream<S> {
    Plain(S),
    Tls(Box<TlsStream<S>>),
    /// Left behind while the stream is moved out for a TLS upgrade.
    Closed,
}

impl<S> MailStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn is_tls(&self) -> bool {
        matches!(self, MailStream::Tls(_))
    }

    /// Runs the server side of a TLS handshake over a plaintext stream.
    pub async fn upgrade(self, acceptor: &TlsAcceptor) -> io::Result<Self> {
        match self {
            MailStream::Plain(stream) => {
                let tls = acceptor.accept(stream).await?;
                Ok(MailStream::Tls(Box::new(tls)))
            }
            MailStream::Tls(_) => Err(io::Error::new(io::ErrorKind::Other, "stream is already encrypted")),
            MailStream::Closed => Err(closed()),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}

impl<S> AsyncRead for MailStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MailStream::Tls(s) => Pin::new(&mut **s).poll_read(cx, buf),
            MailStream::Closed => Poll::Ready(Ok(())),
        }
    }
}

impl<S> AsyncWrite for MailStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MailStream::Tls(s) => Pin::new(&mut **s).poll_write(cx, buf),
            MailStream::Closed => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MailStream::Tls(s) => Pin::new(&mut **s).poll_flush(cx),
            MailStream::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MailStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MailStream::Tls(s) => Pin::new(&mut **s).poll_shutdown(cx),
            MailStream::Closed => Poll::Ready(Ok(())),
        }
    }
}
