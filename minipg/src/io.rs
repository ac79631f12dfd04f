//! Poll based io helpers over the buffered transport.
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::net::Socket;

/// Read once into the spare capacity of `buf`.
///
/// Caller is responsible for reserving capacity beforehand.
pub(crate) fn poll_read(
    socket: &mut Socket,
    buf: &mut BytesMut,
    cx: &mut Context,
) -> Poll<io::Result<()>> {
    let mut read_buf = ReadBuf::uninit(buf.spare_capacity_mut());
    ready!(Pin::new(socket).poll_read(cx, &mut read_buf))?;

    let read = read_buf.filled().len();
    if read == 0 {
        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
    }

    // SAFETY: `read` bytes of the spare capacity just initialized by `poll_read`
    unsafe { buf.set_len(buf.len() + read) };

    Poll::Ready(Ok(()))
}

/// Write and flush the whole `buf`.
pub(crate) fn poll_write_all(
    socket: &mut Socket,
    buf: &mut BytesMut,
    cx: &mut Context,
) -> Poll<io::Result<()>> {
    while !buf.is_empty() {
        let written = ready!(Pin::new(&mut *socket).poll_write(cx, buf))?;
        if written == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
        buf.advance(written);
    }
    Pin::new(socket).poll_flush(cx)
}
