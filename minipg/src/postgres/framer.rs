//! Reassembly of length prefixed frames from the transport stream.
use std::task::{Context, Poll, ready};

use bytes::{Buf, Bytes, BytesMut};

use super::{backend::is_backend_tag, error::ProtocolError};
use crate::{error::Result, io, net::Socket};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Every server frame is a one byte tag, a four byte big-endian length
/// covering the length word and payload, then the payload.
const HEADER: usize = 5;

/// Turns arbitrarily segmented reads into complete `(tag, payload)` frames.
///
/// Bytes that do not yet form a complete frame stay in the spill buffer for
/// the next read; the buffer never holds a complete undelivered frame.
pub(crate) struct Framer {
    buf: BytesMut,
}

impl Framer {
    pub fn new() -> Framer {
        Framer { buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY) }
    }

    /// Poll for the next complete frame, reading from `socket` as needed.
    pub fn poll_frame(
        &mut self,
        socket: &mut Socket,
        cx: &mut Context,
    ) -> Poll<Result<(u8, Bytes)>> {
        loop {
            let Some(mut header) = self.buf.get(..HEADER) else {
                self.buf.reserve(DEFAULT_BUF_CAPACITY);
                ready!(io::poll_read(socket, &mut self.buf, cx))?;
                continue;
            };

            let tag = header.get_u8();
            let len = header.get_i32();

            if len < 4 {
                return Poll::Ready(Err(ProtocolError::FrameSize { len }.into()));
            }
            let len = len as usize;

            if self.buf.len() - 1 < len {
                self.buf.reserve(1 + len - self.buf.len());
                ready!(io::poll_read(socket, &mut self.buf, cx))?;
                continue;
            }

            self.buf.advance(HEADER);
            let body = self.buf.split_to(len - 4).freeze();

            return Poll::Ready(Ok((tag, body)));
        }
    }

    /// Whether the spilled bytes can still begin a valid frame.
    ///
    /// Checked after a response completed: leftovers that cannot open a known
    /// frame are the fatal "data segmentation" condition.
    pub fn residual_ok(&self) -> bool {
        match self.buf.first() {
            None => true,
            Some(&tag) => is_backend_tag(tag),
        }
    }
}

impl std::fmt::Debug for Framer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framer").field("spilled", &self.buf.len()).finish()
    }
}
