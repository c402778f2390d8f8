//! Frame-size normalisation for relayed byte streams.
//!
//! Upstream bodies arrive in whatever pieces the transport hands over.
//! [`Rechunk`] re-cuts them so no emitted piece exceeds a fixed size; each
//! piece becomes one chunk of the client-facing chunked encoding. The byte
//! sequence itself is never altered.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::Stream;
use pin_project_lite::pin_project;

/// Largest frame forwarded to the client.
pub const MAX_FRAME: usize = 4096;

pin_project! {
    /// Splits every item of the inner stream into frames of at most
    /// `max_frame` bytes. Empty items are dropped: an empty chunk would
    /// terminate chunked framing early.
    pub struct Rechunk<S> {
        #[pin]
        inner: S,
        max_frame: usize,
        pending: Bytes,
    }
}

impl<S> Rechunk<S> {
    pub fn new(inner: S) -> Self {
        Self::with_max_frame(inner, MAX_FRAME)
    }

    pub fn with_max_frame(inner: S, max_frame: usize) -> Self {
        Self {
            inner,
            max_frame: max_frame.max(1),
            pending: Bytes::new(),
        }
    }
}

impl<S, E> Stream for Rechunk<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if !this.pending.is_empty() {
                let take = this.pending.len().min(*this.max_frame);
                return Poll::Ready(Some(Ok(this.pending.split_to(take))));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => *this.pending = chunk,
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
