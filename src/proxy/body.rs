//! Body plumbing shared by the HTTP/1.1 and HTTP/2 sessions.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};

use crate::{Error, Result};

/// Streaming body type used on every leg of the proxy.
pub type ProxyBody = BoxBody<Bytes, Error>;

/// Largest DATA frame payload handed to h2 in one call.
const H2_CHUNK_LIMIT: usize = 16 * 1024;

pub fn full<B: Into<Bytes>>(bytes: B) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub fn incoming(body: Incoming) -> ProxyBody {
    body.map_err(Error::from).boxed()
}

/// Reads a whole body into memory.
pub async fn collect(body: ProxyBody) -> Result<Bytes> {
    Ok(body.collect().await?.to_bytes())
}

/// `hyper::body::Body` over an h2 receive stream. Receive capacity is released as soon as
/// a frame is handed out, so the peer's window only stays closed while the consumer lags.
pub struct H2RecvBody {
    recv: h2::RecvStream,
    data_done: bool,
}

impl H2RecvBody {
    pub fn new(recv: h2::RecvStream) -> Self {
        Self {
            recv,
            data_done: false,
        }
    }

    pub fn boxed(self) -> ProxyBody {
        BodyExt::boxed(self)
    }
}

impl Body for H2RecvBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Error>>> {
        if !self.data_done {
            match self.recv.poll_data(cx) {
                Poll::Ready(Some(Ok(data))) => {
                    let _ = self.recv.flow_control().release_capacity(data.len());
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
                Poll::Ready(None) => self.data_done = true,
                Poll::Pending => return Poll::Pending,
            }
        }

        match self.recv.poll_trailers(cx) {
            Poll::Ready(Ok(Some(trailers))) => Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
            Poll::Ready(Ok(None)) => Poll::Ready(None),
            Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e.into()))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.recv.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

/// Writes `body` onto an h2 send stream, waiting for flow-control capacity before each
/// chunk. Returns the number of payload bytes written.
pub async fn send_body_h2(mut body: ProxyBody, sink: &mut h2::SendStream<Bytes>) -> Result<u64> {
    let mut total = 0u64;
    if body.is_end_stream() {
        sink.send_data(Bytes::new(), true)?;
        return Ok(total);
    }

    while let Some(frame) = body.frame().await {
        let frame = frame?;
        match frame.into_data() {
            Ok(data) => {
                total += data.len() as u64;
                send_data_with_backpressure(sink, data, false).await?;
            }
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    sink.send_trailers(trailers)?;
                    return Ok(total);
                }
            }
        }
    }

    sink.send_data(Bytes::new(), true)?;
    Ok(total)
}

pub async fn send_data_with_backpressure(
    sink: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    end_stream: bool,
) -> Result<()> {
    if data.is_empty() {
        sink.send_data(data, end_stream)?;
        return Ok(());
    }

    while !data.is_empty() {
        sink.reserve_capacity(data.len().min(H2_CHUNK_LIMIT));
        let available = match std::future::poll_fn(|cx| sink.poll_capacity(cx)).await {
            Some(Ok(n)) => n,
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(Error::protocol(
                    "HTTP/2 stream closed before send capacity was granted",
                ))
            }
        };
        if available == 0 {
            continue;
        }
        let chunk = data.split_to(available.min(data.len()).min(H2_CHUNK_LIMIT));
        sink.send_data(chunk, end_stream && data.is_empty())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_and_empty_bodies() {
        assert_eq!(collect(full("hello")).await.unwrap(), Bytes::from("hello"));
        assert!(collect(empty()).await.unwrap().is_empty());
        assert!(empty().is_end_stream());
    }
}
