//! Pass-through capture of HTTP responses.
//!
//! The wrapped body is streamed to the client frame by frame as it arrives;
//! a copy of every data frame is kept so the whole response can be handed to
//! a callback once the body is done with.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use hyper::body::{Body, Frame, SizeHint};
use hyper::{HeaderMap, Response, StatusCode};

/// Everything recorded about one response.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whether the body reached end of stream. A client that hangs up early
    /// leaves a truncated copy behind.
    pub complete: bool,
}

type OnComplete = Box<dyn FnOnce(CapturedResponse) + Send>;

pub struct ResponseCapture<B: Body> {
    inner: B,
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    complete: bool,
    on_complete: Option<OnComplete>,
}

impl<B> ResponseCapture<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        inner: B,
        on_complete: impl FnOnce(CapturedResponse) + Send + 'static,
    ) -> Self {
        Self {
            complete: inner.is_end_stream(),
            inner,
            status,
            headers,
            body: BytesMut::new(),
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// Wrap the body of `response`, recording its current status and headers.
    pub fn wrap(
        response: Response<B>,
        on_complete: impl FnOnce(CapturedResponse) + Send + 'static,
    ) -> Response<Self> {
        let (parts, body) = response.into_parts();
        let capture = Self::new(parts.status, parts.headers.clone(), body, on_complete);
        Response::from_parts(parts, capture)
    }
}

impl<B> Body for ResponseCapture<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.body.extend_from_slice(data);
                }
                if this.inner.is_end_stream() {
                    this.complete = true;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.complete = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for ResponseCapture<B> {
    fn drop(&mut self) {
        let Some(on_complete) = self.on_complete.take() else {
            return;
        };
        on_complete(CapturedResponse {
            status: self.status,
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body).freeze(),
            complete: self.complete || self.inner.is_end_stream(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    use http_body_util::{BodyExt, Full};

    /// Body yielding a fixed list of chunks, never hinting at its end.
    struct Chunked(VecDeque<&'static [u8]>);

    impl Body for Chunked {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            Poll::Ready(
                self.0
                    .pop_front()
                    .map(|chunk| Ok(Frame::data(Bytes::from_static(chunk)))),
            )
        }
    }

    fn recorder() -> (
        Arc<Mutex<Vec<CapturedResponse>>>,
        impl FnOnce(CapturedResponse) + Send + 'static,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |captured| sink.lock().unwrap().push(captured))
    }

    #[tokio::test]
    async fn test_forwards_body_and_records_copy() {
        let (seen, on_complete) = recorder();
        let response = Response::builder()
            .status(StatusCode::CREATED)
            .header("content-type", "text/plain")
            .body(Chunked(VecDeque::from(vec![&b"hello "[..], &b"world"[..]])))
            .unwrap();

        let wrapped = ResponseCapture::wrap(response, on_complete);
        assert_eq!(wrapped.status(), StatusCode::CREATED);

        let forwarded = wrapped.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(forwarded, Bytes::from_static(b"hello world"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, StatusCode::CREATED);
        assert_eq!(seen[0].headers["content-type"], "text/plain");
        assert_eq!(seen[0].body, Bytes::from_static(b"hello world"));
        assert!(seen[0].complete);
    }

    #[tokio::test]
    async fn test_abandoned_body_is_incomplete() {
        let (seen, on_complete) = recorder();
        let mut capture = ResponseCapture::new(
            StatusCode::OK,
            HeaderMap::new(),
            Chunked(VecDeque::from(vec![&b"first"[..], &b"second"[..]])),
            on_complete,
        );

        let frame = capture.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"first"));
        drop(capture);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].complete);
        assert_eq!(seen[0].body, Bytes::from_static(b"first"));
    }

    #[test]
    fn test_empty_body_counts_as_complete_without_polling() {
        let (seen, on_complete) = recorder();
        let response = Response::new(Full::new(Bytes::new()));

        drop(ResponseCapture::wrap(response, on_complete));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].status, StatusCode::OK);
        assert!(seen[0].complete);
        assert!(seen[0].body.is_empty());
    }
}
