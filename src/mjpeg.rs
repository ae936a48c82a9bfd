use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;

use crate::demux::Frame;
use crate::session::{CloseReason, FrameSink, SessionHandle, SinkError};

pub const BOUNDARY: &str = "frame";

/// One multipart part: boundary line, part headers, the JPEG and a trailing CRLF.
pub fn format_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Queues multipart parts for an HTTP response body.
///
/// The queue is bounded; once `capacity` parts are waiting the client is
/// treated as too slow.
pub struct MultipartSink {
    tx: mpsc::Sender<Bytes>,
    capacity: usize,
}

impl MultipartSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, capacity }, rx)
    }
}

impl FrameSink for MultipartSink {
    fn send(&mut self, frame: &Frame) -> Result<(), SinkError> {
        match self.tx.try_send(format_part(frame.as_bytes())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SinkError::Full { pending: self.capacity }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let tx = self.tx.clone();
        Box::pin(async move { tx.closed().await })
    }

    fn on_close(&mut self, reason: &CloseReason) {
        // Headers are already out, so the body simply ends.
        debug!("Multipart stream ending: {}", reason);
    }
}

/// Streaming `multipart/x-mixed-replace` response.
///
/// The session handle lives inside the body stream, so the session is torn
/// down as soon as the client goes away and the body is dropped.
pub fn stream_response(parts: mpsc::Receiver<Bytes>, session: SessionHandle) -> Response {
    let body = ReceiverStream::new(parts).map(move |part| {
        let _session = &session;
        Ok::<_, std::convert::Infallible>(part)
    });

    let mut response = Body::from_stream(body).into_response();
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("multipart/x-mixed-replace; boundary=frame"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}
