//! Response write interface and the mirroring [`Capture`] decorator.
//!
//! A [`ResponseSink`] receives a response as a sequence of writes: the status,
//! each header, then body chunks. [`Capture`] wraps any sink and forwards each
//! write immediately while keeping its own copy, so a downstream response can
//! be persisted (e.g. as a cache entry) without delaying or altering what the
//! caller receives.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, Response, StatusCode};

/// Destination for the parts of an HTTP response.
pub trait ResponseSink {
    /// Sets the response status. The last write wins.
    fn write_status(&mut self, status: StatusCode);

    /// Appends a header.
    fn write_header(&mut self, name: &str, value: &str);

    /// Appends a chunk of body bytes.
    fn write_body(&mut self, chunk: Bytes);
}

impl ResponseSink for Response {
    fn write_status(&mut self, status: StatusCode) {
        self.set_status(status);
    }

    fn write_header(&mut self, name: &str, value: &str) {
        self.add_header(name, value);
    }

    fn write_body(&mut self, chunk: Bytes) {
        self.append_body(chunk);
    }
}

impl Response {
    /// Emits this response through `sink`: status first, then headers in
    /// insertion order, then the body.
    pub fn write_to<S: ResponseSink + ?Sized>(self, sink: &mut S) {
        let (status, headers, body, _) = self.into_parts();
        sink.write_status(status);
        for (name, value) in headers.iter() {
            sink.write_header(name, value);
        }
        if !body.is_empty() {
            sink.write_body(body);
        }
    }
}

/// Everything a [`Capture`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub status: StatusCode,
    pub headers: Headers,
    chunks: Vec<Bytes>,
}

impl Recorded {
    /// Returns the captured body as one contiguous buffer.
    pub fn body(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let len = many.iter().map(Bytes::len).sum();
                let mut joined = BytesMut::with_capacity(len);
                for chunk in many {
                    joined.put(chunk.as_ref());
                }
                joined.freeze()
            }
        }
    }
}

/// Sink decorator that mirrors every write into a [`Recorded`] buffer.
///
/// Writes are forwarded to the inner sink as they happen; body chunks are
/// reference-counted [`Bytes`], so mirroring never copies the payload.
///
/// # Examples
///
/// ```
/// use rttp_shield::http::{Capture, Response, StatusCode};
///
/// let upstream = Response::new(StatusCode::Ok).header("X-Id", "7").body("hello");
/// let mut capture = Capture::new(Response::new(StatusCode::Ok));
/// upstream.write_to(&mut capture);
///
/// let (forwarded, recorded) = capture.finish();
/// assert_eq!(forwarded.body_ref().as_ref(), b"hello");
/// assert_eq!(recorded.body().as_ref(), b"hello");
/// assert_eq!(recorded.headers.get("x-id"), Some("7"));
/// ```
pub struct Capture<S> {
    inner: S,
    recorded: Recorded,
}

impl<S: ResponseSink> Capture<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            recorded: Recorded {
                status: StatusCode::Ok,
                headers: Headers::new(),
                chunks: Vec::new(),
            },
        }
    }

    /// Returns the wrapped sink and the recording.
    pub fn finish(self) -> (S, Recorded) {
        (self.inner, self.recorded)
    }
}

impl<S: ResponseSink> ResponseSink for Capture<S> {
    fn write_status(&mut self, status: StatusCode) {
        self.recorded.status = status;
        self.inner.write_status(status);
    }

    fn write_header(&mut self, name: &str, value: &str) {
        self.recorded.headers.insert(name, value);
        self.inner.write_header(name, value);
    }

    fn write_body(&mut self, chunk: Bytes) {
        self.recorded.chunks.push(chunk.clone());
        self.inner.write_body(chunk);
    }
}

/// Passes `response` through a [`Capture`] and returns the forwarded response
/// together with what was recorded.
pub fn mirror(response: Response) -> (Response, Recorded) {
    let target = Response::new(response.status()).keep_alive(response.is_keep_alive());
    let mut capture = Capture::new(target);
    response.write_to(&mut capture);
    capture.finish()
}
