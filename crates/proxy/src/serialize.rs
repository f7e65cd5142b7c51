//! Response serialization: content negotiation, optional gzip, and the
//! pooled byte buffer used to size `Content-Length` exactly.

use std::io::{self, Write};
use std::sync::OnceLock;

use axum::body::Body;
use axum::http::header::{
    ACCEPT, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use reverse_exporter_expfmt::{self as expfmt, MetricFamily};
use tracing::{debug, error};

/// Process-wide buffer pool. Initialized at first use and never torn down;
/// buffers are cleared on return.
static BUFFER_POOL: OnceLock<Mutex<Vec<Vec<u8>>>> = OnceLock::new();

fn take_buffer() -> Vec<u8> {
    BUFFER_POOL
        .get_or_init(Default::default)
        .lock()
        .pop()
        .unwrap_or_default()
}

fn return_buffer(mut buffer: Vec<u8>) {
    buffer.clear();
    BUFFER_POOL.get_or_init(Default::default).lock().push(buffer);
}

/// The response body writer, optionally gzip-wrapped.
enum BodyWriter<'a> {
    Plain(&'a mut Vec<u8>),
    Gzip(GzEncoder<&'a mut Vec<u8>>),
}

impl BodyWriter<'_> {
    fn finish(self) -> io::Result<()> {
        match self {
            BodyWriter::Plain(_) => Ok(()),
            BodyWriter::Gzip(encoder) => encoder.finish().map(|_| ()),
        }
    }
}

impl Write for BodyWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            BodyWriter::Plain(buffer) => buffer.write(data),
            BodyWriter::Gzip(encoder) => encoder.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            BodyWriter::Plain(buffer) => buffer.flush(),
            BodyWriter::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Whether the client advertised gzip in `Accept-Encoding`.
fn accepts_gzip(headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    value.split(',').any(|part| {
        let part = part.trim();
        part == "gzip" || part.starts_with("gzip;")
    })
}

/// Serializes the aggregated families into an HTTP response. Status is 200
/// even when sources failed; 500 only when encoding itself failed before a
/// single byte was buffered. An encoder error after partial output is
/// logged and truncates the response.
pub fn metrics_response(headers: &HeaderMap, families: &[MetricFamily]) -> Response {
    let format = expfmt::negotiate(
        headers
            .get(ACCEPT)
            .and_then(|value| value.to_str().ok()),
    );
    let gzip = accepts_gzip(headers);

    let mut buffer = take_buffer();
    let mut encode_error = None;
    {
        let mut writer = if gzip {
            BodyWriter::Gzip(GzEncoder::new(&mut buffer, Compression::default()))
        } else {
            BodyWriter::Plain(&mut buffer)
        };
        for family in families {
            if let Err(err) = expfmt::encode(&mut writer, format, family) {
                encode_error = Some(err);
                break;
            }
        }
        if let Err(err) = writer.finish() {
            encode_error.get_or_insert(err);
        }
    }

    if let Some(err) = encode_error {
        if buffer.is_empty() {
            return_buffer(buffer);
            error!(error = %err, "metrics encoding failed with nothing buffered");
            return plain_error_response(StatusCode::INTERNAL_SERVER_ERROR, &err);
        }
        error!(error = %err, "metrics encoding failed, truncating response");
    }

    debug!(bytes = buffer.len(), gzip, "serialized metrics response");
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, format.content_type())
        .header(CONTENT_LENGTH, buffer.len());
    if gzip {
        builder = builder.header(CONTENT_ENCODING, "gzip");
    }
    let body = Bytes::copy_from_slice(&buffer);
    return_buffer(buffer);
    match builder.body(Body::from(body)) {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "building metrics response failed");
            plain_error_response(StatusCode::INTERNAL_SERVER_ERROR, &err)
        }
    }
}

fn plain_error_response(status: StatusCode, err: &dyn std::fmt::Display) -> Response {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(format!(
            "An error has occurred during metrics encoding:\n\n{err}"
        )))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverse_exporter_expfmt::{Metric, MetricFamily, Untyped};

    fn family(name: &str) -> MetricFamily {
        MetricFamily {
            name: Some(name.to_string()),
            metric: vec![Metric {
                untyped: Some(Untyped { value: Some(1.0) }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn buffers_are_reused_after_return() {
        let mut buffer = take_buffer();
        buffer.extend_from_slice(b"stale");
        return_buffer(buffer);
        let buffer = take_buffer();
        assert!(buffer.is_empty());
        return_buffer(buffer);
    }

    #[test]
    fn response_carries_exact_content_length() {
        let headers = HeaderMap::new();
        let response = metrics_response(&headers, &[family("a"), family("b")]);
        assert_eq!(response.status(), StatusCode::OK);
        let length: usize = response
            .headers()
            .get(CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(length > 0);
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
    }

    #[test]
    fn gzip_is_applied_when_advertised() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, "gzip, deflate".parse().unwrap());
        let response = metrics_response(&headers, &[family("a")]);
        assert_eq!(
            response.headers().get(CONTENT_ENCODING).unwrap(),
            "gzip"
        );
    }

    #[test]
    fn gzip_detection_requires_exact_token() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, "gzippy".parse().unwrap());
        assert!(!accepts_gzip(&headers));
        headers.insert(ACCEPT_ENCODING, "deflate, gzip;q=0.5".parse().unwrap());
        assert!(accepts_gzip(&headers));
    }
}
