//! Prometheus exposition format support.
//!
//! This crate provides the metric family data model shared by every source
//! adapter, plus codecs for the two wire formats a Prometheus endpoint can
//! speak: the text format (version 0.0.4) and the length-delimited protobuf
//! encoding of `io.prometheus.client.MetricFamily`.

pub mod format;
pub mod model;
pub mod text;
pub mod wire;

pub use format::{negotiate, response_format, Format};
pub use model::{
    Bucket, Counter, Gauge, Histogram, LabelPair, Metric, MetricFamily, MetricType, Quantile,
    Summary, Untyped,
};

use thiserror::Error;

/// Error raised while decoding metric families from a byte stream.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("text format error on line {line}: {reason}")]
    Text { line: usize, reason: String },

    #[error("protobuf decoding failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Decodes all metric families from `data` using the given wire format,
/// stopping at end of input or on the first malformed family.
pub fn decode(data: &[u8], format: Format) -> Result<Vec<MetricFamily>, DecodeError> {
    match format {
        Format::Text => text::parse(data),
        Format::ProtoDelim => wire::parse(data),
    }
}

/// Encodes one metric family onto `writer` using the given wire format.
pub fn encode(
    writer: &mut dyn std::io::Write,
    format: Format,
    family: &MetricFamily,
) -> std::io::Result<()> {
    match format {
        Format::Text => text::render(writer, family),
        Format::ProtoDelim => wire::render(writer, family),
    }
}
