//! The `io.prometheus.client` metric family model.
//!
//! Message structs are written out by hand rather than generated, so the
//! crate builds without protoc. Field tags follow the canonical
//! `metrics.proto`; proto2 optional fields map to `Option`.

/// The type of the samples within a metric family.
///
/// .proto:
/// ```protobuf
/// enum MetricType {
///   COUNTER    = 0;
///   GAUGE      = 1;
///   SUMMARY    = 2;
///   UNTYPED    = 3;
///   HISTOGRAM  = 4;
/// }
/// ```
#[derive(prost::Enumeration, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MetricType {
    Counter = 0,
    Gauge = 1,
    Summary = 2,
    Untyped = 3,
    Histogram = 4,
}

impl MetricType {
    /// The keyword used for this type on `# TYPE` lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Summary => "summary",
            MetricType::Untyped => "untyped",
            MetricType::Histogram => "histogram",
        }
    }

    /// Parses a `# TYPE` keyword.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "counter" => Some(MetricType::Counter),
            "gauge" => Some(MetricType::Gauge),
            "summary" => Some(MetricType::Summary),
            "untyped" => Some(MetricType::Untyped),
            "histogram" => Some(MetricType::Histogram),
            _ => None,
        }
    }
}

/// A single name/value label.
#[derive(prost::Message, Clone, PartialEq)]
pub struct LabelPair {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub value: Option<String>,
}

impl LabelPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: Some(name.into()), value: Some(value.into()) }
    }
}

#[derive(prost::Message, Clone, PartialEq)]
pub struct Gauge {
    #[prost(double, optional, tag = "1")]
    pub value: Option<f64>,
}

#[derive(prost::Message, Clone, PartialEq)]
pub struct Counter {
    #[prost(double, optional, tag = "1")]
    pub value: Option<f64>,
}

#[derive(prost::Message, Clone, PartialEq)]
pub struct Quantile {
    #[prost(double, optional, tag = "1")]
    pub quantile: Option<f64>,
    #[prost(double, optional, tag = "2")]
    pub value: Option<f64>,
}

#[derive(prost::Message, Clone, PartialEq)]
pub struct Summary {
    #[prost(uint64, optional, tag = "1")]
    pub sample_count: Option<u64>,
    #[prost(double, optional, tag = "2")]
    pub sample_sum: Option<f64>,
    #[prost(message, repeated, tag = "3")]
    pub quantile: Vec<Quantile>,
}

#[derive(prost::Message, Clone, PartialEq)]
pub struct Untyped {
    #[prost(double, optional, tag = "1")]
    pub value: Option<f64>,
}

/// One cumulative histogram bucket.
#[derive(prost::Message, Clone, PartialEq)]
pub struct Bucket {
    #[prost(uint64, optional, tag = "1")]
    pub cumulative_count: Option<u64>,
    #[prost(double, optional, tag = "2")]
    pub upper_bound: Option<f64>,
}

#[derive(prost::Message, Clone, PartialEq)]
pub struct Histogram {
    #[prost(uint64, optional, tag = "1")]
    pub sample_count: Option<u64>,
    #[prost(double, optional, tag = "2")]
    pub sample_sum: Option<f64>,
    #[prost(message, repeated, tag = "3")]
    pub bucket: Vec<Bucket>,
}

/// One sample: a label set plus exactly one of the per-type value fields.
#[derive(prost::Message, Clone, PartialEq)]
pub struct Metric {
    #[prost(message, repeated, tag = "1")]
    pub label: Vec<LabelPair>,
    #[prost(message, optional, tag = "2")]
    pub gauge: Option<Gauge>,
    #[prost(message, optional, tag = "3")]
    pub counter: Option<Counter>,
    #[prost(message, optional, tag = "4")]
    pub summary: Option<Summary>,
    #[prost(message, optional, tag = "5")]
    pub untyped: Option<Untyped>,
    #[prost(int64, optional, tag = "6")]
    pub timestamp_ms: Option<i64>,
    #[prost(message, optional, tag = "7")]
    pub histogram: Option<Histogram>,
}

/// A named group of samples sharing a type and help text.
#[derive(prost::Message, Clone, PartialEq)]
pub struct MetricFamily {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub help: Option<String>,
    #[prost(enumeration = "MetricType", optional, tag = "3")]
    pub r#type: Option<i32>,
    #[prost(message, repeated, tag = "4")]
    pub metric: Vec<Metric>,
}

impl MetricFamily {
    /// The declared metric type, defaulting to untyped.
    pub fn metric_type(&self) -> MetricType {
        self.r#type
            .and_then(|raw| MetricType::try_from(raw).ok())
            .unwrap_or(MetricType::Untyped)
    }
}
