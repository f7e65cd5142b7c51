//! Wire format selection and content negotiation.

/// Media type parameters identifying the protobuf exposition encoding.
const PROTOBUF_MEDIA_TYPE: &str = "application/vnd.google.protobuf";
const PROTOBUF_PROTO: &str = "io.prometheus.client.MetricFamily";
const PROTOBUF_ENCODING: &str = "delimited";

/// One of the two exposition wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Text exposition format, version 0.0.4.
    Text,
    /// Length-delimited `io.prometheus.client.MetricFamily` protobuf.
    ProtoDelim,
}

impl Format {
    /// The `Content-Type` value advertised for responses in this format.
    pub fn content_type(&self) -> &'static str {
        match self {
            Format::Text => "text/plain; version=0.0.4; charset=utf-8",
            Format::ProtoDelim => {
                "application/vnd.google.protobuf; \
                 proto=io.prometheus.client.MetricFamily; encoding=delimited"
            }
        }
    }
}

/// Chooses the response format from an inbound `Accept` header.
///
/// The protobuf format is selected only when a clause names the protobuf
/// media type with the delimited MetricFamily parameters; every other header
/// (including a missing one) negotiates to text.
pub fn negotiate(accept: Option<&str>) -> Format {
    let Some(accept) = accept else {
        return Format::Text;
    };
    for clause in accept.split(',') {
        if clause_is_delimited_protobuf(clause) {
            return Format::ProtoDelim;
        }
    }
    Format::Text
}

/// Classifies an upstream response body from its `Content-Type` header.
pub fn response_format(content_type: Option<&str>) -> Format {
    match content_type {
        Some(value) if clause_is_delimited_protobuf(value) => Format::ProtoDelim,
        _ => Format::Text,
    }
}

fn clause_is_delimited_protobuf(clause: &str) -> bool {
    let mut parts = clause.split(';').map(str::trim);
    let Some(media_type) = parts.next() else {
        return false;
    };
    if !media_type.eq_ignore_ascii_case(PROTOBUF_MEDIA_TYPE) {
        return false;
    }
    let mut proto = false;
    let mut encoding = false;
    for param in parts {
        match param.split_once('=') {
            Some((key, value)) if key.trim().eq_ignore_ascii_case("proto") => {
                proto = value.trim().trim_matches('"') == PROTOBUF_PROTO;
            }
            Some((key, value)) if key.trim().eq_ignore_ascii_case("encoding") => {
                encoding = value.trim().trim_matches('"') == PROTOBUF_ENCODING;
            }
            _ => {}
        }
    }
    proto && encoding
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROMETHEUS_ACCEPT: &str = "application/vnd.google.protobuf;\
         proto=io.prometheus.client.MetricFamily;encoding=delimited;q=0.7,\
         text/plain;version=0.0.4;q=0.3";

    #[test]
    fn negotiates_protobuf_for_prometheus_accept() {
        assert_eq!(negotiate(Some(PROMETHEUS_ACCEPT)), Format::ProtoDelim);
    }

    #[test]
    fn negotiates_text_by_default() {
        assert_eq!(negotiate(None), Format::Text);
        assert_eq!(negotiate(Some("text/plain")), Format::Text);
        assert_eq!(negotiate(Some("*/*")), Format::Text);
    }

    #[test]
    fn protobuf_needs_both_parameters() {
        assert_eq!(
            negotiate(Some("application/vnd.google.protobuf;encoding=delimited")),
            Format::Text
        );
        assert_eq!(
            negotiate(Some(
                "application/vnd.google.protobuf;proto=io.prometheus.client.MetricFamily"
            )),
            Format::Text
        );
    }

    #[test]
    fn classifies_response_content_type() {
        assert_eq!(
            response_format(Some(Format::ProtoDelim.content_type())),
            Format::ProtoDelim
        );
        assert_eq!(
            response_format(Some("text/plain; version=0.0.4")),
            Format::Text
        );
        assert_eq!(response_format(None), Format::Text);
    }
}
