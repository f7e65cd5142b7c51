//! Length-delimited protobuf codec for `io.prometheus.client.MetricFamily`.

use bytes::Buf;
use prost::Message;

use crate::model::MetricFamily;
use crate::DecodeError;

/// Decodes every length-delimited family from `data`.
pub fn parse(data: &[u8]) -> Result<Vec<MetricFamily>, DecodeError> {
    let mut buf = data;
    let mut families = Vec::new();
    while buf.has_remaining() {
        families.push(MetricFamily::decode_length_delimited(&mut buf)?);
    }
    Ok(families)
}

/// Writes one family with a varint length prefix.
pub fn render(writer: &mut dyn std::io::Write, family: &MetricFamily) -> std::io::Result<()> {
    let mut encoded = Vec::with_capacity(family.encoded_len() + 4);
    family
        .encode_length_delimited(&mut encoded)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
    writer.write_all(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Counter, LabelPair, Metric, MetricType};

    fn sample_family(name: &str, value: f64) -> MetricFamily {
        MetricFamily {
            name: Some(name.to_string()),
            help: Some("A counter.".to_string()),
            r#type: Some(MetricType::Counter as i32),
            metric: vec![Metric {
                label: vec![LabelPair::new("job", "node")],
                counter: Some(Counter { value: Some(value) }),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn delimited_round_trip_preserves_families() {
        let families = vec![sample_family("a_total", 1.0), sample_family("b_total", 2.5)];
        let mut encoded = Vec::new();
        for family in &families {
            render(&mut encoded, family).unwrap();
        }

        let decoded = parse(&encoded).unwrap();
        assert_eq!(decoded, families);
    }

    #[test]
    fn empty_input_decodes_to_nothing() {
        assert!(parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut encoded = Vec::new();
        render(&mut encoded, &sample_family("a_total", 1.0)).unwrap();
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(parse(&encoded), Err(DecodeError::Protobuf(_))));
    }
}
