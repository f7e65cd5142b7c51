//! Text exposition format (version 0.0.4): line parser and renderer.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::model::{
    Bucket, Counter, Gauge, Histogram, LabelPair, Metric, MetricFamily, MetricType, Quantile,
    Summary, Untyped,
};
use crate::DecodeError;

/// Parses a full text exposition payload into metric families, preserving
/// the order of first appearance.
pub fn parse(data: &[u8]) -> Result<Vec<MetricFamily>, DecodeError> {
    let text = std::str::from_utf8(data).map_err(|err| DecodeError::Text {
        line: 0,
        reason: format!("payload is not valid UTF-8: {err}"),
    })?;

    let mut assembler = Assembler::default();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let result = if let Some(comment) = line.strip_prefix('#') {
            assembler.comment_line(comment)
        } else {
            assembler.sample_line(line)
        };
        if let Err(reason) = result {
            return Err(DecodeError::Text { line: line_no, reason });
        }
    }
    Ok(assembler.families)
}

#[derive(Default)]
struct Assembler {
    families: Vec<MetricFamily>,
    by_name: HashMap<String, usize>,
    // For summary and histogram families: residual label set -> metric index.
    grouped: HashMap<usize, HashMap<String, usize>>,
}

impl Assembler {
    fn family_index(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.by_name.get(name) {
            return idx;
        }
        let idx = self.families.len();
        self.families.push(MetricFamily {
            name: Some(name.to_string()),
            ..Default::default()
        });
        self.by_name.insert(name.to_string(), idx);
        idx
    }

    fn comment_line(&mut self, comment: &str) -> Result<(), String> {
        let body = comment.trim_start();
        let Some((keyword, tail)) = split_token(body) else {
            return Ok(());
        };
        match keyword {
            "HELP" => {
                let (name, doc) = match split_token(tail) {
                    Some((name, rest)) => (name, rest),
                    None => (tail, ""),
                };
                if name.is_empty() {
                    return Err("HELP line is missing a metric name".to_string());
                }
                let idx = self.family_index(name);
                self.families[idx].help = Some(unescape_help(doc));
                Ok(())
            }
            "TYPE" => {
                let Some((name, keyword)) = split_token(tail) else {
                    return Err("TYPE line is missing a metric name".to_string());
                };
                let keyword = keyword.trim();
                let ty = MetricType::from_keyword(keyword)
                    .ok_or_else(|| format!("unknown metric type {keyword:?}"))?;
                let idx = self.family_index(name);
                let family = &mut self.families[idx];
                match family.r#type {
                    // A repeated declaration of the same type is tolerated:
                    // aggregated payloads can carry one block per upstream.
                    Some(existing) if existing == ty as i32 => {}
                    Some(_) => {
                        return Err(format!("conflicting TYPE line for metric {name:?}"));
                    }
                    None => family.r#type = Some(ty as i32),
                }
                Ok(())
            }
            // Any other comment is ignored.
            _ => Ok(()),
        }
    }

    fn sample_line(&mut self, line: &str) -> Result<(), String> {
        let (name, labels, value, timestamp_ms) = parse_sample(line)?;

        // Summary and histogram child series fold back into their parent
        // family, addressed by the label set minus the series label.
        if let Some(base) = name.strip_suffix("_sum") {
            if let Some(idx) = self.aggregated_family(base) {
                let ty = self.families[idx].metric_type();
                let metric = self.grouped_metric(idx, labels);
                match ty {
                    MetricType::Summary => {
                        metric.summary.get_or_insert_with(Summary::default).sample_sum =
                            Some(value);
                    }
                    _ => {
                        metric.histogram.get_or_insert_with(Histogram::default).sample_sum =
                            Some(value);
                    }
                }
                set_timestamp(metric, timestamp_ms);
                return Ok(());
            }
        }
        if let Some(base) = name.strip_suffix("_count") {
            if let Some(idx) = self.aggregated_family(base) {
                let ty = self.families[idx].metric_type();
                let metric = self.grouped_metric(idx, labels);
                match ty {
                    MetricType::Summary => {
                        metric.summary.get_or_insert_with(Summary::default).sample_count =
                            Some(value as u64);
                    }
                    _ => {
                        metric.histogram.get_or_insert_with(Histogram::default).sample_count =
                            Some(value as u64);
                    }
                }
                set_timestamp(metric, timestamp_ms);
                return Ok(());
            }
        }
        if let Some(base) = name.strip_suffix("_bucket") {
            if let Some(idx) = self.histogram_family(base) {
                return self.bucket_sample(idx, labels, value, timestamp_ms);
            }
        }

        match self.by_name.get(&name).copied() {
            Some(idx) if self.families[idx].metric_type() == MetricType::Summary => {
                let (quantile, labels) = take_label(labels, "quantile")
                    .ok_or_else(|| format!("summary series {name:?} without quantile label"))?;
                let quantile = parse_value(&quantile)
                    .ok_or_else(|| format!("invalid quantile value {quantile:?}"))?;
                let metric = self.grouped_metric(idx, labels);
                metric
                    .summary
                    .get_or_insert_with(Summary::default)
                    .quantile
                    .push(Quantile { quantile: Some(quantile), value: Some(value) });
                set_timestamp(metric, timestamp_ms);
                Ok(())
            }
            Some(idx) if self.families[idx].metric_type() == MetricType::Histogram => {
                self.bucket_sample(idx, labels, value, timestamp_ms)
            }
            _ => {
                let idx = self.family_index(&name);
                let family = &mut self.families[idx];
                if family.r#type.is_none() {
                    family.r#type = Some(MetricType::Untyped as i32);
                }
                let mut metric = Metric {
                    label: labels,
                    timestamp_ms,
                    ..Default::default()
                };
                match family.metric_type() {
                    MetricType::Counter => metric.counter = Some(Counter { value: Some(value) }),
                    MetricType::Gauge => metric.gauge = Some(Gauge { value: Some(value) }),
                    _ => metric.untyped = Some(Untyped { value: Some(value) }),
                }
                family.metric.push(metric);
                Ok(())
            }
        }
    }

    fn bucket_sample(
        &mut self,
        idx: usize,
        labels: Vec<LabelPair>,
        value: f64,
        timestamp_ms: Option<i64>,
    ) -> Result<(), String> {
        let (le, labels) = take_label(labels, "le")
            .ok_or_else(|| "histogram bucket without le label".to_string())?;
        let upper_bound =
            parse_value(&le).ok_or_else(|| format!("invalid le bound {le:?}"))?;
        let metric = self.grouped_metric(idx, labels);
        metric
            .histogram
            .get_or_insert_with(Histogram::default)
            .bucket
            .push(Bucket {
                cumulative_count: Some(value as u64),
                upper_bound: Some(upper_bound),
            });
        set_timestamp(metric, timestamp_ms);
        Ok(())
    }

    fn aggregated_family(&self, base: &str) -> Option<usize> {
        let idx = *self.by_name.get(base)?;
        matches!(
            self.families[idx].metric_type(),
            MetricType::Summary | MetricType::Histogram
        )
        .then_some(idx)
    }

    fn histogram_family(&self, base: &str) -> Option<usize> {
        let idx = *self.by_name.get(base)?;
        (self.families[idx].metric_type() == MetricType::Histogram).then_some(idx)
    }

    fn grouped_metric(&mut self, idx: usize, labels: Vec<LabelPair>) -> &mut Metric {
        let key = label_key(&labels);
        let groups = self.grouped.entry(idx).or_default();
        let family = &mut self.families[idx];
        let metric_idx = *groups.entry(key).or_insert_with(|| {
            family.metric.push(Metric { label: labels, ..Default::default() });
            family.metric.len() - 1
        });
        &mut family.metric[metric_idx]
    }
}

fn set_timestamp(metric: &mut Metric, timestamp_ms: Option<i64>) {
    if timestamp_ms.is_some() {
        metric.timestamp_ms = timestamp_ms;
    }
}

/// Canonical key for a label set: pairs sorted by name.
fn label_key(labels: &[LabelPair]) -> String {
    let mut pairs: Vec<(&str, &str)> = labels
        .iter()
        .map(|pair| (pair.name.as_deref().unwrap_or(""), pair.value.as_deref().unwrap_or("")))
        .collect();
    pairs.sort_unstable();
    let mut key = String::new();
    for (name, value) in pairs {
        key.push_str(name);
        key.push('\u{1}');
        key.push_str(value);
        key.push('\u{2}');
    }
    key
}

/// Removes the named label from the set, returning its value.
fn take_label(mut labels: Vec<LabelPair>, name: &str) -> Option<(String, Vec<LabelPair>)> {
    let pos = labels.iter().position(|pair| pair.name.as_deref() == Some(name))?;
    let value = labels.remove(pos).value.unwrap_or_default();
    Some((value, labels))
}

fn split_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.find(|c: char| c == ' ' || c == '\t') {
        Some(pos) => Some((&input[..pos], input[pos + 1..].trim_start_matches([' ', '\t']))),
        None => Some((input, "")),
    }
}

fn parse_value(token: &str) -> Option<f64> {
    token.parse::<f64>().ok()
}

fn parse_sample(line: &str) -> Result<(String, Vec<LabelPair>, f64, Option<i64>), String> {
    let mut cursor = Cursor::new(line);

    let name = cursor.eat_while(is_metric_name_char);
    if name.is_empty() || !name.starts_with(is_metric_name_start) {
        return Err(format!("invalid metric name at {:?}", cursor.rest()));
    }
    cursor.skip_spaces();

    let mut labels = Vec::new();
    if cursor.peek() == Some('{') {
        cursor.bump();
        loop {
            cursor.skip_spaces();
            if cursor.peek() == Some('}') {
                cursor.bump();
                break;
            }
            let label_name = cursor.eat_while(is_label_name_char);
            if label_name.is_empty() || !label_name.starts_with(is_label_name_start) {
                return Err(format!("invalid label name at {:?}", cursor.rest()));
            }
            cursor.skip_spaces();
            cursor.expect('=')?;
            cursor.skip_spaces();
            let value = cursor.quoted_string()?;
            labels.push(LabelPair::new(label_name, value));
            cursor.skip_spaces();
            match cursor.peek() {
                Some(',') => {
                    cursor.bump();
                }
                Some('}') => {
                    cursor.bump();
                    break;
                }
                _ => return Err(format!("expected ',' or '}}' at {:?}", cursor.rest())),
            }
        }
        cursor.skip_spaces();
    }

    let value_token = cursor.eat_while(|c| c != ' ' && c != '\t');
    let value = parse_value(value_token)
        .ok_or_else(|| format!("invalid sample value {value_token:?}"))?;

    cursor.skip_spaces();
    let timestamp_token = cursor.rest().trim();
    let timestamp_ms = if timestamp_token.is_empty() {
        None
    } else {
        Some(
            timestamp_token
                .parse::<i64>()
                .map_err(|_| format!("invalid timestamp {timestamp_token:?}"))?,
        )
    };

    Ok((name.to_string(), labels, value, timestamp_ms))
}

fn is_metric_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == ':'
}

fn is_metric_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

fn is_label_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_label_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.bump();
        }
        &self.input[start..self.pos]
    }

    fn skip_spaces(&mut self) {
        self.eat_while(|c| c == ' ' || c == '\t');
    }

    fn expect(&mut self, expected: char) -> Result<(), String> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(format!("expected {expected:?} at {:?}", self.rest())),
        }
    }

    /// Reads a double-quoted label value, resolving `\\`, `\"` and `\n`.
    fn quoted_string(&mut self) -> Result<String, String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('\\') => out.push('\\'),
                    Some('"') => out.push('"'),
                    other => {
                        return Err(format!("invalid escape sequence \\{:?}", other));
                    }
                },
                Some(c) => out.push(c),
                None => return Err("unterminated label value".to_string()),
            }
        }
    }
}

/// Renders one metric family in text format.
pub fn render(writer: &mut dyn Write, family: &MetricFamily) -> io::Result<()> {
    let name = family.name();
    if let Some(help) = &family.help {
        writeln!(writer, "# HELP {} {}", name, escape_help(help))?;
    }
    let ty = family.metric_type();
    writeln!(writer, "# TYPE {} {}", name, ty.as_str())?;

    for metric in &family.metric {
        match ty {
            MetricType::Counter => {
                let value = metric.counter.as_ref().and_then(|c| c.value).unwrap_or(0.0);
                write_sample(writer, name, "", &metric.label, None, &fmt_value(value), metric)?;
            }
            MetricType::Gauge => {
                let value = metric.gauge.as_ref().and_then(|g| g.value).unwrap_or(0.0);
                write_sample(writer, name, "", &metric.label, None, &fmt_value(value), metric)?;
            }
            MetricType::Untyped => {
                let value = metric.untyped.as_ref().and_then(|u| u.value).unwrap_or(0.0);
                write_sample(writer, name, "", &metric.label, None, &fmt_value(value), metric)?;
            }
            MetricType::Summary => {
                let summary = metric.summary.clone().unwrap_or_default();
                for quantile in &summary.quantile {
                    write_sample(
                        writer,
                        name,
                        "",
                        &metric.label,
                        Some(("quantile", fmt_value(quantile.quantile.unwrap_or(0.0)))),
                        &fmt_value(quantile.value.unwrap_or(0.0)),
                        metric,
                    )?;
                }
                write_sample(
                    writer,
                    name,
                    "_sum",
                    &metric.label,
                    None,
                    &fmt_value(summary.sample_sum.unwrap_or(0.0)),
                    metric,
                )?;
                write_sample(
                    writer,
                    name,
                    "_count",
                    &metric.label,
                    None,
                    &summary.sample_count.unwrap_or(0).to_string(),
                    metric,
                )?;
            }
            MetricType::Histogram => {
                let histogram = metric.histogram.clone().unwrap_or_default();
                let mut saw_infinity = false;
                for bucket in &histogram.bucket {
                    let bound = bucket.upper_bound.unwrap_or(0.0);
                    if bound == f64::INFINITY {
                        saw_infinity = true;
                    }
                    write_sample(
                        writer,
                        name,
                        "_bucket",
                        &metric.label,
                        Some(("le", fmt_value(bound))),
                        &bucket.cumulative_count.unwrap_or(0).to_string(),
                        metric,
                    )?;
                }
                if !saw_infinity {
                    write_sample(
                        writer,
                        name,
                        "_bucket",
                        &metric.label,
                        Some(("le", "+Inf".to_string())),
                        &histogram.sample_count.unwrap_or(0).to_string(),
                        metric,
                    )?;
                }
                write_sample(
                    writer,
                    name,
                    "_sum",
                    &metric.label,
                    None,
                    &fmt_value(histogram.sample_sum.unwrap_or(0.0)),
                    metric,
                )?;
                write_sample(
                    writer,
                    name,
                    "_count",
                    &metric.label,
                    None,
                    &histogram.sample_count.unwrap_or(0).to_string(),
                    metric,
                )?;
            }
        }
    }
    Ok(())
}

fn write_sample(
    writer: &mut dyn Write,
    name: &str,
    suffix: &str,
    labels: &[LabelPair],
    extra_label: Option<(&str, String)>,
    value: &str,
    metric: &Metric,
) -> io::Result<()> {
    write!(writer, "{name}{suffix}")?;
    if !labels.is_empty() || extra_label.is_some() {
        writer.write_all(b"{")?;
        let mut first = true;
        for pair in labels {
            if !first {
                writer.write_all(b",")?;
            }
            first = false;
            write!(
                writer,
                "{}=\"{}\"",
                pair.name.as_deref().unwrap_or(""),
                escape_label_value(pair.value.as_deref().unwrap_or(""))
            )?;
        }
        if let Some((extra_name, extra_value)) = extra_label {
            if !first {
                writer.write_all(b",")?;
            }
            write!(writer, "{extra_name}=\"{}\"", escape_label_value(&extra_value))?;
        }
        writer.write_all(b"}")?;
    }
    write!(writer, " {value}")?;
    if let Some(ts) = metric.timestamp_ms {
        write!(writer, " {ts}")?;
    }
    writer.write_all(b"\n")
}

fn fmt_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{value}")
    }
}

fn escape_help(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_help(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
