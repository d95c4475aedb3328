//! Decoder for the Prometheus text exposition format (version 0.0.4).
//!
//! Samples are grouped into families by their `# TYPE` declaration. Label
//! pairs keep the order in which they appear on the sample line; the
//! histogram `le` and summary `quantile` labels are lifted out into buckets
//! and quantiles.

use std::collections::HashMap;

use crate::error::{HarnessError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "counter" => Some(Self::Counter),
            "gauge" => Some(Self::Gauge),
            "histogram" => Some(Self::Histogram),
            "summary" => Some(Self::Summary),
            "untyped" => Some(Self::Untyped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: Option<String>,
    pub kind: MetricKind,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub labels: Vec<(String, String)>,
    pub value: MetricValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Untyped(f64),
    Histogram(Histogram),
    Summary(Summary),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Histogram {
    pub buckets: Vec<Bucket>,
    pub sample_count: u64,
    pub sample_sum: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub quantiles: Vec<(f64, f64)>,
    pub sample_count: u64,
    pub sample_sum: f64,
}

/// Parse a full exposition body into families, in order of first appearance.
pub fn parse(text: &str) -> Result<Vec<MetricFamily>> {
    let mut parser = Parser::default();
    for (index, line) in text.lines().enumerate() {
        parser
            .line(line)
            .map_err(|message| HarnessError::MetricsParse {
                line: index + 1,
                message,
            })?;
    }
    Ok(parser.families)
}

#[derive(Default)]
struct Parser {
    families: Vec<MetricFamily>,
    by_name: HashMap<String, usize>,
    declared: HashMap<String, MetricKind>,
}

struct Sample {
    name: String,
    labels: Vec<(String, String)>,
    value: f64,
}

type LineResult = std::result::Result<(), String>;

impl Parser {
    fn line(&mut self, line: &str) -> LineResult {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        if let Some(comment) = line.strip_prefix('#') {
            return self.comment(comment.trim_start());
        }

        let sample = parse_sample(line)?;
        self.sample(sample)
    }

    fn comment(&mut self, comment: &str) -> LineResult {
        let mut parts = comment.splitn(3, char::is_whitespace);
        let keyword = parts.next().unwrap_or_default();
        match keyword {
            "HELP" => {
                let name = parts.next().ok_or("HELP without metric name")?;
                let help = unescape(parts.next().unwrap_or_default().trim_start(), false)?;
                let index = self.family(name, MetricKind::Untyped);
                if self.families[index].help.is_some() {
                    return Err(format!("second HELP line for metric {}", name));
                }
                self.families[index].help = Some(help);
                Ok(())
            }
            "TYPE" => {
                let name = parts.next().ok_or("TYPE without metric name")?;
                let kind_str = parts.next().unwrap_or_default().trim();
                let kind = MetricKind::parse(kind_str)
                    .ok_or_else(|| format!("unknown metric type {:?}", kind_str))?;
                if self.declared.insert(name.to_string(), kind).is_some() {
                    return Err(format!("second TYPE line for metric {}", name));
                }
                let index = self.family(name, kind);
                let family = &mut self.families[index];
                if !family.metrics.is_empty() {
                    return Err(format!("TYPE line for {} after its samples", name));
                }
                family.kind = kind;
                Ok(())
            }
            // Any other comment is ignored.
            _ => Ok(()),
        }
    }

    fn family(&mut self, name: &str, kind: MetricKind) -> usize {
        if let Some(&index) = self.by_name.get(name) {
            return index;
        }
        self.families.push(MetricFamily {
            name: name.to_string(),
            help: None,
            kind,
            metrics: Vec::new(),
        });
        let index = self.families.len() - 1;
        self.by_name.insert(name.to_string(), index);
        index
    }

    /// Family a sample belongs to, accounting for histogram and summary suffixes.
    fn owner(&self, sample_name: &str) -> (String, Suffix) {
        for (suffix, kind) in [
            ("_bucket", Suffix::Bucket),
            ("_count", Suffix::Count),
            ("_sum", Suffix::Sum),
        ] {
            if let Some(base) = sample_name.strip_suffix(suffix) {
                match self.declared.get(base) {
                    Some(MetricKind::Histogram) => return (base.to_string(), kind),
                    Some(MetricKind::Summary) if kind != Suffix::Bucket => {
                        return (base.to_string(), kind)
                    }
                    _ => {}
                }
            }
        }
        (sample_name.to_string(), Suffix::None)
    }

    fn sample(&mut self, sample: Sample) -> LineResult {
        let (family_name, suffix) = self.owner(&sample.name);
        let kind = self
            .declared
            .get(&family_name)
            .copied()
            .unwrap_or(MetricKind::Untyped);
        let index = self.family(&family_name, kind);
        let family = &mut self.families[index];

        match kind {
            MetricKind::Counter | MetricKind::Gauge | MetricKind::Untyped => {
                let value = match kind {
                    MetricKind::Counter => MetricValue::Counter(sample.value),
                    MetricKind::Gauge => MetricValue::Gauge(sample.value),
                    _ => MetricValue::Untyped(sample.value),
                };
                family.metrics.push(Metric {
                    labels: sample.labels,
                    value,
                });
            }
            MetricKind::Histogram => {
                let (labels, le) = take_label(sample.labels, "le");
                let histogram = histogram_for(family, labels)?;
                match suffix {
                    Suffix::Bucket => {
                        let le = le.ok_or("histogram bucket without le label")?;
                        histogram.buckets.push(Bucket {
                            upper_bound: parse_value(&le)?,
                            cumulative_count: sample.value as u64,
                        });
                    }
                    Suffix::Count => histogram.sample_count = sample.value as u64,
                    Suffix::Sum => histogram.sample_sum = sample.value,
                    Suffix::None => {
                        return Err(format!(
                            "sample {} does not belong to histogram {}",
                            sample.name, family_name
                        ))
                    }
                }
            }
            MetricKind::Summary => {
                let (labels, quantile) = take_label(sample.labels, "quantile");
                let summary = summary_for(family, labels)?;
                match suffix {
                    Suffix::Count => summary.sample_count = sample.value as u64,
                    Suffix::Sum => summary.sample_sum = sample.value,
                    _ => {
                        let quantile = quantile.ok_or("summary sample without quantile label")?;
                        summary.quantiles.push((parse_value(&quantile)?, sample.value));
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Suffix {
    None,
    Bucket,
    Count,
    Sum,
}

fn take_label(
    labels: Vec<(String, String)>,
    name: &str,
) -> (Vec<(String, String)>, Option<String>) {
    let mut taken = None;
    let rest = labels
        .into_iter()
        .filter_map(|(k, v)| {
            if k == name {
                taken = Some(v);
                None
            } else {
                Some((k, v))
            }
        })
        .collect();
    (rest, taken)
}

fn histogram_for(
    family: &mut MetricFamily,
    labels: Vec<(String, String)>,
) -> std::result::Result<&mut Histogram, String> {
    let position = family.metrics.iter().position(|m| {
        m.labels == labels && matches!(m.value, MetricValue::Histogram(_))
    });
    let index = position.unwrap_or_else(|| {
        family.metrics.push(Metric {
            labels,
            value: MetricValue::Histogram(Histogram::default()),
        });
        family.metrics.len() - 1
    });
    match &mut family.metrics[index].value {
        MetricValue::Histogram(h) => Ok(h),
        _ => Err(format!("{} mixes histogram and other samples", family.name)),
    }
}

fn summary_for(
    family: &mut MetricFamily,
    labels: Vec<(String, String)>,
) -> std::result::Result<&mut Summary, String> {
    let position = family
        .metrics
        .iter()
        .position(|m| m.labels == labels && matches!(m.value, MetricValue::Summary(_)));
    let index = position.unwrap_or_else(|| {
        family.metrics.push(Metric {
            labels,
            value: MetricValue::Summary(Summary::default()),
        });
        family.metrics.len() - 1
    });
    match &mut family.metrics[index].value {
        MetricValue::Summary(s) => Ok(s),
        _ => Err(format!("{} mixes summary and other samples", family.name)),
    }
}

fn parse_sample(line: &str) -> std::result::Result<Sample, String> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if !is_valid_name(name) {
        return Err(format!("invalid metric name {:?}", name));
    }

    let mut rest = &line[name_end..];
    let mut labels = Vec::new();
    if let Some(after_brace) = rest.strip_prefix('{') {
        let (parsed, remainder) = parse_labels(after_brace)?;
        labels = parsed;
        rest = remainder;
    }

    let mut fields = rest.split_whitespace();
    let value = fields
        .next()
        .ok_or_else(|| format!("missing value for {}", name))?;
    let value = parse_value(value)?;

    // Optional timestamp.
    if let Some(ts) = fields.next() {
        ts.parse::<i64>()
            .map_err(|_| format!("invalid timestamp {:?}", ts))?;
    }
    if let Some(extra) = fields.next() {
        return Err(format!("unexpected trailing text {:?}", extra));
    }

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
    })
}

/// Parse `name="value",...}` and return the labels plus the text after `}`.
fn parse_labels(input: &str) -> std::result::Result<(Vec<(String, String)>, &str), String> {
    let mut labels = Vec::new();
    let mut rest = input.trim_start();

    loop {
        if let Some(after) = rest.strip_prefix('}') {
            return Ok((labels, after));
        }

        let eq = rest
            .find('=')
            .ok_or_else(|| format!("label without value in {:?}", input))?;
        let label_name = rest[..eq].trim();
        if !is_valid_label_name(label_name) {
            return Err(format!("invalid label name {:?}", label_name));
        }
        if labels.iter().any(|(k, _)| k == label_name) {
            return Err(format!("duplicate label {:?}", label_name));
        }

        let after_eq = rest[eq + 1..].trim_start();
        let quoted = after_eq
            .strip_prefix('"')
            .ok_or_else(|| format!("label {} value is not quoted", label_name))?;
        let (value, after_value) = read_quoted(quoted)?;
        labels.push((label_name.to_string(), value));

        rest = after_value.trim_start();
        if let Some(after_comma) = rest.strip_prefix(',') {
            rest = after_comma.trim_start();
        } else if !rest.starts_with('}') {
            return Err(format!("expected ',' or '}}' after label {}", label_name));
        }
    }
}

/// Read up to the closing quote, returning the unescaped value and the rest.
fn read_quoted(input: &str) -> std::result::Result<(String, &str), String> {
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => return Ok((unescape(&input[..i], true)?, &input[i + 1..])),
            _ => {}
        }
    }
    Err("unterminated label value".to_string())
}

fn unescape(s: &str, allow_quote: bool) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('"') if allow_quote => out.push('"'),
            Some(other) => return Err(format!("invalid escape sequence \\{}", other)),
            None => return Err("trailing backslash".to_string()),
        }
    }
    Ok(out)
}

fn parse_value(s: &str) -> std::result::Result<f64, String> {
    match s {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => s
            .parse::<f64>()
            .map_err(|_| format!("invalid value {:?}", s)),
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
