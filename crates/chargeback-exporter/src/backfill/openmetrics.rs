//! OpenMetrics text rendering for bulk import
//!
//! Output is deterministic for a given bucket list, so its digest identifies
//! the block content.

use std::fmt::Write;

use chargeback_common::{bucket_cost_metric, CostBucket, LABEL_NAMES};

const HELP: &str = "Cost accumulated per resource, SKU and time bucket";

/// Render buckets as one gauge family terminated by `# EOF`
pub fn render(prefix: &str, buckets: &[CostBucket]) -> String {
    let name = bucket_cost_metric(prefix);
    let mut out = String::with_capacity(128 + buckets.len() * 128);

    let _ = writeln!(out, "# HELP {name} {HELP}");
    let _ = writeln!(out, "# TYPE {name} gauge");

    for bucket in buckets {
        let values = [
            bucket.key.resource_id.as_str(),
            bucket.key.sku.as_str(),
            bucket.cost_type.as_str(),
            bucket.currency.as_str(),
        ];
        let labels: Vec<String> = LABEL_NAMES
            .iter()
            .zip(values)
            .map(|(label, value)| format!("{label}=\"{}\"", escape_label(value)))
            .collect();

        let _ = writeln!(
            out,
            "{name}{{{}}} {} {}",
            labels.join(","),
            bucket.cost.normalize(),
            seconds(bucket.key.bucket_start)
        );
    }

    out.push_str("# EOF\n");
    out
}

fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// OpenMetrics timestamps are seconds
fn seconds(ts_ms: i64) -> String {
    let secs = ts_ms.div_euclid(1000);
    let millis = ts_ms.rem_euclid(1000);
    if millis == 0 {
        secs.to_string()
    } else {
        format!("{secs}.{millis:03}")
    }
}
