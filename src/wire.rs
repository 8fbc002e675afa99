//! Coverage wire format
//!
//! Serializes snapshot and delta maps for the web boundary:
//!
//! ```json
//! { "com/acme/Widget.java": { "12": 3, "14": 1 } }
//! ```
//!
//! Zero counts are dropped, and a source with no remaining lines is dropped
//! entirely. Sources and lines are emitted in sorted order.

use crate::registry::SourceCounts;
use serde_json::{Map, Value};

/// JSON object of source path → {line → count}, omitting zero counts
pub fn coverage_json(counts: &SourceCounts) -> Value {
    let mut paths: Vec<&String> = counts.keys().collect();
    paths.sort();

    let mut root = Map::new();
    for path in paths {
        let lines: Map<String, Value> = counts[path]
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(line, count)| (line.to_string(), Value::from(*count)))
            .collect();
        if !lines.is_empty() {
            root.insert(path.clone(), Value::Object(lines));
        }
    }
    Value::Object(root)
}

/// JSON text of [`coverage_json`], indented when `pretty`
pub fn coverage_json_string(counts: &SourceCounts, pretty: bool) -> String {
    let json = coverage_json(counts);
    if pretty {
        format!("{json:#}")
    } else {
        json.to_string()
    }
}
