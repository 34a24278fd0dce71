//! Volume result model
//!
//! The analysis program writes `volume_data.json`:
//!
//! ```json
//! {
//!   "is_image": true,
//!   "vials": {
//!     "vial_1": [ { "segment": 1, "volumes": [12.34] } ]
//!   }
//! }
//! ```
//!
//! The relay only checks the top-level shape and passes the document through.
//! Rendering is lenient the same way the browser UI is: malformed segments and
//! non-numeric samples are skipped rather than failing the whole result.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use crate::{Error, Result};

/// Check the top-level shape of a volume document
///
/// A document without a `vials` mapping is malformed and must never be
/// returned as partial data.
pub fn validate_document(doc: &Value) -> Result<()> {
    match doc.get("vials") {
        Some(Value::Object(_)) => Ok(()),
        Some(_) => Err(Error::Malformed(
            "invalid volume data: 'vials' is not a mapping".to_string(),
        )),
        None => Err(Error::Malformed(
            "invalid volume data: missing 'vials' property".to_string(),
        )),
    }
}

/// Parse and validate raw file contents
pub fn parse_document(raw: &str) -> Result<Value> {
    let doc: Value = serde_json::from_str(raw)?;
    validate_document(&doc)?;
    Ok(doc)
}

/// Segment identifier as written by the analysis program (number or text)
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentId(String);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One detected liquid layer
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: SegmentId,
    /// Volume samples in mL over time; `None` for non-numeric entries
    pub volumes: Vec<Option<f64>>,
}

impl Segment {
    /// Sample to display: first for a still image, last for a time series
    pub fn displayed_volume(&self, is_image: bool) -> Option<f64> {
        let sample = if is_image {
            self.volumes.first()
        } else {
            self.volumes.last()
        };
        sample.copied().flatten().filter(|v| v.is_finite())
    }
}

/// Typed view over a validated volume document
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeResult {
    pub is_image: bool,
    /// Vials in natural key order (`vial_2` before `vial_10`)
    pub vials: Vec<(String, Vec<Segment>)>,
}

impl VolumeResult {
    pub fn from_value(doc: &Value) -> Result<Self> {
        validate_document(doc)?;
        let is_image = doc.get("is_image").and_then(Value::as_bool).unwrap_or(false);

        let mut vials: Vec<(String, Vec<Segment>)> = doc["vials"]
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(key, entry)| (key.clone(), parse_segments(entry)))
                    .collect()
            })
            .unwrap_or_default();
        vials.sort_by(|a, b| natural_cmp(&a.0, &b.0));

        Ok(Self { is_image, vials })
    }
}

fn parse_segments(entry: &Value) -> Vec<Segment> {
    let Some(items) = entry.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let volumes = item.get("volumes")?.as_array()?;
            let id = match item.get("segment") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return None,
            };
            Some(Segment {
                id: SegmentId(id),
                volumes: volumes.iter().map(Value::as_f64).collect(),
            })
        })
        .collect()
}

/// Compare keys so that embedded numbers sort numerically
fn natural_cmp(a: &str, b: &str) -> Ordering {
    fn split(key: &str) -> (&str, Option<u64>) {
        let digits_at = key
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i);
        match digits_at {
            Some(i) => (&key[..i], key[i..].parse().ok()),
            None => (key, None),
        }
    }

    let (prefix_a, num_a) = split(a);
    let (prefix_b, num_b) = split(b);
    prefix_a
        .cmp(prefix_b)
        .then(num_a.cmp(&num_b))
        .then_with(|| a.cmp(b))
}

/// Rendered block for one vial
#[derive(Debug, Clone, PartialEq)]
pub struct VialSummary {
    /// `vial_1` becomes `VIAL 1`
    pub title: String,
    /// One `Segment <id>: <volume> mL` line per displayable segment
    pub lines: Vec<String>,
}

/// Render the per-vial, per-segment volume list
///
/// Vials without a single displayable segment are omitted.
pub fn render_volumes(result: &VolumeResult) -> Vec<VialSummary> {
    result
        .vials
        .iter()
        .filter_map(|(key, segments)| {
            let lines: Vec<String> = segments
                .iter()
                .filter_map(|segment| {
                    segment
                        .displayed_volume(result.is_image)
                        .map(|volume| format!("Segment {}: {:.2} mL", segment.id, volume))
                })
                .collect();

            (!lines.is_empty()).then(|| VialSummary {
                title: key.replacen('_', " ", 1).to_uppercase(),
                lines,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_vials_is_malformed() {
        let err = validate_document(&json!({ "is_image": true })).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_non_mapping_vials_is_malformed() {
        let err = validate_document(&json!({ "vials": [1, 2] })).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_parse_error_is_malformed() {
        assert!(matches!(parse_document("{not json"), Err(Error::Malformed(_))));
        assert!(matches!(parse_document(""), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_still_image_uses_first_sample() {
        let doc = json!({
            "is_image": true,
            "vials": { "vial_1": [ { "segment": 1, "volumes": [12.34] } ] }
        });
        let rendered = render_volumes(&VolumeResult::from_value(&doc).unwrap());
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].title, "VIAL 1");
        assert_eq!(rendered[0].lines, vec!["Segment 1: 12.34 mL"]);
    }

    #[test]
    fn test_time_series_uses_last_sample() {
        let doc = json!({
            "is_image": false,
            "vials": { "vial_1": [ { "segment": 2, "volumes": [1.0, 2.0, 3.5] } ] }
        });
        let rendered = render_volumes(&VolumeResult::from_value(&doc).unwrap());
        assert_eq!(rendered[0].lines, vec!["Segment 2: 3.50 mL"]);
    }

    #[test]
    fn test_invalid_segments_are_skipped() {
        let doc = json!({
            "is_image": false,
            "vials": {
                "vial_1": [
                    { "segment": 1, "volumes": [] },
                    { "segment": 2, "volumes": [1.0, null] },
                    { "segment": 3 },
                    { "segment": "top", "volumes": [4.257] }
                ],
                "vial_2": "not a list",
                "vial_3": []
            }
        });
        let rendered = render_volumes(&VolumeResult::from_value(&doc).unwrap());
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].lines, vec!["Segment top: 4.26 mL"]);
    }

    #[test]
    fn test_vials_in_natural_order() {
        let doc = json!({
            "vials": {
                "vial_10": [ { "segment": 1, "volumes": [1.0] } ],
                "vial_2": [ { "segment": 1, "volumes": [1.0] } ],
                "vial_1": [ { "segment": 1, "volumes": [1.0] } ]
            }
        });
        let result = VolumeResult::from_value(&doc).unwrap();
        let keys: Vec<&str> = result.vials.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["vial_1", "vial_2", "vial_10"]);
    }
}
