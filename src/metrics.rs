//! Per-instance metric slots and report-time aggregation.
//!
//! Beyond the bogo-ops counter, a workload can publish up to
//! [`METRIC_SLOTS`](crate::shm::METRIC_SLOTS) named secondary
//! measurements (latencies, rates, high-water marks). Slots live in
//! the instance's shared block; at report time, slots sharing a
//! description across a stressor's instances are merged according to
//! their declared aggregation kind.

use crate::shm::{InstanceBlock, METRIC_DESC_LEN, METRIC_SLOTS};
use std::sync::atomic::Ordering;

/// How a metric merges across instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AggregationKind {
    /// Arithmetic total (counts, bytes).
    Sum = 0,
    /// Geometric mean (multiplicative rates).
    GeometricMean = 1,
    /// Harmonic mean (rate-of-rate metrics).
    HarmonicMean = 2,
    /// High-water mark.
    Maximum = 3,
}

impl AggregationKind {
    fn from_tag(tag: u32) -> Option<Self> {
        Some(match tag {
            1 => AggregationKind::Sum,
            2 => AggregationKind::GeometricMean,
            3 => AggregationKind::HarmonicMean,
            4 => AggregationKind::Maximum,
            _ => return None,
        })
    }

    fn tag(self) -> u32 {
        self as u32 + 1
    }
}

/// One metric read back from a slot.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// Slot description (truncated to the inline capacity).
    pub description: String,
    /// Measured value.
    pub value: f64,
    /// Declared aggregation kind.
    pub kind: AggregationKind,
}

/// A metric merged across a stressor's instances.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatedMetric {
    /// Shared slot description.
    pub description: String,
    /// Merged value.
    pub value: f64,
    /// Aggregation kind applied (first writer wins on conflict).
    pub kind: AggregationKind,
    /// Number of instance samples merged.
    pub samples: usize,
}

/// Handle to one instance's metric slots.
///
/// Single-writer: only the owning instance calls [`set`](Self::set);
/// the parent reads slots after the instance is reaped.
#[derive(Clone, Copy)]
pub struct MetricsHandle<'a> {
    block: &'a InstanceBlock,
}

impl<'a> MetricsHandle<'a> {
    /// Build a metrics handle over an instance block.
    pub fn new(block: &'a InstanceBlock) -> Self {
        Self { block }
    }

    /// Overwrite slot `idx` with a named measurement.
    ///
    /// The description — static constant or owned string alike — is
    /// copied inline and truncated to the slot capacity at a UTF-8
    /// boundary.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    pub fn set(&self, idx: usize, description: &str, value: f64, kind: AggregationKind) {
        assert!(idx < METRIC_SLOTS, "metric slot index out of bounds");
        let slot = &self.block.metrics[idx];

        let bytes = truncate_utf8(description, METRIC_DESC_LEN);
        for (i, byte) in bytes.iter().enumerate() {
            slot.desc[i].store(*byte, Ordering::Relaxed);
        }
        slot.desc_len.store(bytes.len() as u32, Ordering::Relaxed);
        slot.value_bits.store(value.to_bits(), Ordering::Relaxed);
        // Tag written last: publishes the slot.
        slot.kind_tag.store(kind.tag(), Ordering::Release);
    }

    /// Read back slot `idx`, if it has been set.
    pub fn get(&self, idx: usize) -> Option<Metric> {
        assert!(idx < METRIC_SLOTS, "metric slot index out of bounds");
        let slot = &self.block.metrics[idx];

        let kind = AggregationKind::from_tag(slot.kind_tag.load(Ordering::Acquire))?;
        let len = (slot.desc_len.load(Ordering::Relaxed) as usize).min(METRIC_DESC_LEN);
        let mut bytes = [0u8; METRIC_DESC_LEN];
        for (i, byte) in bytes.iter_mut().enumerate().take(len) {
            *byte = slot.desc[i].load(Ordering::Relaxed);
        }
        Some(Metric {
            description: String::from_utf8_lossy(&bytes[..len]).into_owned(),
            value: f64::from_bits(slot.value_bits.load(Ordering::Relaxed)),
            kind,
        })
    }

    /// All set slots, in index order.
    pub fn read_all(&self) -> Vec<Metric> {
        (0..METRIC_SLOTS).filter_map(|idx| self.get(idx)).collect()
    }
}

/// Truncate a string to at most `max` bytes at a char boundary.
fn truncate_utf8(s: &str, max: usize) -> &[u8] {
    if s.len() <= max {
        return s.as_bytes();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s.as_bytes()[..end]
}

/// Merge metrics across a stressor's instances.
///
/// Slots sharing a description are folded per their declared kind. A
/// description reused with conflicting kinds is a configuration
/// error: reported once via `warn!`, first-writer-wins thereafter.
pub fn merge_metrics(per_instance: &[Vec<Metric>]) -> Vec<AggregatedMetric> {
    // Group by description, preserving first-appearance order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, (AggregationKind, Vec<f64>, bool)> =
        std::collections::HashMap::new();

    for metrics in per_instance {
        for metric in metrics {
            match groups.get_mut(&metric.description) {
                None => {
                    order.push(metric.description.clone());
                    groups.insert(
                        metric.description.clone(),
                        (metric.kind, vec![metric.value], false),
                    );
                }
                Some((kind, values, warned)) => {
                    if metric.kind != *kind && !*warned {
                        tracing::warn!(
                            description = %metric.description,
                            declared = ?kind,
                            conflicting = ?metric.kind,
                            "metric declared with conflicting aggregation kinds; \
                             keeping first"
                        );
                        *warned = true;
                    }
                    values.push(metric.value);
                }
            }
        }
    }

    order
        .into_iter()
        .map(|description| {
            let (kind, values, _) = groups.remove(&description).expect("grouped above");
            let samples = values.len();
            AggregatedMetric {
                description,
                value: fold(kind, &values),
                kind,
                samples,
            }
        })
        .collect()
}

/// Fold sample values per aggregation kind.
///
/// Geometric and harmonic means are defined over positive values;
/// non-positive samples are excluded from those folds.
fn fold(kind: AggregationKind, values: &[f64]) -> f64 {
    match kind {
        AggregationKind::Sum => values.iter().sum(),
        AggregationKind::GeometricMean => {
            let positive: Vec<f64> = values.iter().copied().filter(|v| *v > 0.0).collect();
            if positive.is_empty() {
                return 0.0;
            }
            let log_sum: f64 = positive.iter().map(|v| v.ln()).sum();
            (log_sum / positive.len() as f64).exp()
        }
        AggregationKind::HarmonicMean => {
            let positive: Vec<f64> = values.iter().copied().filter(|v| *v > 0.0).collect();
            if positive.is_empty() {
                return 0.0;
            }
            let recip_sum: f64 = positive.iter().map(|v| 1.0 / v).sum();
            positive.len() as f64 / recip_sum
        }
        AggregationKind::Maximum => values.iter().copied().fold(f64::MIN, f64::max),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::InstanceBlock;

    #[test]
    fn test_set_get_roundtrip() {
        let block = InstanceBlock::new_boxed();
        let metrics = MetricsHandle::new(&block);

        metrics.set(0, "page faults", 42.0, AggregationKind::Sum);
        let m = metrics.get(0).unwrap();
        assert_eq!(m.description, "page faults");
        assert_eq!(m.value, 42.0);
        assert_eq!(m.kind, AggregationKind::Sum);

        assert!(metrics.get(1).is_none());
    }

    #[test]
    fn test_overwrite_slot() {
        let block = InstanceBlock::new_boxed();
        let metrics = MetricsHandle::new(&block);

        metrics.set(3, "latency", 1.0, AggregationKind::Maximum);
        metrics.set(3, "latency", 9.0, AggregationKind::Maximum);
        assert_eq!(metrics.get(3).unwrap().value, 9.0);
        assert_eq!(metrics.read_all().len(), 1);
    }

    #[test]
    fn test_long_description_truncated_at_char_boundary() {
        let block = InstanceBlock::new_boxed();
        let metrics = MetricsHandle::new(&block);

        let long = "é".repeat(40); // 80 bytes
        metrics.set(0, &long, 1.0, AggregationKind::Sum);
        let m = metrics.get(0).unwrap();
        assert!(m.description.len() <= 48);
        assert!(m.description.chars().all(|c| c == 'é'));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_slot_bounds_checked() {
        let block = InstanceBlock::new_boxed();
        MetricsHandle::new(&block).set(96, "x", 0.0, AggregationKind::Sum);
    }

    fn metric(desc: &str, value: f64, kind: AggregationKind) -> Metric {
        Metric {
            description: desc.into(),
            value,
            kind,
        }
    }

    #[test]
    fn test_merge_sum() {
        let merged = merge_metrics(&[
            vec![metric("ops", 10.0, AggregationKind::Sum)],
            vec![metric("ops", 32.0, AggregationKind::Sum)],
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].value, 42.0);
        assert_eq!(merged[0].samples, 2);
    }

    #[test]
    fn test_merge_geometric_mean() {
        let merged = merge_metrics(&[
            vec![metric("rate", 2.0, AggregationKind::GeometricMean)],
            vec![metric("rate", 8.0, AggregationKind::GeometricMean)],
        ]);
        assert!((merged[0].value - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_harmonic_mean() {
        let merged = merge_metrics(&[
            vec![metric("rr", 2.0, AggregationKind::HarmonicMean)],
            vec![metric("rr", 6.0, AggregationKind::HarmonicMean)],
        ]);
        assert!((merged[0].value - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_maximum() {
        let merged = merge_metrics(&[
            vec![metric("hwm", 5.0, AggregationKind::Maximum)],
            vec![metric("hwm", 3.0, AggregationKind::Maximum)],
        ]);
        assert_eq!(merged[0].value, 5.0);
    }

    #[test]
    fn test_merge_conflicting_kind_first_writer_wins() {
        let merged = merge_metrics(&[
            vec![metric("x", 4.0, AggregationKind::Sum)],
            vec![metric("x", 6.0, AggregationKind::Maximum)],
        ]);
        assert_eq!(merged[0].kind, AggregationKind::Sum);
        assert_eq!(merged[0].value, 10.0);
    }

    #[test]
    fn test_merge_skips_nonpositive_for_means() {
        let merged = merge_metrics(&[
            vec![metric("g", 0.0, AggregationKind::GeometricMean)],
            vec![metric("g", 4.0, AggregationKind::GeometricMean)],
        ]);
        assert_eq!(merged[0].value, 4.0);
    }

    #[test]
    fn test_merge_preserves_first_appearance_order() {
        let merged = merge_metrics(&[
            vec![
                metric("a", 1.0, AggregationKind::Sum),
                metric("b", 1.0, AggregationKind::Sum),
            ],
            vec![metric("a", 1.0, AggregationKind::Sum)],
        ]);
        assert_eq!(merged[0].description, "a");
        assert_eq!(merged[1].description, "b");
    }
}
