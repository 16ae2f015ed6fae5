//! Per-window running state for each aggregation function.

use std::collections::HashSet;

use super::AggregationFn;
use crate::events::Event;

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Count(u64),
    Sum(f64),
    Avg { sum: f64, n: u64 },
    Rate(u64),
    DistinctCount(HashSet<String>),
}

impl Accumulator {
    pub fn new(aggregation: &AggregationFn) -> Self {
        match aggregation {
            AggregationFn::Count => Accumulator::Count(0),
            AggregationFn::Sum { .. } => Accumulator::Sum(0.0),
            AggregationFn::Avg { .. } => Accumulator::Avg { sum: 0.0, n: 0 },
            AggregationFn::Rate => Accumulator::Rate(0),
            AggregationFn::DistinctCount { .. } => Accumulator::DistinctCount(HashSet::new()),
        }
    }

    /// Whether `event` carries what `aggregation` needs. Events that don't are skipped
    /// entirely so no window is opened for them.
    pub fn contributes(aggregation: &AggregationFn, event: &Event) -> bool {
        match aggregation {
            AggregationFn::Count | AggregationFn::Rate => true,
            AggregationFn::Sum { field } | AggregationFn::Avg { field } => {
                event.numeric_field(field).is_some()
            }
            AggregationFn::DistinctCount { field } => event.field_token(field).is_some(),
        }
    }

    pub fn update(&mut self, aggregation: &AggregationFn, event: &Event) {
        match (self, aggregation) {
            (Accumulator::Count(n), _) | (Accumulator::Rate(n), _) => *n += 1,
            (Accumulator::Sum(s), AggregationFn::Sum { field }) => {
                *s += event.numeric_field(field).unwrap_or(0.0);
            }
            (Accumulator::Avg { sum, n }, AggregationFn::Avg { field }) => {
                if let Some(v) = event.numeric_field(field) {
                    *sum += v;
                    *n += 1;
                }
            }
            (Accumulator::DistinctCount(seen), AggregationFn::DistinctCount { field }) => {
                if let Some(token) = event.field_token(field) {
                    seen.insert(token);
                }
            }
            _ => {}
        }
    }

    /// Fold another accumulator of the same kind into this one.
    pub fn merge(&mut self, other: Accumulator) {
        match (self, other) {
            (Accumulator::Count(a), Accumulator::Count(b))
            | (Accumulator::Rate(a), Accumulator::Rate(b)) => *a += b,
            (Accumulator::Sum(a), Accumulator::Sum(b)) => *a += b,
            (Accumulator::Avg { sum, n }, Accumulator::Avg { sum: s2, n: n2 }) => {
                *sum += s2;
                *n += n2;
            }
            (Accumulator::DistinctCount(a), Accumulator::DistinctCount(b)) => a.extend(b),
            _ => {}
        }
    }

    /// Final value for a window spanning `span_ms`.
    pub fn finish(&self, span_ms: i64) -> f64 {
        match self {
            Accumulator::Count(n) => *n as f64,
            Accumulator::Sum(s) => *s,
            Accumulator::Avg { sum, n } => {
                if *n == 0 {
                    0.0
                } else {
                    sum / *n as f64
                }
            }
            Accumulator::Rate(n) => {
                if span_ms <= 0 {
                    0.0
                } else {
                    *n as f64 / (span_ms as f64 / 1000.0)
                }
            }
            Accumulator::DistinctCount(seen) => seen.len() as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn purchase(amount: f64, sku: &str) -> Event {
        Event::new(0, "purchase")
            .with_field("amount", amount)
            .with_field("sku", sku)
    }

    #[test]
    fn avg_and_distinct() {
        let avg = AggregationFn::Avg {
            field: "amount".into(),
        };
        let distinct = AggregationFn::DistinctCount { field: "sku".into() };
        let mut a = Accumulator::new(&avg);
        let mut d = Accumulator::new(&distinct);
        for (amount, sku) in [(10.0, "a"), (20.0, "b"), (30.0, "a")] {
            let e = purchase(amount, sku);
            a.update(&avg, &e);
            d.update(&distinct, &e);
        }
        assert_eq!(a.finish(60_000), 20.0);
        assert_eq!(d.finish(60_000), 2.0);
    }

    #[test]
    fn rate_is_per_second() {
        let mut r = Accumulator::new(&AggregationFn::Rate);
        for _ in 0..30 {
            r.update(&AggregationFn::Rate, &Event::new(0, "view"));
        }
        assert_eq!(r.finish(60_000), 0.5);
        assert_eq!(r.finish(0), 0.0);
    }

    #[test]
    fn missing_field_does_not_contribute() {
        let sum = AggregationFn::Sum {
            field: "amount".into(),
        };
        assert!(!Accumulator::contributes(&sum, &Event::new(0, "view")));
        assert!(Accumulator::contributes(&sum, &purchase(1.0, "x")));
    }
}
