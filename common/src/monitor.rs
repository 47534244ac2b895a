use std::sync::Mutex;

use crate::types::{Condition, Transition};

/// Readings above this voltage classify as [`Condition::Alert`]; the boundary
/// value itself is Normal.
pub const ALERT_THRESHOLD_VOLTS: f32 = 2.5;

pub const ADC_FULL_SCALE_VOLTS: f32 = 3.3;

/// Raw readings taken per smoothed sample.
pub const SAMPLES_PER_READING: usize = 5;
/// Spacing between the raw readings of one sample.
pub const SAMPLE_SPACING_MS: u64 = 10;
/// Period of the monitoring cycle.
pub const MONITOR_PERIOD_MS: u64 = 5_000;

/// Linear conversion from the full 16-bit raw range to the voltage domain.
pub fn volts_from_raw(raw: u16) -> f32 {
    f32::from(raw) * ADC_FULL_SCALE_VOLTS / f32::from(u16::MAX)
}

/// Arithmetic mean of a batch of raw readings, in volts.
pub fn average_volts(raw: &[u16]) -> f32 {
    if raw.is_empty() {
        return 0.0;
    }
    raw.iter().map(|&value| volts_from_raw(value)).sum::<f32>() / raw.len() as f32
}

/// Maps a smoothed reading to the binary device condition. There is no
/// hysteresis band: a single crossing flips the condition immediately.
pub fn classify(volts: f32) -> Condition {
    if volts > ALERT_THRESHOLD_VOLTS {
        Condition::Alert
    } else {
        Condition::Normal
    }
}

/// The single piece of mutable cross-task state: the last known condition.
///
/// `None` until the first sample establishes a baseline. All access funnels
/// through one mutex so the sampling task and the status server can never
/// observe a torn update.
#[derive(Debug, Default)]
pub struct StateStore {
    last: Mutex<Option<Condition>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Condition> {
        *self.last.lock().unwrap()
    }

    /// Stores `condition` and returns the previous value, atomically, so the
    /// caller can detect a transition without a read-then-write race.
    pub fn set(&self, condition: Condition) -> Option<Condition> {
        self.last.lock().unwrap().replace(condition)
    }

    /// Stores the latest classification and reports a transition only when a
    /// previously established baseline differs from it. The very first call
    /// sets the baseline and reports nothing.
    pub fn record(&self, condition: Condition) -> Option<Transition> {
        match self.set(condition) {
            Some(prev) if prev != condition => Some(Transition {
                from: prev,
                to: condition,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn threshold_boundary_is_normal() {
        assert_eq!(classify(2.5), Condition::Normal);
        assert_eq!(classify(2.51), Condition::Alert);
        assert_eq!(classify(0.0), Condition::Normal);
        assert_eq!(classify(3.3), Condition::Alert);
    }

    #[test]
    fn raw_conversion_spans_full_scale() {
        assert_eq!(volts_from_raw(0), 0.0);
        assert!((volts_from_raw(u16::MAX) - ADC_FULL_SCALE_VOLTS).abs() < 1e-6);
        assert!((volts_from_raw(u16::MAX / 2) - 1.65).abs() < 1e-3);
    }

    #[test]
    fn averaging_smooths_spread_readings() {
        let raw = [0, u16::MAX, 0, u16::MAX, 0];
        let expected = ADC_FULL_SCALE_VOLTS * 2.0 / 5.0;
        assert!((average_volts(&raw) - expected).abs() < 1e-3);
    }

    #[test]
    fn baseline_assignment_reports_no_transition() {
        let store = StateStore::new();
        assert_eq!(store.get(), None);
        assert_eq!(store.record(Condition::Normal), None);
        assert_eq!(store.get(), Some(Condition::Normal));
    }

    #[test]
    fn repeated_condition_reports_no_transition() {
        let store = StateStore::new();
        store.record(Condition::Normal);
        assert_eq!(store.record(Condition::Normal), None);
        assert_eq!(
            store.record(Condition::Alert),
            Some(Transition {
                from: Condition::Normal,
                to: Condition::Alert,
            })
        );
        assert_eq!(store.record(Condition::Alert), None);
    }

    #[test]
    fn set_returns_previous_value() {
        let store = StateStore::new();
        assert_eq!(store.set(Condition::Normal), None);
        assert_eq!(store.set(Condition::Alert), Some(Condition::Normal));
        assert_eq!(store.get(), Some(Condition::Alert));
    }

    #[test]
    fn concurrent_access_stays_consistent() {
        let store = Arc::new(StateStore::new());

        let writers: Vec<_> = (0..4)
            .map(|offset| {
                let store = store.clone();
                thread::spawn(move || {
                    for n in 0..500 {
                        let condition = if (offset + n) % 2 == 0 {
                            Condition::Normal
                        } else {
                            Condition::Alert
                        };
                        store.set(condition);
                    }
                })
            })
            .collect();

        // Every read observes either the unset baseline or a complete value.
        for _ in 0..2_000 {
            let observed = store.get();
            assert!(observed.is_none() || observed.map(Condition::as_str).is_some());
        }

        for writer in writers {
            writer.join().unwrap();
        }
        assert!(store.get().is_some());
    }

    #[test]
    fn reading_sequence_produces_two_transitions() {
        let store = StateStore::new();
        let mut transitions = Vec::new();
        let mut indicator = Vec::new();

        for volts in [1.0_f32, 1.0, 3.0, 3.0, 1.0] {
            let condition = classify(volts);
            indicator.push(condition.indicator_on());
            if let Some(transition) = store.record(condition) {
                transitions.push(transition);
            }
        }

        assert_eq!(
            transitions,
            vec![
                Transition {
                    from: Condition::Normal,
                    to: Condition::Alert,
                },
                Transition {
                    from: Condition::Alert,
                    to: Condition::Normal,
                },
            ]
        );
        // Indicator follows the latest classification every cycle and ends off.
        assert_eq!(indicator, vec![false, false, true, true, false]);
    }
}
