//! ATA attribute delta rule and the temperature hysteresis tracker
//!
//! Grounded on `original_source/smartd.cpp`'s `ATACompareValues()` and
//! `CheckTemperature()`: both are small, pure state-transition functions
//! in the original, so they are kept that way here rather than folded
//! into the check engine.

use crate::device::AtaAttribute;

/// Outcome of comparing one attribute slot across two reads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AttributeDelta {
    /// Nothing changed (or the slot is not comparable)
    NoChange,
    /// A change was observed
    Changed {
        /// Attribute id
        id: u8,
        /// Previous normalized value
        old_norm: u8,
        /// Current normalized value
        new_norm: u8,
        /// Whether this is a prefail attribute
        prefail: bool,
        /// Whether only the raw value changed (normalized values equal)
        same_norm: bool,
    },
}

/// Compare one attribute slot across (old, new, threshold), applying the
/// ATA delta rule from spec §4.6: ids must agree across all three slots
/// and be non-zero; normalized values must be in `1..=0xFE`; otherwise no
/// comparison is made. When all of that holds, "no change" still wins if
/// the six raw bytes are identical and the normalized values are equal.
pub(crate) fn compare_attribute(
    old: Option<&AtaAttribute>,
    new: Option<&AtaAttribute>,
    threshold_id_matches: bool,
) -> AttributeDelta {
    let (Some(old), Some(new)) = (old, new) else {
        return AttributeDelta::NoChange;
    };
    if old.id == 0 || new.id == 0 {
        return AttributeDelta::NoChange;
    }
    if old.id != new.id || !threshold_id_matches {
        log::info!("attribute slot has a different id across reads, skipping comparison");
        return AttributeDelta::NoChange;
    }
    if old.value == 0 || old.value > 0xFE || new.value == 0 || new.value > 0xFE {
        return AttributeDelta::NoChange;
    }
    let same_raw = old.raw == new.raw;
    let same_norm = old.value == new.value;
    if same_raw && same_norm {
        return AttributeDelta::NoChange;
    }
    AttributeDelta::Changed {
        id: new.id,
        old_norm: old.value,
        new_norm: new.value,
        prefail: new.is_prefail(),
        same_norm,
    }
}

/// Temperature hysteresis tracker: spec §4.6.1
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TemperatureTracker {
    /// Most recently observed temperature; 0 means "never observed"
    pub temperature: u8,
    /// Minimum seen since warm-up completed
    pub tempmin: u8,
    /// Maximum seen
    pub tempmax: u8,
    /// Remaining warm-up cycles during which `tempmin` tracks every
    /// reading (raised as well as lowered) to recover from an
    /// artificially low power-on temperature; forced to at least 1 (spec
    /// Open Question: `CHECKTIME / checktime` can be 0 if `checktime >
    /// CHECKTIME`, forced to 1). Zeroed early the first time a reading is
    /// a genuine new low.
    pub tempmininc: u32,
}

/// What the check engine should do after observing a new temperature
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TemperatureObservation {
    /// Whether this was the first non-zero reading (min/max initialized)
    pub initial: bool,
    /// Whether tempmin/tempmax/temperature changed enough to log
    pub changed: bool,
    /// Whether `tempcrit` was crossed
    pub critical: bool,
    /// Whether `tempinfo` was crossed (and not already critical)
    pub info: bool,
}

impl TemperatureTracker {
    /// Build a tracker with the given warm-up cycle count, forced to a
    /// minimum of 1 per the Open Question resolution in DESIGN.md
    pub(crate) fn new(warmup_cycles: u32) -> Self {
        Self {
            temperature: 0,
            tempmin: 0,
            tempmax: 0,
            tempmininc: warmup_cycles.max(1),
        }
    }

    /// Observe a new temperature reading, updating internal state and
    /// returning what happened
    pub(crate) fn observe(
        &mut self,
        current: u8,
        tempdiff: u8,
        tempinfo: u8,
        tempcrit: u8,
    ) -> TemperatureObservation {
        if current == 0 {
            return TemperatureObservation {
                initial: false,
                changed: false,
                critical: false,
                info: false,
            };
        }
        if self.temperature == 0 {
            self.temperature = current;
            self.tempmin = current;
            self.tempmax = current;
            let critical = tempcrit > 0 && current >= tempcrit;
            let info = !critical && tempinfo > 0 && current >= tempinfo;
            return TemperatureObservation {
                initial: true,
                changed: false,
                critical,
                info,
            };
        }

        let mut min_max_changed = false;
        if self.tempmininc > 0 {
            self.tempmininc -= 1;
            if current < self.tempmin {
                // genuine new low: stop warming up early
                self.tempmininc = 0;
            }
            self.tempmin = current;
            min_max_changed = true;
        } else if current < self.tempmin {
            self.tempmin = current;
            min_max_changed = true;
        }
        if current > self.tempmax {
            self.tempmax = current;
            min_max_changed = true;
        }

        let diff = self.temperature.abs_diff(current);
        let changed = min_max_changed || diff >= tempdiff;
        if changed {
            self.temperature = current;
        }

        let critical = tempcrit > 0 && current >= tempcrit;
        let info = !critical && tempinfo > 0 && current >= tempinfo;
        TemperatureObservation {
            initial: false,
            changed,
            critical,
            info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(id: u8, value: u8, raw: u64, prefail: bool) -> AtaAttribute {
        let mut raw_bytes = [0u8; 6];
        for (i, b) in raw_bytes.iter_mut().enumerate() {
            *b = u8::try_from((raw >> (8 * i)) & 0xFF).unwrap();
        }
        AtaAttribute {
            id,
            flags: u16::from(prefail),
            value,
            raw: raw_bytes,
        }
    }

    #[test]
    fn identical_reads_never_produce_a_delta() {
        let a = attr(197, 100, 0, false);
        assert_eq!(
            compare_attribute(Some(&a), Some(&a), true),
            AttributeDelta::NoChange
        );
    }

    #[test]
    fn id_zero_is_never_compared() {
        let a = attr(0, 100, 0, false);
        let b = attr(0, 90, 1, false);
        assert_eq!(
            compare_attribute(Some(&a), Some(&b), true),
            AttributeDelta::NoChange
        );
    }

    #[test]
    fn differing_ids_are_not_compared() {
        let a = attr(5, 100, 0, false);
        let b = attr(6, 100, 0, false);
        assert_eq!(
            compare_attribute(Some(&a), Some(&b), true),
            AttributeDelta::NoChange
        );
    }

    #[test]
    fn out_of_range_normalized_value_is_not_compared() {
        let a = attr(5, 0xFF, 0, false);
        let b = attr(5, 90, 0, false);
        assert_eq!(
            compare_attribute(Some(&a), Some(&b), true),
            AttributeDelta::NoChange
        );
    }

    #[test]
    fn raw_only_change_is_reported_with_same_norm() {
        let a = attr(197, 100, 0, false);
        let b = attr(197, 100, 3, false);
        let delta = compare_attribute(Some(&a), Some(&b), true);
        assert_eq!(
            delta,
            AttributeDelta::Changed {
                id: 197,
                old_norm: 100,
                new_norm: 100,
                prefail: false,
                same_norm: true,
            }
        );
    }

    #[test]
    fn temperature_hysteresis_initial() {
        let mut tracker = TemperatureTracker::new(10);
        let obs = tracker.observe(30, 2, 40, 50);
        assert!(obs.initial);
        assert_eq!(tracker.tempmin, 30);
        assert_eq!(tracker.tempmax, 30);
    }

    #[test]
    fn temperature_scenario_s3() {
        // Mirrors the spec's S3 scenario: -W 2,40,50 and a fixed sequence
        // of readings.
        let mut tracker = TemperatureTracker::new(0);
        let mut crit_at = None;
        for (i, t) in [30u8, 31, 33, 34, 41, 50, 49].into_iter().enumerate() {
            let obs = tracker.observe(t, 2, 40, 50);
            if obs.critical {
                crit_at = Some(i);
            }
        }
        assert_eq!(crit_at, Some(5));
    }

    #[test]
    fn tempmin_tempmax_invariant_holds() {
        let mut tracker = TemperatureTracker::new(1);
        for t in [30u8, 10, 90, 45] {
            tracker.observe(t, 1, 0, 0);
            assert!(tracker.tempmin <= tracker.tempmax);
        }
    }

    #[test]
    fn warmup_forced_to_minimum_one() {
        let tracker = TemperatureTracker::new(0);
        assert_eq!(tracker.tempmininc, 1);
    }
}
