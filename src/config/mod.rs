//! Per-device monitoring configuration and mutable runtime state (spec §3).
//!
//! `DeviceConfig` is produced by [`parser`] (from the config file) or by
//! registration (synthesized from a `DEVICESCAN` template); `DeviceState`
//! is created alongside it and mutated only by the check engine.

pub(crate) mod parser;

use crate::{
    bitset::MonitorAttFlags,
    comparator::TemperatureTracker,
    device::{AtaAttributeTable, AtaThresholdTable, DevType, SelfTestType, TriState},
};

/// Number of independent mail-log rate-limit slots (spec §7 failure taxonomy,
/// classes 0 through 12)
pub(crate) const N_MAIL_CLASSES: usize = 13;

/// Firmware-bug workaround selector (`-F`, spec §6)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum FixFirmwareBug {
    /// No firmware workaround
    #[default]
    None,
    /// Original Samsung quirk: clear bogus attribute-count fields from IDENTIFY
    Samsung,
    /// Second Samsung quirk variant
    Samsung2,
    /// Third Samsung quirk variant: self-test busy status reported as a
    /// fixed `0xF0` byte instead of the generic high nibble, honored by
    /// the scheduler (spec §4.7)
    Samsung3,
}

/// Vendor-attribute preset policy (`-P`, spec §6 / SPEC_FULL §B.2). The
/// presets database itself is out of scope (spec §1); this only records
/// which policy was requested so the flag round-trips.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum PresetPolicy {
    /// Apply presets silently
    #[default]
    Use,
    /// Do not apply presets (`ignorepresets`)
    Ignore,
    /// Apply presets and log which ones were used (`showpresets`)
    Show,
    /// Log all presets that exist for this drive, whether applied or not
    ShowAll,
}

/// Labeling convention for one attribute id, as set by `-v ID,FORMAT`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum AttributeLabel {
    /// No override; use the default raw48 interpretation
    #[default]
    Default,
    /// Plain unsigned 48-bit raw value
    Raw48,
    /// Raw value printed in hexadecimal
    Hex48,
    /// Raw value split into a 24-bit then a hex 24-bit field
    Hex24Hex48,
    /// Minutes-and-hours packed raw value
    Min2Hour,
    /// Seconds-in-tenths packed raw value
    SecTenths,
    /// Temperature scaled by 10
    Temp10X,
}

/// Email/exec dispatch frequency policy (spec §4.4)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Frequency {
    /// Emit once ever, per failure class
    #[default]
    Once,
    /// At most once per 24 hours
    Daily,
    /// n-th warning only after `2^(n-1)` days since the first
    Diminishing,
}

/// One rate-limit counter slot, keyed by failure class
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct MailLog {
    /// Number of warnings dispatched for this class so far
    pub logged: u32,
    /// Epoch seconds of the first successful dispatch
    pub firstsent: Option<i64>,
    /// Epoch seconds of the most recent successful dispatch
    pub lastsent: Option<i64>,
}

/// Notifier configuration and per-class rate-limit state (spec §3 `mailwarn`)
#[derive(Clone, Debug, Default)]
pub(crate) struct MailWarnConfig {
    /// Recipient addresses; the sentinel `<nomailer>` means "none, exec only"
    pub addresses: Vec<String>,
    /// Arbitrary command line to exec instead of (or in addition to) mailing
    pub exec: Option<String>,
    /// Whether a class-0 "email test" warning should fire on the first cycle
    pub emailtest: bool,
    /// Dispatch frequency policy
    pub frequency: Frequency,
    /// Per-failure-class rate-limit counters
    pub maillog: [MailLog; N_MAIL_CLASSES],
}

impl MailWarnConfig {
    /// Whether any notification target (address or exec) is configured
    pub(crate) fn has_target(&self) -> bool {
        !self.addresses.is_empty() || self.exec.is_some()
    }
}

/// Current-pending / offline-uncorrectable attribute ids to monitor
/// (spec §3 `pending`, Open Question: modeled as an explicit record with
/// two `Option` fields rather than a packed 16-bit sentinel pair).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct PendingSectorIds {
    /// Current-pending-sector attribute id (`-C`), default 197
    pub current_pending: Option<u8>,
    /// Offline-uncorrectable attribute id (`-U`), default 198
    pub offline_uncorrectable: Option<u8>,
}

/// Which self-test letters a device has refused in the past (registration
/// or a prior launch attempt found them unsupported), so the scheduler
/// stops retrying them every cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct NotCapable {
    /// Offline-immediate test refused
    pub offline: bool,
    /// Short self-test refused
    pub short: bool,
    /// Long self-test refused
    pub long: bool,
    /// Conveyance self-test refused
    pub conveyance: bool,
}

impl NotCapable {
    /// Mark one self-test letter as refused
    pub(crate) fn mark(&mut self, test: SelfTestType) {
        match test {
            SelfTestType::Offline => self.offline = true,
            SelfTestType::Short => self.short = true,
            SelfTestType::Long => self.long = true,
            SelfTestType::Conveyance => self.conveyance = true,
        }
    }

    /// Whether this letter has been marked not-capable
    pub(crate) fn is_set(&self, test: SelfTestType) -> bool {
        match test {
            SelfTestType::Offline => self.offline,
            SelfTestType::Short => self.short,
            SelfTestType::Long => self.long,
            SelfTestType::Conveyance => self.conveyance,
        }
    }
}

/// Self-test schedule pattern plus the scheduler's dedup/capability state
/// (spec §3 `testdata`, spec §4.7)
#[derive(Clone, Debug, Default)]
pub(crate) struct TestSchedule {
    /// Raw pattern text as given to `-s`, kept for round-tripping /
    /// diagnostics
    pub pattern: Option<String>,
    /// Compiled extended regex, matched against `X/MM/DD/w/HH`
    pub regex: Option<regex::Regex>,
    /// Hour slot of the most recent successful match (spec §4.7 dedup key)
    pub last_hour_slot: Option<u32>,
    /// Self-test letter launched at `last_hour_slot`
    pub last_letter: Option<SelfTestType>,
    /// Letters the device has refused; the scheduler skips them
    pub not_capable: NotCapable,
}

/// A single configured SMART-monitored device entry (spec §3 `DeviceConfig`)
#[derive(Clone, Debug)]
pub(crate) struct DeviceConfig {
    /// Path-like identifier passed to the device abstraction
    pub name: String,
    /// Device family; mutable, filled in by registration if left `Auto`
    pub dev_type: DevType,
    /// Source line number; 0 means synthesized from a `DEVICESCAN` template
    pub line_no: u32,
    /// Overall health-status check (`-H`)
    pub smartcheck: bool,
    /// Usage-attribute threshold-crossed reporting (`-f`)
    pub usagefailed: bool,
    /// Track prefail attribute changes (`-p`)
    pub prefail: bool,
    /// Track usage attribute changes (`-u`)
    pub usage: bool,
    /// Launch scheduled self-tests (`-s`)
    pub selftest: bool,
    /// Watch the ATA error log / SCSI self-test-failure counter (`-l error`)
    pub errorlog: bool,
    /// Keep going even when a capability probe fails in ways that would
    /// otherwise reject the entry
    pub permissive: bool,
    /// Do not apply vendor-attribute presets
    pub ignorepresets: bool,
    /// Log which presets would have applied, without applying them
    pub showpresets: bool,
    /// Device uses removable media (affects SCSI `NO_MEDIUM` handling)
    pub removable: bool,
    /// Suppress the "skip" log line on repeated power-mode skips
    pub powerquiet: bool,
    /// Attribute-autosave tri-state (`-S`)
    pub autosave: TriState,
    /// Automatic-offline-test tri-state (`-o`)
    pub autoofflinetest: TriState,
    /// Firmware-bug workaround selector
    pub fixfirmwarebug: FixFirmwareBug,
    /// Vendor-attribute preset policy
    pub preset_policy: PresetPolicy,
    /// Power-mode gating threshold, 0..=3 (`-n`)
    pub powermode: u8,
    /// Pending/offline-uncorrectable attribute ids to monitor
    pub pending: PendingSectorIds,
    /// Minimum temperature delta to log a "changed" line (`-W` field 1)
    pub tempdiff: u8,
    /// Informational temperature threshold (`-W` field 2)
    pub tempinfo: u8,
    /// Critical temperature threshold (`-W` field 3)
    pub tempcrit: u8,
    /// Per-attribute labeling convention, indexed by attribute id
    pub attributedefs: Box<[AttributeLabel; 256]>,
    /// Per-category "attribute is off for that purpose" bitmap
    pub monitorattflags: MonitorAttFlags,
    /// Self-test schedule pattern and scheduler state
    pub testdata: TestSchedule,
    /// Notifier configuration and rate-limit state
    pub mailwarn: MailWarnConfig,
}

impl DeviceConfig {
    /// Build a bare entry with every check disabled, named `name`, at
    /// `line_no` (0 for scan-synthesized entries)
    pub(crate) fn new(name: impl Into<String>, line_no: u32) -> Self {
        Self {
            name: name.into(),
            dev_type: DevType::Auto,
            line_no,
            smartcheck: false,
            usagefailed: false,
            prefail: false,
            usage: false,
            selftest: false,
            errorlog: false,
            permissive: false,
            ignorepresets: false,
            showpresets: false,
            removable: false,
            powerquiet: false,
            autosave: TriState::Unset,
            autoofflinetest: TriState::Unset,
            fixfirmwarebug: FixFirmwareBug::None,
            preset_policy: PresetPolicy::Use,
            powermode: 0,
            pending: PendingSectorIds::default(),
            tempdiff: 0,
            tempinfo: 0,
            tempcrit: 0,
            attributedefs: Box::new([AttributeLabel::Default; 256]),
            monitorattflags: MonitorAttFlags::new(),
            testdata: TestSchedule::default(),
            mailwarn: MailWarnConfig::default(),
        }
    }

    /// Apply `-a`: smartcheck + usagefailed + prefail + usage + selftest +
    /// errorlog, with the default pending-sector ids (spec §4.3)
    pub(crate) fn apply_all_checks(&mut self) {
        self.smartcheck = true;
        self.usagefailed = true;
        self.prefail = true;
        self.usage = true;
        self.selftest = true;
        self.errorlog = true;
        self.pending = PendingSectorIds {
            current_pending: Some(197),
            offline_uncorrectable: Some(198),
        };
    }

    /// Whether at least one check-enabling directive is currently set
    /// (spec §3 invariant: "after registration, at least one check must be
    /// enabled; otherwise the entry is rejected")
    pub(crate) fn any_check_enabled(&self) -> bool {
        self.smartcheck
            || self.usagefailed
            || self.prefail
            || self.usage
            || self.selftest
            || self.errorlog
            || self.pending.current_pending.is_some()
            || self.pending.offline_uncorrectable.is_some()
            || self.tempdiff > 0
            || self.tempinfo > 0
            || self.tempcrit > 0
    }
}

/// Per-device mutable monitoring state (spec §3 `DeviceState`)
#[derive(Clone, Debug, Default)]
pub(crate) struct DeviceState {
    /// Cached attribute values from the last successful read
    pub smartval: Option<AtaAttributeTable>,
    /// Cached attribute thresholds from the last successful read
    pub smartthres: Option<AtaThresholdTable>,
    /// Cached self-test log failure count
    pub selflogcount: u32,
    /// Cached self-test log most-recent-entry hour stamp
    pub selfloghour: u16,
    /// Cached ATA error log count (or SCSI failed-self-test count)
    pub ataerrorcount: u32,
    /// Temperature hysteresis tracker
    pub temp: TemperatureTracker,
    /// Consecutive cycles skipped due to power-mode gating
    pub powerskipcnt: u32,
    /// SCSI: Informational Exceptions log page supported
    pub smart_page_supported: bool,
    /// SCSI: temperature log page supported
    pub temp_page_supported: bool,
    /// SCSI: IE check failed once during registration; temperature/health
    /// reporting from the log is suppressed
    pub suppress_report: bool,
    /// SCSI: mode-sense header length, as reported by the IEC mode page
    pub modese_len: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_has_no_checks_enabled() {
        let cfg = DeviceConfig::new("/dev/sda", 1);
        assert!(!cfg.any_check_enabled());
    }

    #[test]
    fn apply_all_checks_enables_everything_a_implies() {
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.apply_all_checks();
        assert!(cfg.smartcheck && cfg.usagefailed && cfg.prefail && cfg.usage);
        assert!(cfg.selftest && cfg.errorlog);
        assert_eq!(cfg.pending.current_pending, Some(197));
        assert_eq!(cfg.pending.offline_uncorrectable, Some(198));
    }

    #[test]
    fn zero_pending_ids_disable_monitoring() {
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.pending = PendingSectorIds::default();
        assert!(!cfg.any_check_enabled());
    }

    #[test]
    fn not_capable_tracks_each_letter_independently() {
        let mut nc = NotCapable::default();
        nc.mark(SelfTestType::Conveyance);
        assert!(nc.is_set(SelfTestType::Conveyance));
        assert!(!nc.is_set(SelfTestType::Long));
    }
}
