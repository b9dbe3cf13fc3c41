//! Per-cycle, per-device evaluation (spec §4.6): the core of what
//! smartd actually does once devices are registered.
//!
//! Grounded on `original_source/smartd.cpp`'s `CheckDevice()`, split
//! here into an ATA path and a SCSI path sharing the open/self-test/
//! error-log/close scaffolding, the way the teacher splits `Prober`
//! implementations behind one call site in `main.rs`.

use std::{thread, time::Duration};

use chrono::{DateTime, Local};

use crate::{
    bitset::AttributeFlagCategory,
    comparator::{compare_attribute, AttributeDelta},
    config::{DeviceConfig, DeviceState},
    device::{Device, DevType, HealthStatus, PowerMode},
    notifier::{self, FailureClass},
    scheduler,
};

/// How long to wait between the two power-mode reads used to absorb a
/// spin-up in progress (spec §4.6 step 4)
const POWER_MODE_SETTLE: Duration = Duration::from_secs(5);

/// Run one check cycle against `device`, mutating `cfg` (scheduler dedup
/// state, mail rate-limit counters) and `state` (cached reads) in place.
pub(crate) fn check_device(
    device: &mut dyn Device,
    cfg: &mut DeviceConfig,
    state: &mut DeviceState,
    now: DateTime<Local>,
) -> anyhow::Result<()> {
    if cfg.mailwarn.emailtest {
        notifier::notify(
            &mut cfg.mailwarn,
            FailureClass::EmailTest,
            &cfg.name,
            &cfg.dev_type.to_string(),
            "SMART email test message",
        )?;
    }

    if let Err(e) = device.open() {
        notifier::notify(
            &mut cfg.mailwarn,
            FailureClass::FailedOpenDevice,
            &cfg.name,
            &cfg.dev_type.to_string(),
            &format!("unable to open device: {e:#}"),
        )?;
        return Ok(());
    }

    let allow_selftests = cfg.testdata.pattern.is_some();
    let due = if allow_selftests {
        scheduler::due_test(&mut cfg.testdata, now)
    } else {
        None
    };

    if cfg.powermode != 0 && due.is_none() {
        match power_mode_gate(device, cfg.powermode) {
            Ok(true) => {
                if state.powerskipcnt == 0 {
                    log::info!("{device}: skipping checks, device is in a low power mode");
                }
                state.powerskipcnt += 1;
                device.close();
                return Ok(());
            }
            Ok(false) => {
                if state.powerskipcnt > 0 {
                    log::info!(
                        "{device}: resuming checks after {} skipped cycles",
                        state.powerskipcnt
                    );
                    state.powerskipcnt = 0;
                }
            }
            Err(e) => {
                log::error!("{device}: failed to read power mode, disabling -n check: {e:#}");
                cfg.powermode = 0;
            }
        }
    }

    if device.dev_type() == DevType::Scsi {
        check_scsi(device, cfg, state)?;
    } else {
        check_ata(device, cfg, state)?;
    }

    if let Some(test) = due {
        match scheduler::launch(device, test, cfg.fixfirmwarebug, &mut cfg.testdata.not_capable) {
            Ok(_) => {}
            Err(e) => log::error!("{device}: failed to launch self-test {test}: {e:#}"),
        }
    }

    device.close();
    Ok(())
}

/// Read the power mode twice, 5 seconds apart, and decide whether this
/// cycle should be skipped. Returns `Ok(true)` to skip.
fn power_mode_gate(device: &mut dyn Device, threshold: u8) -> anyhow::Result<bool> {
    let first = device.ata_check_power_mode()?;
    if !first.should_skip(threshold) {
        return Ok(false);
    }
    thread::sleep(POWER_MODE_SETTLE);
    let second = device.ata_check_power_mode()?;
    Ok(power_mode_decision(first, second, threshold))
}

/// Pure decision: skip only if both reads agree the device is at or
/// below the configured threshold
fn power_mode_decision(first: PowerMode, second: PowerMode, threshold: u8) -> bool {
    first.should_skip(threshold) && second.should_skip(threshold)
}

/// ATA check path (spec §4.6 steps 5–8)
fn check_ata(device: &mut dyn Device, cfg: &mut DeviceConfig, state: &mut DeviceState) -> anyhow::Result<()> {
    if cfg.smartcheck {
        match device.ata_smart_status() {
            Ok(HealthStatus::Failed) => {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::Health,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    "device reports SMART overall-health self-assessment FAILED",
                )?;
            }
            Ok(HealthStatus::Unsupported) => {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::FailedHealthCheck,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    "unable to check SMART health status",
                )?;
            }
            Ok(HealthStatus::Ok) => {}
            Err(e) => {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::FailedHealthCheck,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    &format!("unable to check SMART health status: {e}"),
                )?;
            }
        }
    }

    let attribute_checks = cfg.usagefailed
        || cfg.prefail
        || cfg.usage
        || cfg.pending.current_pending.is_some()
        || cfg.pending.offline_uncorrectable.is_some()
        || cfg.tempdiff > 0
        || cfg.tempinfo > 0
        || cfg.tempcrit > 0;
    if attribute_checks {
        match device.ata_read_values() {
            Ok(values) => check_attributes(cfg, state, &values)?,
            Err(e) => {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::FailedReadSmartData,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    &format!("failed to read SMART attribute data: {e}"),
                )?;
            }
        }
    }

    if cfg.selftest {
        match device.ata_read_self_test_log() {
            Ok(summary) => {
                if summary.count > state.selflogcount {
                    notifier::notify(
                        &mut cfg.mailwarn,
                        FailureClass::SelfTest,
                        &cfg.name,
                        &cfg.dev_type.to_string(),
                        "a new self-test log entry recorded a failure",
                    )?;
                } else if summary.most_recent_hour != state.selfloghour {
                    notifier::notify(
                        &mut cfg.mailwarn,
                        FailureClass::SelfTest,
                        &cfg.name,
                        &cfg.dev_type.to_string(),
                        &format!(
                            "new self-test error at hour {}",
                            summary.most_recent_hour
                        ),
                    )?;
                }
                state.selflogcount = summary.count;
                state.selfloghour = summary.most_recent_hour;
            }
            Err(e) => {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::FailedReadSmartSelfTestLog,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    &format!("failed to read self-test log: {e}"),
                )?;
            }
        }
    }

    if cfg.errorlog {
        match device.ata_read_error_log() {
            Ok(count) => {
                if count > state.ataerrorcount {
                    notifier::notify(
                        &mut cfg.mailwarn,
                        FailureClass::ErrorCount,
                        &cfg.name,
                        &cfg.dev_type.to_string(),
                        &format!("ATA error count increased from {} to {count}", state.ataerrorcount),
                    )?;
                }
                state.ataerrorcount = count;
            }
            Err(e) => {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::FailedReadSmartErrorLog,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    &format!("failed to read error log: {e}"),
                )?;
            }
        }
    }

    Ok(())
}

/// Attribute-table sub-step of step 6: pending/offline sectors,
/// temperature, usage-failure scan, and change tracking
fn check_attributes(
    cfg: &mut DeviceConfig,
    state: &mut DeviceState,
    values: &crate::device::AtaAttributeTable,
) -> anyhow::Result<()> {
    if let Some(id) = cfg.pending.current_pending {
        if let Some(a) = values.iter().find(|a| a.id == id) {
            let raw = a.raw_u64();
            if raw > 0 {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::CurrentPendingSector,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    &format!("{raw} current pending sector(s)"),
                )?;
            }
        }
    }
    if let Some(id) = cfg.pending.offline_uncorrectable {
        if let Some(a) = values.iter().find(|a| a.id == id) {
            let raw = a.raw_u64();
            if raw > 0 {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::OfflineUncorrectableSector,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    &format!("{raw} offline uncorrectable sector(s)"),
                )?;
            }
        }
    }

    if cfg.tempdiff > 0 || cfg.tempinfo > 0 || cfg.tempcrit > 0 {
        let temp_attr = values.iter().find(|a| a.id == 194).or_else(|| values.iter().find(|a| a.id == 190));
        if let Some(a) = temp_attr {
            #[expect(clippy::cast_possible_truncation)]
            let current = (a.raw_u64() & 0xFF) as u8;
            let obs = state.temp.observe(current, cfg.tempdiff, cfg.tempinfo, cfg.tempcrit);
            if obs.initial {
                log::info!("{}: initial temperature {current} C", cfg.name);
            } else if obs.changed {
                log::info!(
                    "{}: temperature changed, min {} max {} current {current} C",
                    cfg.name,
                    state.temp.tempmin,
                    state.temp.tempmax
                );
            }
            if obs.critical {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::Temperature,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    &format!("temperature {current} C reached the critical limit of {}", cfg.tempcrit),
                )?;
            } else if obs.info {
                log::info!(
                    "{}: temperature {current} C reached the informational limit of {}",
                    cfg.name,
                    cfg.tempinfo
                );
            }
        }
    }

    if cfg.usagefailed {
        for new in values {
            let old = state
                .smartval
                .as_ref()
                .and_then(|old| old.iter().find(|o| o.id == new.id));
            let threshold_matches = state
                .smartthres
                .as_ref()
                .is_some_and(|thresholds| thresholds.iter().any(|t| t.id == new.id));
            if let AttributeDelta::Changed {
                id,
                new_norm,
                prefail,
                ..
            } = compare_attribute(old, Some(new), threshold_matches)
            {
                if prefail {
                    continue;
                }
                let threshold = state
                    .smartthres
                    .as_ref()
                    .and_then(|thresholds| thresholds.iter().find(|t| t.id == id))
                    .map(|t| t.threshold);
                let crossed = threshold.is_some_and(|t| new_norm <= t);
                if crossed && !cfg.monitorattflags.is_off(AttributeFlagCategory::FailUse, id) {
                    notifier::notify(
                        &mut cfg.mailwarn,
                        FailureClass::Usage,
                        &cfg.name,
                        &cfg.dev_type.to_string(),
                        &format!("usage attribute {id} crossed its failure threshold"),
                    )?;
                }
            }
        }
    }

    if cfg.usage || cfg.prefail {
        for new in values {
            let old = state
                .smartval
                .as_ref()
                .and_then(|old| old.iter().find(|o| o.id == new.id));
            let threshold_matches = state
                .smartthres
                .as_ref()
                .is_some_and(|thresholds| thresholds.iter().any(|t| t.id == new.id));
            if let AttributeDelta::Changed {
                id,
                old_norm,
                new_norm,
                prefail,
                same_norm,
            } = compare_attribute(old, Some(new), threshold_matches)
            {
                if cfg.monitorattflags.is_off(AttributeFlagCategory::Ignore, id) {
                    continue;
                }
                if (prefail && !cfg.prefail) || (!prefail && !cfg.usage) {
                    continue;
                }
                if same_norm && !cfg.monitorattflags.is_off(AttributeFlagCategory::Raw, id) {
                    continue;
                }
                let kind = if prefail { "Prefailure" } else { "Usage" };
                if cfg.monitorattflags.is_off(AttributeFlagCategory::RawPrint, id) {
                    let raw_before = old.map(crate::device::AtaAttribute::raw_u64).unwrap_or_default();
                    let raw_after = new.raw_u64();
                    log::info!(
                        "{}: {kind} attribute {id} changed from {old_norm} to {new_norm} (raw {raw_before} -> {raw_after})",
                        cfg.name
                    );
                } else {
                    log::info!(
                        "{}: {kind} attribute {id} changed from {old_norm} to {new_norm}",
                        cfg.name
                    );
                }
            }
        }
    }

    state.smartval = Some(values.clone());
    Ok(())
}

/// SCSI check path (spec §4.6, "SCSI path differs")
fn check_scsi(device: &mut dyn Device, cfg: &mut DeviceConfig, state: &mut DeviceState) -> anyhow::Result<()> {
    if cfg.smartcheck && !state.suppress_report {
        match device.scsi_check_ie() {
            Ok(ie) => {
                if ie.is_failure() {
                    notifier::notify(
                        &mut cfg.mailwarn,
                        FailureClass::Health,
                        &cfg.name,
                        &cfg.dev_type.to_string(),
                        &format!(
                            "informational exceptions report asc=0x{:02x} ascq=0x{:02x}",
                            ie.asc, ie.ascq
                        ),
                    )?;
                }
                if let Some(current) = ie.current_temp {
                    let trip = ie.trip_temp.unwrap_or(0);
                    let obs = state.temp.observe(current, cfg.tempdiff, cfg.tempinfo, trip.max(cfg.tempcrit));
                    if obs.critical {
                        notifier::notify(
                            &mut cfg.mailwarn,
                            FailureClass::Temperature,
                            &cfg.name,
                            &cfg.dev_type.to_string(),
                            &format!("temperature {current} C reached the critical limit"),
                        )?;
                    } else if obs.info {
                        log::info!("{}: temperature {current} C reached the informational limit", cfg.name);
                    }
                }
            }
            Err(e) => {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::FailedHealthCheck,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    &format!("informational exceptions check failed: {e}"),
                )?;
            }
        }
    }

    if cfg.errorlog {
        match device.scsi_self_test_failed_count() {
            Ok(count) => {
                if count > state.ataerrorcount {
                    notifier::notify(
                        &mut cfg.mailwarn,
                        FailureClass::ErrorCount,
                        &cfg.name,
                        &cfg.dev_type.to_string(),
                        &format!("self-test failure count increased from {} to {count}", state.ataerrorcount),
                    )?;
                }
                state.ataerrorcount = count;
            }
            Err(e) => {
                notifier::notify(
                    &mut cfg.mailwarn,
                    FailureClass::FailedReadSmartErrorLog,
                    &cfg.name,
                    &cfg.dev_type.to_string(),
                    &format!("failed to read self-test failure counter: {e}"),
                )?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        fake::{FakeDevice, Script},
        AtaAttribute, AtaThreshold,
    };
    use chrono::TimeZone as _;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap()
    }

    fn attr(id: u8, value: u8, raw: u64) -> AtaAttribute {
        let mut bytes = [0u8; 6];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::try_from((raw >> (8 * i)) & 0xFF).unwrap();
        }
        AtaAttribute {
            id,
            flags: 0,
            value,
            raw: bytes,
        }
    }

    #[test]
    fn power_mode_decision_requires_both_reads_to_agree() {
        assert!(power_mode_decision(PowerMode::Sleep, PowerMode::Sleep, 1));
        assert!(!power_mode_decision(PowerMode::Sleep, PowerMode::Active, 1));
    }

    #[test]
    fn open_failure_short_circuits_the_cycle() {
        let mut device = FakeDevice::new_ata("sda");
        device.open_fails = true;
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.apply_all_checks();
        let mut state = DeviceState::default();
        check_device(&mut device, &mut cfg, &mut state, now()).unwrap();
    }

    #[test]
    fn health_failed_is_reported_once() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_smart_status(Script::Value(HealthStatus::Failed));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.smartcheck = true;
        cfg.mailwarn.addresses.push("root@localhost".to_owned());
        cfg.mailwarn.exec = Some("/bin/true".to_owned());
        let mut state = DeviceState::default();
        check_device(&mut device, &mut cfg, &mut state, now()).unwrap();
        assert_eq!(cfg.mailwarn.maillog[FailureClass::Health as usize].logged, 1);
        assert!(cfg.mailwarn.maillog[FailureClass::Health as usize].lastsent.is_some());
    }

    #[test]
    fn pending_sector_growth_triggers_warning() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_values(Script::Value(vec![attr(197, 100, 3)]));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.pending.current_pending = Some(197);
        cfg.mailwarn.addresses.push("root@localhost".to_owned());
        cfg.mailwarn.exec = Some("/bin/true".to_owned());
        let mut state = DeviceState::default();
        check_device(&mut device, &mut cfg, &mut state, now()).unwrap();
        assert!(cfg.mailwarn.maillog[FailureClass::CurrentPendingSector as usize]
            .lastsent
            .is_some());
    }

    #[test]
    fn self_test_log_count_increase_warns_and_updates_cache() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_self_test_log(Script::Value(crate::device::SelfTestLogSummary {
            count: 2,
            most_recent_hour: 10,
            status: 0,
        }));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.selftest = true;
        cfg.mailwarn.addresses.push("root@localhost".to_owned());
        let mut state = DeviceState {
            selflogcount: 1,
            ..Default::default()
        };
        check_device(&mut device, &mut cfg, &mut state, now()).unwrap();
        assert_eq!(state.selflogcount, 2);
        assert_eq!(state.selfloghour, 10);
    }

    #[test]
    fn error_log_increase_warns_and_updates_cache() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_error_log(Script::Value(5));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.errorlog = true;
        cfg.mailwarn.addresses.push("root@localhost".to_owned());
        let mut state = DeviceState {
            ataerrorcount: 2,
            ..Default::default()
        };
        check_device(&mut device, &mut cfg, &mut state, now()).unwrap();
        assert_eq!(state.ataerrorcount, 5);
    }

    #[test]
    fn usage_attribute_crossing_threshold_is_masked_by_failuse() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_values(Script::Value(vec![attr(5, 2, 0)]));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.usagefailed = true;
        cfg.mailwarn.addresses.push("root@localhost".to_owned());
        cfg.monitorattflags.set(AttributeFlagCategory::FailUse, 5);
        let mut state = DeviceState {
            smartval: Some(vec![attr(5, 50, 0)]),
            smartthres: Some(vec![AtaThreshold { id: 5, threshold: 10 }]),
            ..Default::default()
        };
        check_device(&mut device, &mut cfg, &mut state, now()).unwrap();
        assert!(cfg.mailwarn.maillog[FailureClass::Usage as usize]
            .lastsent
            .is_none());
    }

    #[test]
    fn raw_only_change_is_suppressed_unless_raw_tracking_requested() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_values(Script::Value(vec![attr(197, 100, 3)]));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.usage = true;
        let mut state = DeviceState {
            smartval: Some(vec![attr(197, 100, 0)]),
            smartthres: Some(vec![AtaThreshold { id: 197, threshold: 10 }]),
            ..Default::default()
        };
        check_device(&mut device, &mut cfg, &mut state, now()).unwrap();
        // No -R for id 197: a raw-only change must not be logged as a
        // tracked attribute change (no observable assertion beyond not
        // panicking and the cache still being refreshed).
        assert_eq!(state.smartval.as_ref().unwrap()[0].raw_u64(), 3);
    }

    #[test]
    fn raw_tracking_flag_allows_raw_only_change_through() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_values(Script::Value(vec![attr(197, 100, 3)]));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.usage = true;
        cfg.monitorattflags.set(AttributeFlagCategory::Raw, 197);
        let mut state = DeviceState {
            smartval: Some(vec![attr(197, 100, 0)]),
            smartthres: Some(vec![AtaThreshold { id: 197, threshold: 10 }]),
            ..Default::default()
        };
        // With -R 197 set, the raw-only change must not be filtered out by
        // the `same_norm` short-circuit; this only documents that the call
        // completes without the early `continue`, matching
        // `original_source/smartd.cpp`'s `!IsAttributeOff(..., MONITOR_RAW)` gate.
        check_device(&mut device, &mut cfg, &mut state, now()).unwrap();
        assert_eq!(state.smartval.as_ref().unwrap()[0].raw_u64(), 3);
    }

    #[test]
    fn scsi_ie_failure_reports_health_class() {
        let mut device = FakeDevice::new_scsi("sdb");
        device.script_ie(Script::Value(crate::device::IeResult {
            asc: 0x5d,
            ascq: 0x00,
            current_temp: None,
            trip_temp: None,
        }));
        let mut cfg = DeviceConfig::new("/dev/sdb", 1);
        cfg.smartcheck = true;
        cfg.mailwarn.addresses.push("root@localhost".to_owned());
        cfg.mailwarn.exec = Some("/bin/true".to_owned());
        let mut state = DeviceState::default();
        check_device(&mut device, &mut cfg, &mut state, now()).unwrap();
        assert!(cfg.mailwarn.maillog[FailureClass::Health as usize]
            .lastsent
            .is_some());
    }
}
