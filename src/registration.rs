//! Device registration (spec §4.5): open a configured device once at
//! startup (or scan time), probe which checks it actually supports, and
//! trim or reject the entry accordingly.
//!
//! Grounded on `original_source/smartd.cpp`'s `ATADeviceScan()` /
//! `SCSIDeviceScan()`, split here into two small per-family functions
//! called from one dispatcher, the way the teacher splits
//! `probe::hddtemp`/`probe::hdparm` behind one `Prober` trait.

use crate::{
    cl::DEFAULT_CHECKTIME,
    comparator::TemperatureTracker,
    config::{DeviceConfig, DeviceState},
    device::{Device, DevType, HealthStatus, PrimitiveError, TestUnitReady},
};

/// Why a device entry was rejected outright (spec §4.5 step 4)
#[derive(thiserror::Error, Debug)]
pub(crate) enum RegistrationError {
    /// The device could not be opened at all
    #[error("failed to open device: {0}")]
    OpenFailed(#[source] anyhow::Error),
    /// Every requested check's capability probe failed; nothing is left
    /// to monitor
    #[error("no checks remain enabled after capability probing")]
    NothingToMonitor,
}

/// Register one configured device: open it, probe capabilities, trim
/// unsupported checks in place on `cfg`, and return the initial
/// [`DeviceState`] on success.
///
/// `checktime` is the configured cycle length in seconds, used to seed the
/// temperature tracker's warm-up window (spec §4.6.1: "roughly the first
/// `CHECKTIME` seconds", forced to at least one cycle).
pub(crate) fn register(
    device: &mut dyn Device,
    cfg: &mut DeviceConfig,
    checktime: u32,
) -> Result<DeviceState, RegistrationError> {
    device.open().map_err(RegistrationError::OpenFailed)?;
    let warmup_cycles = (DEFAULT_CHECKTIME / checktime.max(1)).max(1);
    let mut state = DeviceState {
        temp: TemperatureTracker::new(warmup_cycles),
        ..DeviceState::default()
    };

    let outcome = match device.dev_type() {
        DevType::Scsi => register_scsi(device, cfg, &mut state),
        DevType::Ata | DevType::Sat | DevType::Auto => register_ata(device, cfg, &mut state),
    };
    if let Err(e) = outcome {
        log::info!("{device}: registration step failed: {e:#}");
    }

    if !cfg.any_check_enabled() {
        device.close();
        return Err(RegistrationError::NothingToMonitor);
    }
    Ok(state)
}

/// ATA/SAT registration branch (spec §4.5 step 2)
fn register_ata(
    device: &mut dyn Device,
    cfg: &mut DeviceConfig,
    state: &mut DeviceState,
) -> anyhow::Result<()> {
    if let Err(e) = device.ata_identify() {
        log::info!("{device}: IDENTIFY failed: {e:#}");
    }

    match device.ata_smart_supported() {
        Ok(true) => {}
        Ok(false) | Err(PrimitiveError::Unsupported(_)) => {
            if cfg.permissive {
                log::info!("{device}: SMART not supported, continuing (permissive)");
            } else {
                log::info!("{device}: SMART not supported, dropping entry");
                disable_all_ata_checks(cfg);
                return Ok(());
            }
        }
        Err(PrimitiveError::Other(e)) => {
            log::info!("{device}: failed to probe SMART support: {e:#}");
        }
    }

    if let Err(e) = device.ata_smart_enable() {
        log::info!("{device}: failed to enable SMART: {e:#}");
    }
    if !matches!(cfg.autosave, crate::device::TriState::Unset) {
        let enable = matches!(cfg.autosave, crate::device::TriState::Enable);
        if let Err(e) = device.ata_set_autosave(enable) {
            log::info!("{device}: failed to set autosave: {e:#}");
        }
    }
    if !matches!(cfg.autoofflinetest, crate::device::TriState::Unset) {
        let enable = matches!(cfg.autoofflinetest, crate::device::TriState::Enable);
        if let Err(e) = device.ata_set_auto_offline(enable) {
            log::info!("{device}: failed to set auto-offline: {e:#}");
        }
    }

    if cfg.smartcheck {
        match device.ata_smart_status() {
            Ok(HealthStatus::Unsupported) | Err(PrimitiveError::Unsupported(_)) => {
                log::info!("{device}: health-status primitive unsupported, dropping -H check");
                cfg.smartcheck = false;
            }
            Ok(_) => {}
            Err(PrimitiveError::Other(e)) => {
                log::info!("{device}: health-status probe failed: {e:#}");
            }
        }
    }

    let attribute_checks_enabled = cfg.usagefailed
        || cfg.prefail
        || cfg.usage
        || cfg.pending.current_pending.is_some()
        || cfg.pending.offline_uncorrectable.is_some()
        || cfg.tempdiff > 0
        || cfg.tempinfo > 0
        || cfg.tempcrit > 0;
    if attribute_checks_enabled {
        match (device.ata_read_values(), device.ata_read_thresholds()) {
            (Ok(values), Ok(thresholds)) => {
                if let Some(id) = cfg.pending.current_pending {
                    if !values.iter().any(|a| a.id == id) {
                        log::info!("{device}: attribute {id} not present, clearing -C");
                        cfg.pending.current_pending = None;
                    }
                }
                if let Some(id) = cfg.pending.offline_uncorrectable {
                    if !values.iter().any(|a| a.id == id) {
                        log::info!("{device}: attribute {id} not present, clearing -U");
                        cfg.pending.offline_uncorrectable = None;
                    }
                }
                if (cfg.tempdiff > 0 || cfg.tempinfo > 0 || cfg.tempcrit > 0)
                    && !values.iter().any(|a| a.id == 194 || a.id == 190)
                {
                    log::info!("{device}: no temperature attribute reported, clearing -W");
                    cfg.tempdiff = 0;
                    cfg.tempinfo = 0;
                    cfg.tempcrit = 0;
                }
                state.smartval = Some(values);
                state.smartthres = Some(thresholds);
            }
            _ => {
                log::info!("{device}: failed to read attribute value/threshold pages, dropping attribute checks");
                cfg.usagefailed = false;
                cfg.prefail = false;
                cfg.usage = false;
                cfg.pending.current_pending = None;
                cfg.pending.offline_uncorrectable = None;
                cfg.tempdiff = 0;
                cfg.tempinfo = 0;
                cfg.tempcrit = 0;
            }
        }
    }

    if cfg.errorlog || cfg.selftest {
        match device.ata_read_self_test_log() {
            Ok(summary) => {
                state.selflogcount = summary.count;
                state.selfloghour = summary.most_recent_hour;
            }
            Err(e) => {
                log::info!("{device}: self-test log unavailable, dropping -l selftest: {e}");
                cfg.selftest = false;
            }
        }
        if cfg.errorlog {
            if let Err(e) = device.ata_read_error_log() {
                log::info!("{device}: error log unavailable, dropping -l error: {e}");
                cfg.errorlog = false;
            }
        }
    }

    if cfg.powermode > 0 {
        if let Err(e) = device.ata_check_power_mode() {
            log::info!("{device}: power-mode primitive unavailable, clearing -n: {e}");
            cfg.powermode = 0;
        }
    }

    Ok(())
}

/// Disable every ATA check (spec §4.5 step 2: SMART unsupported and not
/// permissive)
fn disable_all_ata_checks(cfg: &mut DeviceConfig) {
    cfg.smartcheck = false;
    cfg.usagefailed = false;
    cfg.prefail = false;
    cfg.usage = false;
    cfg.selftest = false;
    cfg.errorlog = false;
    cfg.pending.current_pending = None;
    cfg.pending.offline_uncorrectable = None;
    cfg.tempdiff = 0;
    cfg.tempinfo = 0;
    cfg.tempcrit = 0;
}

/// SCSI registration branch (spec §4.5 step 3)
fn register_scsi(
    device: &mut dyn Device,
    cfg: &mut DeviceConfig,
    state: &mut DeviceState,
) -> anyhow::Result<()> {
    match device.scsi_test_unit_ready() {
        Ok(TestUnitReady::Ready) => {}
        Ok(TestUnitReady::NotReady | TestUnitReady::NoMedium | TestUnitReady::BecomingReady) => {
            log::info!("{device}: unit not ready, skipping remaining registration steps");
        }
        Err(e) => {
            log::info!("{device}: TEST UNIT READY failed: {e}");
        }
    }

    match device.scsi_fetch_iec_mode_page() {
        Ok((len, enabled)) => {
            state.modese_len = len;
            if !enabled {
                log::info!("{device}: informational exceptions control is disabled");
            }
        }
        Err(e) => {
            log::info!("{device}: IEC mode page unavailable (tolerated): {e}");
        }
    }

    match device.scsi_supported_log_pages() {
        Ok(pages) => {
            state.temp_page_supported = pages.temperature;
            state.smart_page_supported = pages.informational_exceptions;
        }
        Err(e) => {
            log::info!("{device}: failed to enumerate supported log pages: {e}");
        }
    }

    match device.scsi_check_ie() {
        Ok(_) => {}
        Err(e) => {
            log::info!("{device}: informational exceptions check failed, suppressing reports: {e}");
            state.suppress_report = true;
            cfg.tempdiff = 0;
            cfg.tempinfo = 0;
            cfg.tempcrit = 0;
        }
    }

    if cfg.errorlog {
        match device.scsi_self_test_failed_count() {
            Ok(count) => state.ataerrorcount = count,
            Err(e) => {
                log::info!("{device}: self-test failure counter unavailable, dropping -l error: {e}");
                cfg.errorlog = false;
            }
        }
    }

    if !matches!(cfg.autosave, crate::device::TriState::Unset) {
        let disable = matches!(cfg.autosave, crate::device::TriState::Disable);
        if let Err(e) = device.scsi_set_gltsd(disable) {
            log::info!("{device}: failed to set GLTSD: {e}");
        }
    }

    // SCSI has no conveyance or offline-immediate self-test; keep the
    // scheduler from ever picking either letter for this device.
    cfg.testdata.not_capable.conveyance = true;
    cfg.testdata.not_capable.offline = true;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{
        fake::{FakeDevice, Script},
        AtaAttribute, AtaThreshold,
    };

    fn attr(id: u8) -> AtaAttribute {
        AtaAttribute {
            id,
            flags: 0,
            value: 100,
            raw: [0; 6],
        }
    }

    #[test]
    fn smart_unsupported_and_not_permissive_drops_entry() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_smart_supported(Script::Value(false));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.apply_all_checks();
        let result = register(&mut device, &mut cfg, 1800);
        assert!(result.is_err());
    }

    #[test]
    fn smart_unsupported_but_permissive_keeps_entry() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_smart_supported(Script::Value(false));
        device.script_values(Script::Value(vec![attr(197)]));
        device.script_thresholds(Script::Value(vec![AtaThreshold {
            id: 197,
            threshold: 10,
        }]));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.apply_all_checks();
        cfg.permissive = true;
        let result = register(&mut device, &mut cfg, 1800);
        assert!(result.is_ok());
    }

    #[test]
    fn missing_pending_attribute_clears_that_id() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_smart_supported(Script::Value(true));
        device.script_values(Script::Value(vec![attr(5)]));
        device.script_thresholds(Script::Value(vec![]));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.apply_all_checks();
        let _state = register(&mut device, &mut cfg, 1800).unwrap();
        assert_eq!(cfg.pending.current_pending, None);
        assert_eq!(cfg.pending.offline_uncorrectable, None);
    }

    #[test]
    fn self_test_log_failure_drops_selftest_watch_only() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_smart_supported(Script::Value(true));
        device.script_values(Script::Value(vec![attr(197), attr(198)]));
        device.script_thresholds(Script::Value(vec![]));
        device.script_self_test_log(Script::Error("no log".to_owned()));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.apply_all_checks();
        let _state = register(&mut device, &mut cfg, 1800).unwrap();
        assert!(!cfg.selftest);
        assert!(cfg.smartcheck);
    }

    #[test]
    fn scsi_branch_records_log_page_support() {
        let mut device = FakeDevice::new_scsi("sdb");
        device.script_log_pages(Script::Value(crate::device::ScsiLogPageSupport {
            temperature: true,
            informational_exceptions: true,
        }));
        device.script_scsi_self_test_failed(Script::Value(0));
        let mut cfg = DeviceConfig::new("/dev/sdb", 1);
        cfg.apply_all_checks();
        let state = register(&mut device, &mut cfg, 1800).unwrap();
        assert!(state.temp_page_supported);
        assert!(state.smart_page_supported);
    }

    #[test]
    fn scsi_ie_check_failure_suppresses_temperature_reports() {
        let mut device = FakeDevice::new_scsi("sdb");
        device.script_scsi_self_test_failed(Script::Value(0));
        device.script_ie(Script::Error("ie check failed".to_owned()));
        let mut cfg = DeviceConfig::new("/dev/sdb", 1);
        cfg.apply_all_checks();
        cfg.tempdiff = 2;
        let state = register(&mut device, &mut cfg, 1800).unwrap();
        assert!(state.suppress_report);
        assert_eq!(cfg.tempdiff, 0);
    }

    #[test]
    fn nothing_left_to_monitor_is_rejected() {
        let mut device = FakeDevice::new_ata("sda");
        device.script_smart_supported(Script::Value(false));
        let mut cfg = DeviceConfig::new("/dev/sda", 1);
        cfg.smartcheck = true;
        let result = register(&mut device, &mut cfg, 1800);
        assert!(matches!(result, Err(RegistrationError::NothingToMonitor)));
    }
}
