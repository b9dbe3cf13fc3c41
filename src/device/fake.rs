//! Scripted fake device for exercising registration and the check engine
//! without real hardware, the Rust equivalent of the teacher's
//! `BinaryMock` (which mocks a subprocess rather than a whole device).

use std::{collections::VecDeque, fmt};

use super::{
    AtaAttributeTable, AtaThresholdTable, Device, DevType, HealthStatus, IeResult, PowerMode,
    PrimitiveError, PrimitiveResult, ScsiLogPageSupport, SelfTestLogSummary, SelfTestType,
    TestUnitReady,
};

/// One scripted response, consumed in order by the matching primitive
#[derive(Clone)]
pub(crate) enum Script<T> {
    /// Return this value
    Value(T),
    /// Fail with "unsupported"
    Unsupported(String),
    /// Fail with an I/O-ish error
    Error(String),
}

impl<T> Script<T> {
    /// Convert to the primitive result this call would produce
    fn into_result(self) -> PrimitiveResult<T> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Unsupported(s) => Err(PrimitiveError::Unsupported(s)),
            Self::Error(s) => Err(PrimitiveError::Other(anyhow::anyhow!(s))),
        }
    }
}

/// A queue of scripted responses for one primitive; each call pops the
/// front entry, and the last entry repeats once the queue is drained so a
/// test does not need to script every single cycle explicitly.
struct ScriptQueue<T> {
    /// Remaining scripted responses
    queue: VecDeque<Script<T>>,
}

impl<T> Default for ScriptQueue<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<T: Clone> ScriptQueue<T> {
    /// Queue one more scripted response
    fn push(&mut self, s: Script<T>) {
        self.queue.push_back(s);
    }

    /// Pop the next response, repeating the last scripted one if drained
    fn next(&mut self) -> PrimitiveResult<T> {
        if self.queue.len() > 1 {
            #[expect(clippy::unwrap_used)] // checked non-empty above
            self.queue.pop_front().unwrap().into_result()
        } else if let Some(last) = self.queue.front().cloned() {
            last.into_result()
        } else {
            Err(PrimitiveError::Other(anyhow::anyhow!(
                "fake device: no script queued for this primitive"
            )))
        }
    }
}

/// A fully scripted [`Device`] implementation
#[derive(Default)]
pub(crate) struct FakeDevice {
    /// Display name
    pub name: String,
    /// Device family to report
    pub dev_type: DevType,
    /// Whether `open` fails
    pub open_fails: bool,
    smart_supported: ScriptQueue<bool>,
    smart_status: ScriptQueue<HealthStatus>,
    values: ScriptQueue<AtaAttributeTable>,
    thresholds: ScriptQueue<AtaThresholdTable>,
    error_log: ScriptQueue<u32>,
    self_test_log: ScriptQueue<SelfTestLogSummary>,
    power_mode: ScriptQueue<PowerMode>,
    test_unit_ready: ScriptQueue<TestUnitReady>,
    iec_mode_page: ScriptQueue<(u8, bool)>,
    log_pages: ScriptQueue<ScsiLogPageSupport>,
    ie: ScriptQueue<IeResult>,
    scsi_self_test_failed: ScriptQueue<u32>,
    /// Self-tests that were launched, in order
    pub launched_self_tests: Vec<SelfTestType>,
}

impl fmt::Display for FakeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl FakeDevice {
    /// Build a fake ATA device with the given name
    pub(crate) fn new_ata(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            dev_type: DevType::Ata,
            ..Default::default()
        }
    }

    /// Build a fake SCSI device with the given name
    pub(crate) fn new_scsi(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            dev_type: DevType::Scsi,
            ..Default::default()
        }
    }

    /// Queue a health-status response
    pub(crate) fn script_smart_status(&mut self, s: Script<HealthStatus>) -> &mut Self {
        self.smart_status.push(s);
        self
    }

    /// Queue a smart-supported response
    pub(crate) fn script_smart_supported(&mut self, s: Script<bool>) -> &mut Self {
        self.smart_supported.push(s);
        self
    }

    /// Queue an attribute-values response
    pub(crate) fn script_values(&mut self, s: Script<AtaAttributeTable>) -> &mut Self {
        self.values.push(s);
        self
    }

    /// Queue a thresholds response
    pub(crate) fn script_thresholds(&mut self, s: Script<AtaThresholdTable>) -> &mut Self {
        self.thresholds.push(s);
        self
    }

    /// Queue an error-log-count response
    pub(crate) fn script_error_log(&mut self, s: Script<u32>) -> &mut Self {
        self.error_log.push(s);
        self
    }

    /// Queue a self-test-log-summary response
    pub(crate) fn script_self_test_log(&mut self, s: Script<SelfTestLogSummary>) -> &mut Self {
        self.self_test_log.push(s);
        self
    }

    /// Queue a power-mode response
    pub(crate) fn script_power_mode(&mut self, s: Script<PowerMode>) -> &mut Self {
        self.power_mode.push(s);
        self
    }

    /// Queue a test-unit-ready response
    pub(crate) fn script_test_unit_ready(&mut self, s: Script<TestUnitReady>) -> &mut Self {
        self.test_unit_ready.push(s);
        self
    }

    /// Queue an IEC mode page response
    pub(crate) fn script_iec_mode_page(&mut self, s: Script<(u8, bool)>) -> &mut Self {
        self.iec_mode_page.push(s);
        self
    }

    /// Queue a supported-log-pages response
    pub(crate) fn script_log_pages(&mut self, s: Script<ScsiLogPageSupport>) -> &mut Self {
        self.log_pages.push(s);
        self
    }

    /// Queue an IE-check response
    pub(crate) fn script_ie(&mut self, s: Script<IeResult>) -> &mut Self {
        self.ie.push(s);
        self
    }

    /// Queue a SCSI failed-self-test-count response
    pub(crate) fn script_scsi_self_test_failed(&mut self, s: Script<u32>) -> &mut Self {
        self.scsi_self_test_failed.push(s);
        self
    }
}

impl Device for FakeDevice {
    fn open(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.open_fails, "fake device: open failed");
        Ok(())
    }

    fn close(&mut self) {}

    fn dev_type(&self) -> DevType {
        self.dev_type
    }

    fn ata_identify(&mut self) -> PrimitiveResult<()> {
        Ok(())
    }

    fn ata_smart_supported(&mut self) -> PrimitiveResult<bool> {
        self.smart_supported.next()
    }

    fn ata_smart_enable(&mut self) -> PrimitiveResult<()> {
        Ok(())
    }

    fn ata_smart_status(&mut self) -> PrimitiveResult<HealthStatus> {
        self.smart_status.next()
    }

    fn ata_read_values(&mut self) -> PrimitiveResult<AtaAttributeTable> {
        self.values.next()
    }

    fn ata_read_thresholds(&mut self) -> PrimitiveResult<AtaThresholdTable> {
        self.thresholds.next()
    }

    fn ata_read_error_log(&mut self) -> PrimitiveResult<u32> {
        self.error_log.next()
    }

    fn ata_read_self_test_log(&mut self) -> PrimitiveResult<SelfTestLogSummary> {
        self.self_test_log.next()
    }

    fn ata_check_power_mode(&mut self) -> PrimitiveResult<PowerMode> {
        self.power_mode.next()
    }

    fn ata_set_autosave(&mut self, _enable: bool) -> PrimitiveResult<()> {
        Ok(())
    }

    fn ata_set_auto_offline(&mut self, _enable: bool) -> PrimitiveResult<()> {
        Ok(())
    }

    fn ata_run_self_test(&mut self, test: SelfTestType) -> PrimitiveResult<()> {
        self.launched_self_tests.push(test);
        Ok(())
    }

    fn scsi_test_unit_ready(&mut self) -> PrimitiveResult<TestUnitReady> {
        self.test_unit_ready.next()
    }

    fn scsi_fetch_iec_mode_page(&mut self) -> PrimitiveResult<(u8, bool)> {
        self.iec_mode_page.next()
    }

    fn scsi_supported_log_pages(&mut self) -> PrimitiveResult<ScsiLogPageSupport> {
        self.log_pages.next()
    }

    fn scsi_check_ie(&mut self) -> PrimitiveResult<IeResult> {
        self.ie.next()
    }

    fn scsi_self_test_failed_count(&mut self) -> PrimitiveResult<u32> {
        self.scsi_self_test_failed.next()
    }

    fn scsi_run_self_test(&mut self, long: bool) -> PrimitiveResult<()> {
        self.launched_self_tests.push(if long {
            SelfTestType::Long
        } else {
            SelfTestType::Short
        });
        Ok(())
    }

    fn scsi_set_gltsd(&mut self, _disable: bool) -> PrimitiveResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_last_scripted_value() {
        let mut dev = FakeDevice::new_ata("fake0");
        dev.script_smart_status(Script::Value(HealthStatus::Ok));
        assert_eq!(dev.ata_smart_status().unwrap(), HealthStatus::Ok);
        assert_eq!(dev.ata_smart_status().unwrap(), HealthStatus::Ok);
    }

    #[test]
    fn plays_scripted_sequence_in_order() {
        let mut dev = FakeDevice::new_ata("fake0");
        dev.script_smart_status(Script::Value(HealthStatus::Ok))
            .script_smart_status(Script::Value(HealthStatus::Failed));
        assert_eq!(dev.ata_smart_status().unwrap(), HealthStatus::Ok);
        assert_eq!(dev.ata_smart_status().unwrap(), HealthStatus::Failed);
        assert_eq!(dev.ata_smart_status().unwrap(), HealthStatus::Failed);
    }

    #[test]
    fn open_can_be_scripted_to_fail() {
        let mut dev = FakeDevice::new_ata("fake0");
        dev.open_fails = true;
        assert!(dev.open().is_err());
    }

    #[test]
    fn records_launched_self_tests() {
        let mut dev = FakeDevice::new_ata("fake0");
        dev.ata_run_self_test(SelfTestType::Long).unwrap();
        assert_eq!(dev.launched_self_tests, vec![SelfTestType::Long]);
    }
}
