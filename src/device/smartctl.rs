//! Production [`Device`] backend, shelling out to `smartctl -j` and
//! parsing its JSON output.
//!
//! Grounded on the teacher's own pattern of shelling to `hdparm`/`smartctl`
//! (`device::drive::Drive::model`, `probe::smartctl`): build the argument
//! vector, run with stdin/stderr nulled and `LANG=C`, check the exit
//! status, then parse stdout. The teacher parses `smartctl`'s plain-text
//! tables with `str::parse`; this backend instead asks `smartctl` for
//! `-j` (JSON) output and leans on `serde_json`, since the data here is
//! structured (attribute tables, logs) rather than one scalar per line.

use std::{
    fmt,
    path::PathBuf,
    process::{Command, Stdio},
};

use anyhow::Context as _;

use super::{
    AtaAttribute, AtaAttributeTable, AtaThreshold, AtaThresholdTable, Device, DevType,
    HealthStatus, IeResult, PowerMode, PrimitiveError, PrimitiveResult, ScsiLogPageSupport,
    SelfTestLogSummary, SelfTestType, TestUnitReady,
};

/// A device accessed through the `smartctl` command-line tool
pub(crate) struct SmartctlDevice {
    /// Device node, e.g. `/dev/sda`
    dev_path: PathBuf,
    /// `-d TYPE` argument forced on every invocation, if any (e.g. `sat`)
    force_type: Option<String>,
    /// Detected or configured family
    dev_type: DevType,
    /// Whether the device handle has been probed open successfully once
    opened: bool,
}

impl fmt::Display for SmartctlDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dev_path.display())
    }
}

impl SmartctlDevice {
    /// Build a new handle; does not touch the device until `open`
    pub(crate) fn new(dev_path: PathBuf, dev_type: DevType, force_type: Option<String>) -> Self {
        Self {
            dev_path,
            force_type,
            dev_type,
            opened: false,
        }
    }

    /// Run `smartctl -j <extra args> <device>` and parse the JSON output.
    /// `smartctl` exits non-zero on several conditions that still carry a
    /// valid JSON body (e.g. a failed SMART status); only a missing/
    /// unparsable body is treated as an I/O error.
    fn run_json(&self, extra_args: &[&str]) -> anyhow::Result<serde_json::Value> {
        let dev = self
            .dev_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("invalid device path"))?;
        let mut args: Vec<&str> = vec!["-j"];
        if let Some(t) = &self.force_type {
            args.push("-d");
            args.push(t);
        }
        args.extend_from_slice(extra_args);
        args.push(dev);
        log::trace!("smartctl {}", args.join(" "));
        let output = Command::new("smartctl")
            .args(&args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .env("LANG", "C")
            .output()
            .context("failed to spawn smartctl")?;
        let value: serde_json::Value = serde_json::from_slice(&output.stdout)
            .context("failed to parse smartctl JSON output")?;
        Ok(value)
    }

    /// Fetch and cache the top-level "smart_support" section to decide
    /// whether SMART is present
    fn smart_supported(&self) -> anyhow::Result<bool> {
        let value = self.run_json(&["-i"])?;
        Ok(value
            .pointer("/smart_support/available")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false))
    }
}

impl Device for SmartctlDevice {
    fn open(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.dev_path.exists(),
            "device {} does not exist",
            self.dev_path.display()
        );
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn dev_type(&self) -> DevType {
        self.dev_type
    }

    fn ata_identify(&mut self) -> PrimitiveResult<()> {
        self.run_json(&["-i"])
            .map(|_| ())
            .map_err(PrimitiveError::Other)
    }

    fn ata_smart_supported(&mut self) -> PrimitiveResult<bool> {
        self.smart_supported().map_err(PrimitiveError::Other)
    }

    fn ata_smart_enable(&mut self) -> PrimitiveResult<()> {
        self.run_json(&["-s", "on"])
            .map(|_| ())
            .map_err(PrimitiveError::Other)
    }

    fn ata_smart_status(&mut self) -> PrimitiveResult<HealthStatus> {
        let value = self.run_json(&["-H"]).map_err(PrimitiveError::Other)?;
        match value.pointer("/smart_status/passed").and_then(serde_json::Value::as_bool) {
            Some(true) => Ok(HealthStatus::Ok),
            Some(false) => Ok(HealthStatus::Failed),
            None => Ok(HealthStatus::Unsupported),
        }
    }

    fn ata_read_values(&mut self) -> PrimitiveResult<AtaAttributeTable> {
        let value = self.run_json(&["-A"]).map_err(PrimitiveError::Other)?;
        let table = value
            .pointer("/ata_smart_attributes/table")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| PrimitiveError::Unsupported("no attribute table".to_owned()))?;
        table
            .iter()
            .map(parse_attribute)
            .collect::<anyhow::Result<_>>()
            .map_err(PrimitiveError::Other)
    }

    fn ata_read_thresholds(&mut self) -> PrimitiveResult<AtaThresholdTable> {
        let value = self
            .run_json(&["-A", "-v", "thresholds"])
            .map_err(PrimitiveError::Other)?;
        let table = value
            .pointer("/ata_smart_attributes/table")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| PrimitiveError::Unsupported("no attribute table".to_owned()))?;
        table
            .iter()
            .map(parse_threshold)
            .collect::<anyhow::Result<_>>()
            .map_err(PrimitiveError::Other)
    }

    fn ata_read_error_log(&mut self) -> PrimitiveResult<u32> {
        let value = self.run_json(&["-l", "error"]).map_err(PrimitiveError::Other)?;
        value
            .pointer("/ata_smart_error_log/summary/count")
            .and_then(serde_json::Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .ok_or_else(|| PrimitiveError::Unsupported("no ATA error log".to_owned()))
    }

    fn ata_read_self_test_log(&mut self) -> PrimitiveResult<SelfTestLogSummary> {
        let value = self
            .run_json(&["-l", "selftest"])
            .map_err(PrimitiveError::Other)?;
        let standard = value
            .pointer("/ata_smart_self_test_log/standard")
            .ok_or_else(|| PrimitiveError::Unsupported("no self-test log".to_owned()))?;
        let count = standard
            .get("count")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let status = standard
            .pointer("/table/0/status/value")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let most_recent_hour = standard
            .pointer("/table/0/lifetime_hours")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        Ok(SelfTestLogSummary {
            count: u32::try_from(count).unwrap_or(u32::MAX),
            most_recent_hour: u16::try_from(most_recent_hour).unwrap_or(u16::MAX),
            status: u8::try_from(status).unwrap_or(0),
        })
    }

    fn ata_check_power_mode(&mut self) -> PrimitiveResult<PowerMode> {
        let value = self
            .run_json(&["-n", "standby"])
            .map_err(PrimitiveError::Other)?;
        let mode = value
            .get("power_mode")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("ACTIVE");
        Ok(match mode {
            "SLEEP" => PowerMode::Sleep,
            "STANDBY" => PowerMode::Standby,
            "IDLE" => PowerMode::Idle,
            _ => PowerMode::Active,
        })
    }

    fn ata_set_autosave(&mut self, enable: bool) -> PrimitiveResult<()> {
        let flag = if enable { "on" } else { "off" };
        self.run_json(&["-S", flag])
            .map(|_| ())
            .map_err(PrimitiveError::Other)
    }

    fn ata_set_auto_offline(&mut self, enable: bool) -> PrimitiveResult<()> {
        let flag = if enable { "on" } else { "off" };
        self.run_json(&["-o", flag])
            .map(|_| ())
            .map_err(PrimitiveError::Other)
    }

    fn ata_run_self_test(&mut self, test: SelfTestType) -> PrimitiveResult<()> {
        let arg = match test {
            SelfTestType::Offline => "offline",
            SelfTestType::Short => "short",
            SelfTestType::Long => "long",
            SelfTestType::Conveyance => "conveyance",
        };
        self.run_json(&["-t", arg])
            .map(|_| ())
            .map_err(PrimitiveError::Other)
    }

    fn scsi_test_unit_ready(&mut self) -> PrimitiveResult<TestUnitReady> {
        let value = self.run_json(&[]).map_err(PrimitiveError::Other)?;
        let sense_key = value
            .pointer("/temperature/scsi_unit_sense/key")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("NO SENSE");
        Ok(match sense_key {
            "NOT READY" => TestUnitReady::NotReady,
            "NO MEDIUM" => TestUnitReady::NoMedium,
            "BECOMING READY" => TestUnitReady::BecomingReady,
            _ => TestUnitReady::Ready,
        })
    }

    fn scsi_fetch_iec_mode_page(&mut self) -> PrimitiveResult<(u8, bool)> {
        let value = self.run_json(&["-g", "iecmpage"]).map_err(PrimitiveError::Other)?;
        let len = value
            .pointer("/scsi_mode_sense/header_length")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let enabled = value
            .pointer("/scsi_ie_control/dexcpt")
            .and_then(serde_json::Value::as_bool)
            .map(|dexcpt| !dexcpt)
            .unwrap_or(false);
        Ok((u8::try_from(len).unwrap_or(0), enabled))
    }

    fn scsi_supported_log_pages(&mut self) -> PrimitiveResult<ScsiLogPageSupport> {
        let value = self.run_json(&["-l", "all"]).map_err(PrimitiveError::Other)?;
        let pages = value
            .pointer("/scsi_supported_log_pages")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();
        let has = |id: u64| {
            pages
                .iter()
                .any(|p| p.get("page").and_then(serde_json::Value::as_u64) == Some(id))
        };
        Ok(ScsiLogPageSupport {
            temperature: has(0x0D),
            informational_exceptions: has(0x2F),
        })
    }

    fn scsi_check_ie(&mut self) -> PrimitiveResult<IeResult> {
        let value = self.run_json(&["-l", "ie"]).map_err(PrimitiveError::Other)?;
        Ok(IeResult {
            asc: value
                .pointer("/scsi_ie_log/asc")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as u8,
            ascq: value
                .pointer("/scsi_ie_log/ascq")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as u8,
            current_temp: value
                .pointer("/temperature/current")
                .and_then(serde_json::Value::as_u64)
                .map(|v| v as u8),
            trip_temp: value
                .pointer("/scsi_ie_log/trip_temperature")
                .and_then(serde_json::Value::as_u64)
                .map(|v| v as u8),
        })
    }

    fn scsi_self_test_failed_count(&mut self) -> PrimitiveResult<u32> {
        let value = self
            .run_json(&["-l", "selftest"])
            .map_err(PrimitiveError::Other)?;
        value
            .pointer("/scsi_self_test_0/number_of_failed")
            .and_then(serde_json::Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .ok_or_else(|| PrimitiveError::Unsupported("no SCSI self-test log".to_owned()))
    }

    fn scsi_run_self_test(&mut self, long: bool) -> PrimitiveResult<()> {
        let arg = if long { "long" } else { "short" };
        self.run_json(&["-t", arg])
            .map(|_| ())
            .map_err(PrimitiveError::Other)
    }

    fn scsi_set_gltsd(&mut self, disable: bool) -> PrimitiveResult<()> {
        let flag = if disable { "on" } else { "off" };
        self.run_json(&["-s", flag])
            .map(|_| ())
            .map_err(PrimitiveError::Other)
    }
}

/// Parse one attribute-table entry into an [`AtaAttribute`]
fn parse_attribute(entry: &serde_json::Value) -> anyhow::Result<AtaAttribute> {
    let id = entry
        .get("id")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| anyhow::anyhow!("missing attribute id"))?;
    let value = entry
        .get("value")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    let prefail = entry
        .pointer("/flags/prefailure")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    let raw_value = entry
        .pointer("/raw/value")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    let mut raw = [0u8; 6];
    for (i, byte) in raw.iter_mut().enumerate() {
        *byte = u8::try_from((raw_value >> (8 * i)) & 0xFF)?;
    }
    Ok(AtaAttribute {
        id: u8::try_from(id)?,
        flags: u16::from(prefail),
        value: u8::try_from(value)?,
        raw,
    })
}

/// Parse one attribute-table entry into an [`AtaThreshold`]
fn parse_threshold(entry: &serde_json::Value) -> anyhow::Result<AtaThreshold> {
    let id = entry
        .get("id")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| anyhow::anyhow!("missing attribute id"))?;
    let threshold = entry
        .get("thresh")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    Ok(AtaThreshold {
        id: u8::try_from(id)?,
        threshold: u8::try_from(threshold)?,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::tests::BinaryMock;

    #[serial_test::serial]
    #[test]
    fn parses_health_status() {
        let _smartctl = BinaryMock::new(
            "smartctl",
            br#"{"smart_status": {"passed": true}}"#,
            &[],
            0,
        )
        .unwrap();
        let mut dev = SmartctlDevice::new(PathBuf::from("/dev/_sdX"), DevType::Ata, None);
        assert_eq!(dev.ata_smart_status().unwrap(), HealthStatus::Ok);
    }

    #[serial_test::serial]
    #[test]
    fn parses_failed_health_status() {
        let _smartctl = BinaryMock::new(
            "smartctl",
            br#"{"smart_status": {"passed": false}}"#,
            &[],
            1,
        )
        .unwrap();
        let mut dev = SmartctlDevice::new(PathBuf::from("/dev/_sdX"), DevType::Ata, None);
        assert_eq!(dev.ata_smart_status().unwrap(), HealthStatus::Failed);
    }

    #[serial_test::serial]
    #[test]
    fn parses_attribute_table() {
        let json = br#"{
            "ata_smart_attributes": {
                "table": [
                    {"id": 197, "value": 100, "flags": {"prefailure": false}, "raw": {"value": 3}}
                ]
            }
        }"#;
        let _smartctl = BinaryMock::new("smartctl", json, &[], 0).unwrap();
        let mut dev = SmartctlDevice::new(PathBuf::from("/dev/_sdX"), DevType::Ata, None);
        let table = dev.ata_read_values().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].id, 197);
        assert_eq!(table[0].raw_u64(), 3);
    }
}
