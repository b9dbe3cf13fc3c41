//! Self-test scheduling (spec §4.7): extended-regex matching of a
//! synthesized `X/MM/DD/w/HH` string, hour-slot dedup, and the
//! pre-flight 90-day schedule preview for `-q showtests`.
//!
//! Grounded on `original_source/smartd.cpp`'s `DoATASelfTest()` /
//! `ATASelfTestTimePending()`; the dedup formula and SAMSUNG3 busy-status
//! override are lifted verbatim from there.

use chrono::{DateTime, Datelike as _, Local, TimeZone as _, Timelike as _};

use crate::{
    config::{FixFirmwareBug, NotCapable, TestSchedule},
    device::{Device, DevType, SelfTestLogSummary, SelfTestType},
};

/// Self-test letters in the fixed evaluation order the scheduler tries
const LETTER_ORDER: [SelfTestType; 4] = [
    SelfTestType::Long,
    SelfTestType::Short,
    SelfTestType::Conveyance,
    SelfTestType::Offline,
];

/// Outcome of attempting to launch a due self-test
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LaunchOutcome {
    /// The primitive was issued successfully
    Launched,
    /// The device is busy running another self-test
    Busy,
    /// The device does not support this self-test letter
    Unsupported,
}

/// Hour-slot dedup key (spec §4.7): `1 + HH + 24*(yday + 366*(year mod 7))`
fn hour_slot(now: DateTime<Local>) -> u32 {
    let yday = now.ordinal();
    let year_mod7 = now.year().rem_euclid(7);
    #[expect(clippy::cast_sign_loss)]
    let year_mod7 = year_mod7 as u32;
    1 + now.hour() + 24 * (yday + 366 * year_mod7)
}

/// Build the `X/MM/DD/w/HH` string for one candidate letter at `now`
fn schedule_string(letter: SelfTestType, now: DateTime<Local>) -> String {
    format!(
        "{letter}/{:02}/{:02}/{}/{:02}",
        now.month(),
        now.day(),
        now.weekday().number_from_monday(),
        now.hour()
    )
}

/// Check whether a self-test is due this cycle, trying letters in order
/// L, S, C, O and honoring the not-capable bitmap and hour-slot dedup.
/// Mutates `testdata`'s dedup bookkeeping on a match.
pub(crate) fn due_test(testdata: &mut TestSchedule, now: DateTime<Local>) -> Option<SelfTestType> {
    let regex = testdata.regex.as_ref()?;
    let slot = hour_slot(now);
    for letter in LETTER_ORDER {
        if testdata.not_capable.is_set(letter) {
            continue;
        }
        let candidate = schedule_string(letter, now);
        if !regex.is_match(&candidate) {
            continue;
        }
        if testdata.last_hour_slot == Some(slot) {
            if testdata.last_letter != Some(letter) {
                log::info!(
                    "self-test {letter} due in the same hour slot as already-launched {:?}, suppressing",
                    testdata.last_letter
                );
            }
            return None;
        }
        testdata.last_hour_slot = Some(slot);
        testdata.last_letter = Some(letter);
        return Some(letter);
    }
    None
}

/// Launch `test` on `device`, honoring the busy-status and SAMSUNG3
/// quirk rules (spec §4.7), and recording not-capable on refusal.
pub(crate) fn launch(
    device: &mut dyn Device,
    test: SelfTestType,
    fixfirmwarebug: FixFirmwareBug,
    not_capable: &mut NotCapable,
) -> anyhow::Result<LaunchOutcome> {
    if device.dev_type() == DevType::Scsi {
        return launch_scsi(device, test, not_capable);
    }

    if let Ok(summary) = device.ata_read_self_test_log() {
        if is_busy_considering_quirk(summary, fixfirmwarebug) {
            log::info!("{device}: self-test busy, skipping scheduled {test}");
            return Ok(LaunchOutcome::Busy);
        }
    }

    match device.ata_run_self_test(test) {
        Ok(()) => {
            log::info!("{device}: launched self-test {test}");
            Ok(LaunchOutcome::Launched)
        }
        Err(crate::device::PrimitiveError::Unsupported(reason)) => {
            log::info!("{device}: self-test {test} unsupported: {reason}");
            not_capable.mark(test);
            Ok(LaunchOutcome::Unsupported)
        }
        Err(crate::device::PrimitiveError::Other(e)) => Err(e),
    }
}

/// SCSI only distinguishes short/long; conveyance/offline are marked
/// not-capable during registration and never reach this path.
fn launch_scsi(
    device: &mut dyn Device,
    test: SelfTestType,
    not_capable: &mut NotCapable,
) -> anyhow::Result<LaunchOutcome> {
    let long = test == SelfTestType::Long;
    match device.scsi_run_self_test(long) {
        Ok(()) => {
            log::info!("{device}: launched self-test {test}");
            Ok(LaunchOutcome::Launched)
        }
        Err(crate::device::PrimitiveError::Unsupported(reason)) => {
            log::info!("{device}: self-test {test} unsupported: {reason}");
            not_capable.mark(test);
            Ok(LaunchOutcome::Unsupported)
        }
        Err(crate::device::PrimitiveError::Other(e)) => Err(e),
    }
}

/// Whether the self-test log reports busy, applying the SAMSUNG3 quirk
/// override: that firmware uses the fixed byte `0xF0` while busy with an
/// unrelated background task, not an actual self-test, so it is safe to
/// proceed.
fn is_busy_considering_quirk(summary: SelfTestLogSummary, fixfirmwarebug: FixFirmwareBug) -> bool {
    if fixfirmwarebug == FixFirmwareBug::Samsung3
        && summary.status == SelfTestLogSummary::SAMSUNG3_BUSY_STATUS
    {
        return false;
    }
    summary.is_busy()
}

/// One entry in a 90-day schedule preview
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PreviewEntry {
    /// Self-test letter
    pub test: SelfTestType,
    /// When it would run
    pub when: DateTime<Local>,
}

/// Walk the next 90 days in `step_secs` steps, simulating the regex
/// match against future timestamps, and return up to 5 upcoming runs per
/// letter (spec §4.7 pre-flight "test schedule" mode).
pub(crate) fn preview_schedule(
    testdata: &TestSchedule,
    not_capable: NotCapable,
    start: DateTime<Local>,
    step_secs: i64,
) -> Vec<PreviewEntry> {
    let Some(regex) = testdata.regex.as_ref() else {
        return Vec::new();
    };
    let step = step_secs.max(1);
    let horizon = start + chrono::Duration::days(90);
    let mut counts = [0u8; 4];
    let mut out = Vec::new();
    let mut cursor = start;
    let mut last_slot_seen: Option<(u32, SelfTestType)> = None;
    while cursor < horizon {
        let slot = hour_slot(cursor);
        for (idx, letter) in LETTER_ORDER.into_iter().enumerate() {
            #[expect(clippy::indexing_slicing)]
            if not_capable.is_set(letter) || counts[idx] >= 5 {
                continue;
            }
            let candidate = schedule_string(letter, cursor);
            if regex.is_match(&candidate) && last_slot_seen != Some((slot, letter)) {
                out.push(PreviewEntry {
                    test: letter,
                    when: cursor,
                });
                #[expect(clippy::indexing_slicing)]
                {
                    counts[idx] += 1;
                }
                last_slot_seen = Some((slot, letter));
                break;
            }
        }
        cursor += chrono::Duration::seconds(step);
    }
    out
}
