//! Warning/email dispatch and its rate-limiting policy (spec §4.4).
//!
//! Grounded on `original_source/smartd.cpp`'s `MailWarning()`: one
//! function that decides whether to send, composes the message, runs a
//! subprocess, and updates the per-class rate-limit counters only once
//! the subprocess has actually been launched.

use std::{
    io::{Read as _, Write as _},
    process::{Command, Stdio},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use chrono::TimeZone as _;
use itertools::Itertools as _;

use crate::config::{Frequency, MailWarnConfig};

/// Bound on captured subprocess stdout/stderr, mirroring the original's
/// 1 MiB pipe-flush cutoff
const MAX_CAPTURED_OUTPUT: usize = 1024 * 1024;

/// Notification failure class (spec §7); order and names are fixed since
/// they index [`MailWarnConfig::maillog`] and appear in `SMARTD_FAILTYPE`
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub(crate) enum FailureClass {
    /// Class 0: the one-shot startup test message
    EmailTest,
    /// Class 1: overall SMART health status failed
    Health,
    /// Class 2: a usage attribute crossed its failure threshold
    Usage,
    /// Class 3: a new self-test log entry recorded a failure
    SelfTest,
    /// Class 4: the ATA/SCSI error count increased
    ErrorCount,
    /// Class 5: the health-status primitive itself failed
    FailedHealthCheck,
    /// Class 6: reading the attribute value/threshold pages failed
    FailedReadSmartData,
    /// Class 7: reading the error log failed
    FailedReadSmartErrorLog,
    /// Class 8: reading the self-test log failed
    FailedReadSmartSelfTestLog,
    /// Class 9: opening the device failed
    FailedOpenDevice,
    /// Class 10: current-pending-sector count increased
    CurrentPendingSector,
    /// Class 11: offline-uncorrectable count increased
    OfflineUncorrectableSector,
    /// Class 12: a temperature threshold was crossed
    Temperature,
}

impl FailureClass {
    /// Index into [`MailWarnConfig::maillog`]
    fn index(self) -> usize {
        self as usize
    }
}

/// Dispatch one warning for `class`, subject to the rate-limit policy.
/// `message` is the already-formatted warning text; `device_name` and
/// `dev_type` are exported to the subprocess environment.
///
/// Returns `Ok(true)` if a notification was actually sent/executed,
/// `Ok(false)` if it was rate-limited or no target is configured.
pub(crate) fn notify(
    mailwarn: &mut MailWarnConfig,
    class: FailureClass,
    device_name: &str,
    dev_type: &str,
    message: &str,
) -> anyhow::Result<bool> {
    if !mailwarn.has_target() {
        return Ok(false);
    }
    let now = now_epoch();
    if !should_send(mailwarn, class, now) {
        return Ok(false);
    }

    let command = mailwarn.exec.clone();
    let address_line = mailwarn
        .addresses
        .iter()
        .filter(|a| *a != "<nomailer>")
        .join(",");

    let log = &mailwarn.maillog[class.index()];
    let firstsent = if log.logged == 0 { now } else { log.firstsent.unwrap_or(now) };

    let subject = format!("SMART error ({class}) detected on host for device {device_name}");
    let full_message = compose_full_message(message, mailwarn, class, now);

    let target_label = if address_line.is_empty() {
        "<nomailer>".to_owned()
    } else {
        address_line.clone()
    };
    log::info!(
        "{} {} to {target_label} ...",
        if matches!(class, FailureClass::EmailTest) {
            "Executing test of"
        } else {
            "Sending warning via"
        },
        command.as_deref().unwrap_or("mail"),
    );

    let result = dispatch(
        command.as_deref(),
        &address_line,
        &subject,
        &full_message,
        device_name,
        dev_type,
        class,
        firstsent,
    );
    match result {
        Ok(()) => {
            log::info!("warning for {device_name} ({class}) dispatched successfully");
            record_dispatch(mailwarn, class, now);
            Ok(true)
        }
        Err(DispatchError::SpawnFailed(e)) => {
            log::error!("warning for {device_name} ({class}) could not be launched: {e:#}");
            Ok(false)
        }
        Err(e) => {
            log::error!("warning for {device_name} ({class}) failed to dispatch: {e:#}");
            // A subprocess that was actually spawned still counts towards
            // the rate limit even if it then failed, so a broken mailer
            // cannot be used to re-trigger a warning every cycle.
            record_dispatch(mailwarn, class, now);
            Ok(true)
        }
    }
}

/// Record that a warning for `class` was actually sent, updating the
/// rate-limit bookkeeping read by [`should_send`]
fn record_dispatch(mailwarn: &mut MailWarnConfig, class: FailureClass, now: i64) {
    let log = &mut mailwarn.maillog[class.index()];
    if log.firstsent.is_none() {
        log.firstsent = Some(now);
    }
    log.lastsent = Some(now);
    log.logged = log.logged.saturating_add(1);
}

/// Whether `class` should fire right now, given `mailwarn`'s frequency
/// policy and per-class history (spec §4.4 / `MailWarning()`)
fn should_send(mailwarn: &MailWarnConfig, class: FailureClass, now: i64) -> bool {
    let log = &mailwarn.maillog[class.index()];
    if matches!(class, FailureClass::EmailTest) && log.logged > 0 {
        return false;
    }
    match mailwarn.frequency {
        Frequency::Once => log.logged == 0,
        Frequency::Daily => {
            log.logged == 0 || log.lastsent.is_none_or(|last| now >= last + 24 * 3600)
        }
        Frequency::Diminishing => {
            if log.logged == 0 {
                return true;
            }
            let days = 1i64 << (log.logged.min(62) - 1);
            log.lastsent
                .is_none_or(|last| now >= last + days * 24 * 3600)
        }
    }
}

/// Build the full email body, echoing the original's host/domain/"further
/// investigation"/"additional messages" boilerplate
fn compose_full_message(
    message: &str,
    mailwarn: &MailWarnConfig,
    class: FailureClass,
    now: i64,
) -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "[Unknown]".to_owned());

    let further = if matches!(class, FailureClass::EmailTest) {
        String::new()
    } else {
        "You can also use the smartctl utility for further investigation.\n".to_owned()
    };

    let log = mailwarn.maillog[class.index()];
    let additional = match mailwarn.frequency {
        Frequency::Once => "No additional email messages about this problem will be sent.\n".to_owned(),
        Frequency::Daily => {
            "Another email message will be sent in 24 hours if the problem persists.\n".to_owned()
        }
        Frequency::Diminishing => {
            let days = 1i64 << log.logged.min(62);
            format!("Another email message will be sent in {days} days if the problem persists\n")
        }
    };

    let original = if !matches!(mailwarn.frequency, Frequency::Once) && log.logged > 0 {
        log.firstsent.map_or_else(String::new, |first| {
            format!("The original email about this issue was sent at epoch {first}\n")
        })
    } else {
        String::new()
    };

    format!(
        "This email was generated by the smartd daemon running on:\n\n   host name: {hostname}\n\nThe following warning/error was logged by the smartd daemon:\n\n{message}\n\nFor details see host's SYSLOG (default: /var/log/messages).\n\n{further}{original}{additional}(epoch {now})\n"
    )
}

/// A dispatch attempt that never got a subprocess running (bad exec line,
/// `spawn()` failure) versus one that did but then misbehaved; only the
/// latter counts towards the rate limit, since a warning was genuinely
/// delivered (or at least handed to something that tried).
#[derive(thiserror::Error, Debug)]
enum DispatchError {
    #[error("could not launch mailer/exec: {0:#}")]
    SpawnFailed(anyhow::Error),
    #[error("failed waiting on mailer/exec: {0:#}")]
    WaitFailed(anyhow::Error),
    #[error("mailer/exec exited with non-success status: {0}")]
    NonZeroExit(std::process::ExitStatus),
}

/// Run the mailer/exec subprocess, exporting the environment variables
/// user scripts rely on, and capture/flush any unexpected stdout/stderr.
/// `firstsent` is the epoch at which this failure class first fired, not
/// necessarily the time of this particular dispatch.
#[expect(clippy::too_many_arguments)]
fn dispatch(
    command: Option<&str>,
    address: &str,
    subject: &str,
    full_message: &str,
    device_name: &str,
    dev_type: &str,
    class: FailureClass,
    firstsent: i64,
) -> Result<(), DispatchError> {
    let executable = command.unwrap_or("mail");
    let mut cmd =
        build_command(executable, address, subject).map_err(DispatchError::SpawnFailed)?;
    cmd.env("SMARTD_MAILER", executable)
        .env("SMARTD_MESSAGE", subject)
        .env("SMARTD_SUBJECT", subject)
        .env("SMARTD_TFIRST", format_epoch(firstsent))
        .env("SMARTD_TFIRSTEPOCH", firstsent.to_string())
        .env("SMARTD_FAILTYPE", class.to_string())
        .env("SMARTD_DEVICESTRING", device_name)
        .env("SMARTD_DEVICETYPE", dev_type)
        .env("SMARTD_DEVICE", device_name)
        .env("SMARTD_FULLMESSAGE", full_message);
    if !address.is_empty() {
        cmd.env("SMARTD_ADDRESS", address);
    }

    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to launch {executable}"))
        .map_err(DispatchError::SpawnFailed)?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(full_message.as_bytes());
    }

    let status = child
        .wait()
        .with_context(|| format!("failed to wait on {executable}"))
        .map_err(DispatchError::WaitFailed)?;

    let mut captured = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out
            .take(u64::try_from(MAX_CAPTURED_OUTPUT).unwrap_or(u64::MAX))
            .read_to_end(&mut captured);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err
            .take(u64::try_from(MAX_CAPTURED_OUTPUT).unwrap_or(u64::MAX))
            .read_to_end(&mut captured);
    }
    if !captured.is_empty() {
        log::warn!(
            "{executable} produced {} bytes of unexpected output on stdout/stderr",
            captured.len()
        );
    }

    if status.success() {
        Ok(())
    } else {
        Err(DispatchError::NonZeroExit(status))
    }
}

/// Build the `Command` to run: a real mailer when `address` is non-empty
/// and no explicit exec was given, else the configured exec line verbatim
fn build_command(executable: &str, address: &str, subject: &str) -> anyhow::Result<Command> {
    if address.is_empty() {
        let mut parts = executable.split_whitespace();
        let program = parts.next().context("empty -M exec command line")?;
        let mut cmd = Command::new(program);
        cmd.args(parts);
        Ok(cmd)
    } else {
        let mut cmd = Command::new(executable);
        cmd.arg("-s").arg(subject);
        for addr in address.split(',') {
            cmd.arg(addr);
        }
        Ok(cmd)
    }
}

/// Current epoch seconds
fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Human-readable local rendering of an epoch, for `SMARTD_TFIRST`
fn format_epoch(epoch: i64) -> String {
    chrono::Local
        .timestamp_opt(epoch, 0)
        .single()
        .map_or_else(|| epoch.to_string(), |dt| dt.format("%a %b %e %T %Y %Z").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailLog;

    fn config_with(addresses: &[&str], exec: Option<&str>, frequency: Frequency) -> MailWarnConfig {
        MailWarnConfig {
            addresses: addresses.iter().map(|a| (*a).to_owned()).collect(),
            exec: exec.map(ToOwned::to_owned),
            emailtest: false,
            frequency,
            maillog: [MailLog::default(); crate::config::N_MAIL_CLASSES],
        }
    }

    #[test]
    fn no_target_means_no_dispatch() {
        let mut cfg = config_with(&[], None, Frequency::Once);
        let sent = notify(&mut cfg, FailureClass::Health, "/dev/sda", "ata", "bad").unwrap();
        assert!(!sent);
    }

    #[test]
    fn once_frequency_fires_a_single_time() {
        let mut cfg = config_with(&[], Some("/bin/true"), Frequency::Once);
        assert!(notify(&mut cfg, FailureClass::Health, "/dev/sda", "ata", "bad").unwrap());
        assert_eq!(cfg.maillog[FailureClass::Health.index()].logged, 1);
        assert!(!should_send(&cfg, FailureClass::Health, now_epoch()));
        assert!(!notify(&mut cfg, FailureClass::Health, "/dev/sda", "ata", "bad").unwrap());
        assert_eq!(cfg.maillog[FailureClass::Health.index()].logged, 1);
    }

    #[test]
    fn daily_frequency_blocks_within_24_hours() {
        let mut cfg = config_with(&[], Some("/bin/true"), Frequency::Daily);
        let now = now_epoch();
        cfg.maillog[FailureClass::Usage.index()] = MailLog {
            logged: 1,
            firstsent: Some(now),
            lastsent: Some(now),
        };
        assert!(!should_send(&cfg, FailureClass::Usage, now + 3600));
        assert!(should_send(&cfg, FailureClass::Usage, now + 25 * 3600));
    }

    #[test]
    fn diminishing_frequency_doubles_the_wait_each_time() {
        let mut cfg = config_with(&[], Some("/bin/true"), Frequency::Diminishing);
        let now = now_epoch();
        cfg.maillog[FailureClass::Temperature.index()] = MailLog {
            logged: 3,
            firstsent: Some(now - 10 * 24 * 3600),
            lastsent: Some(now - 3 * 24 * 3600),
        };
        // logged=3 -> wait 2^(3-1)=4 days since lastsent
        assert!(!should_send(&cfg, FailureClass::Temperature, now));
        assert!(should_send(&cfg, FailureClass::Temperature, now + 2 * 24 * 3600));
    }

    #[test]
    fn email_test_class_fires_only_once_regardless_of_frequency() {
        let mut cfg = config_with(&[], Some("/bin/true"), Frequency::Daily);
        cfg.maillog[FailureClass::EmailTest.index()].logged = 1;
        assert!(!should_send(&cfg, FailureClass::EmailTest, now_epoch()));
    }

    #[test]
    fn exec_sees_tfirst_and_tfirstepoch_env_vars() {
        use std::{fs, os::unix::fs::PermissionsExt as _};

        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("env.out");
        let script_path = dir.path().join("dump-env.sh");
        fs::write(
            &script_path,
            format!("#!/bin/sh\nenv > {}\n", out_path.display()),
        )
        .unwrap();
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o700)).unwrap();

        let mut cfg = config_with(&[], Some(script_path.to_str().unwrap()), Frequency::Once);
        assert!(notify(&mut cfg, FailureClass::Health, "/dev/sda", "ata", "msg").unwrap());
        let env_dump = fs::read_to_string(&out_path).unwrap();
        assert!(env_dump.contains("SMARTD_TFIRSTEPOCH="));
        assert!(env_dump.contains("SMARTD_TFIRST="));
    }

    #[test]
    fn nomailer_with_exec_runs_exec_only() {
        let mut cfg = config_with(&["<nomailer>"], Some("/bin/true"), Frequency::Once);
        let sent = notify(&mut cfg, FailureClass::SelfTest, "/dev/sda", "ata", "msg").unwrap();
        assert!(sent);
    }

    #[test]
    fn failing_exec_still_counts_towards_rate_limit() {
        let mut cfg = config_with(&[], Some("/bin/false"), Frequency::Once);
        let sent = notify(&mut cfg, FailureClass::Health, "/dev/sda", "ata", "msg").unwrap();
        assert!(sent);
        assert!(cfg.maillog[FailureClass::Health.index()].lastsent.is_some());
        assert_eq!(cfg.maillog[FailureClass::Health.index()].logged, 1);
    }

    #[test]
    fn unlaunchable_exec_does_not_count_towards_rate_limit() {
        let mut cfg = config_with(&[], Some(""), Frequency::Once);
        let sent = notify(&mut cfg, FailureClass::Health, "/dev/sda", "ata", "msg").unwrap();
        assert!(!sent);
        assert_eq!(cfg.maillog[FailureClass::Health.index()].logged, 0);
        assert!(cfg.maillog[FailureClass::Health.index()].lastsent.is_none());
    }
}
