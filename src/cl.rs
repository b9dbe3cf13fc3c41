//! Command line interface (spec §6 "CLI")

use std::{path::PathBuf, str::FromStr};

use clap::Parser;

use crate::logging::Facility;

/// Default check-cycle interval in seconds (`CHECKTIME` in the original)
pub(crate) const DEFAULT_CHECKTIME: u32 = 1800;

/// Parse `-i SEC`: accepted range is `10..=INT_MAX` (spec §8 boundary behavior)
fn interval_secs(s: &str) -> Result<u32, String> {
    clap_num::number_range(s, 10, u32::try_from(i32::MAX).unwrap_or(u32::MAX))
}

/// Quit-mode behavior (`-q`, spec §4.8)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum QuitMode {
    /// Exit if no devices were registered at startup
    #[default]
    Nodev,
    /// Same as `nodev`
    Nodevstartup,
    /// Keep running even with zero registered devices
    Never,
    /// Run one full check cycle against every device, then exit 0
    Onecheck,
    /// Print the upcoming self-test schedule, then exit 0
    Showtests,
    /// Exit on a config-file syntax error, including on reload
    Errors,
}

/// Which ioctl traffic `-r` reports, and how verbosely
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum ReportKind {
    /// Both ATA and SCSI ioctls
    Ioctl,
    /// ATA ioctls only
    Ataioctl,
    /// SCSI ioctls only
    Scsiioctl,
}

/// One `-r TYPE[,N]` setting
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReportSetting {
    /// Which ioctl family to report
    pub kind: ReportKind,
    /// Verbosity level, 1..=3
    pub level: u8,
}

impl FromStr for ReportSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, ',');
        let kind = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or("missing report type")?
            .parse()
            .map_err(|_| format!("invalid report type {s:?}, expected ioctl/ataioctl/scsiioctl"))?;
        let level = parts
            .next()
            .map(str::parse)
            .transpose()
            .map_err(|_| "invalid report level".to_owned())?
            .unwrap_or(1);
        if !(1..=3).contains(&level) {
            return Err("report level must be between 1 and 3".to_owned());
        }
        Ok(Self { kind, level })
    }
}

/// SMART monitoring daemon
#[derive(Parser, Debug)]
#[command(version, about)]
pub(crate) struct Args {
    /// Alternate configuration file, or `-` to read it from stdin
    #[arg(short = 'c', long = "config-file", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Run in the foreground and log to stderr instead of syslog
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Print the configuration directives help text, then exit
    #[arg(short = 'D', long = "directives-help")]
    pub directives_help: bool,

    /// Seconds between check cycles
    #[arg(short = 'i', long = "interval", value_parser = interval_secs, default_value_t = DEFAULT_CHECKTIME)]
    pub interval: u32,

    /// Syslog facility used when daemonized
    #[arg(short = 'l', long = "facility", default_value_t = Facility::Daemon)]
    pub facility: Facility,

    /// Do not fork into the background
    #[arg(short = 'n', long = "no-fork")]
    pub no_fork: bool,

    /// PID file path
    #[arg(short = 'p', long = "pid-file", value_name = "PATH")]
    pub pid_file: Option<PathBuf>,

    /// Behavior when zero devices are registered, or pre-flight inspection mode
    #[arg(short = 'q', long = "quit", default_value_t = QuitMode::Nodev)]
    pub quit: QuitMode,

    /// Report ioctl traffic: TYPE[,LEVEL], TYPE one of ioctl/ataioctl/scsiioctl
    #[arg(short = 'r', long = "report", value_name = "TYPE[,N]")]
    pub report: Vec<ReportSetting>,
}

/// Static help text for `-D`, mirroring the original's directive listing (spec §6)
pub(crate) const DIRECTIVES_HELP: &str = "\
Configuration file directives:
  -d TYPE                device type: ata, scsi, sat, removable, auto
  -T normal|permissive   tolerance for capability-probe failures
  -o on|off              automatic offline testing
  -S on|off              attribute autosave
  -n never|sleep|standby|idle[,q]   power-mode gating
  -H                     overall health check
  -s REGEX               self-test schedule, matched against X/MM/DD/w/HH
  -l error|selftest      log watching
  -f                     usage-attribute failures
  -m ADDR[,ADDR...]      notification addresses
  -M once|daily|diminishing|test|exec CMD   notification policy
  -p -u -t               prefail / usage / both attribute tracking
  -r ID, -R ID           raw value print / raw tracking for one attribute id
  -i ID, -I ID           ignore one attribute id for fail / tracking
  -C ID                  current-pending-sector attribute id (0 disables)
  -U ID                  offline-uncorrectable attribute id (0 disables)
  -W D,I,C               temperature diff / info / critical thresholds
  -v N,FORMAT            attribute labeling convention
  -P use|ignore|show|showall   vendor-attribute preset policy
  -a                     -H -f -t -l error -l selftest -C 197 -U 198
  -F none|samsung|samsung2|samsung3   firmware-bug workaround
";
