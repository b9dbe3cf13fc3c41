//! Logger init (spec §7: "every line of log output carries a fixed
//! identifier, a priority, and a device-qualified message").
//!
//! Grounded on `main.rs`'s `simple_logger::init_with_level` call, split
//! here into two branches: `simple_logger` for debug/foreground mode, and
//! the `syslog` crate (used the same way by `proxmox-backup` in the
//! example pack) for daemonized mode, mapping `-l FACILITY`.

use anyhow::Context as _;

/// Syslog facility selector for `-l FACILITY` (spec §6)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Facility {
    /// The generic `daemon` facility
    #[default]
    Daemon,
    /// `local0`
    Local0,
    /// `local1`
    Local1,
    /// `local2`
    Local2,
    /// `local3`
    Local3,
    /// `local4`
    Local4,
    /// `local5`
    Local5,
    /// `local6`
    Local6,
    /// `local7`
    Local7,
}

impl From<Facility> for syslog::Facility {
    fn from(value: Facility) -> Self {
        match value {
            Facility::Daemon => Self::LOG_DAEMON,
            Facility::Local0 => Self::LOG_LOCAL0,
            Facility::Local1 => Self::LOG_LOCAL1,
            Facility::Local2 => Self::LOG_LOCAL2,
            Facility::Local3 => Self::LOG_LOCAL3,
            Facility::Local4 => Self::LOG_LOCAL4,
            Facility::Local5 => Self::LOG_LOCAL5,
            Facility::Local6 => Self::LOG_LOCAL6,
            Facility::Local7 => Self::LOG_LOCAL7,
        }
    }
}

/// Initialize logging for this process: stderr in debug mode, syslog
/// otherwise (spec §4.8 "if not debug, daemonize").
pub(crate) fn init(debug: bool, facility: Facility, level: log::LevelFilter) -> anyhow::Result<()> {
    if debug {
        simple_logger::SimpleLogger::new()
            .with_level(level)
            .init()
            .context("failed to init stderr logger")
    } else {
        #[expect(clippy::cast_possible_wrap)]
        let pid = std::process::id() as i32;
        let formatter = syslog::Formatter3164 {
            facility: facility.into(),
            hostname: None,
            process: env!("CARGO_BIN_NAME").to_owned(),
            pid,
        };
        let logger =
            syslog::unix(formatter).context("failed to connect to syslog")?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(level))
            .context("failed to install syslog logger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facility_round_trips_through_display_and_fromstr() {
        for facility in [
            Facility::Daemon,
            Facility::Local0,
            Facility::Local7,
        ] {
            let s = facility.to_string();
            let parsed: Facility = s.parse().unwrap();
            assert_eq!(parsed, facility);
        }
    }
}
