//! Main-loop orchestration (spec §4.8): first-pass setup, then the
//! register→sleep→check cycle, wired to the CLI and the signal/PID-file/
//! platform seams.
//!
//! Grounded on `original_source/smartd.cpp`'s `main_worker()`/`CheckDevicesOnce()`
//! loop skeleton; split into `load_devices` (parse + register, reused for both
//! startup and SIGHUP reload) and `run` (the loop itself), the way the teacher
//! keeps `run_daemon` as one function in `main.rs` calling out to small
//! per-concern helpers (`setup_drives`, `setup_fans`, `probe_drive_temps`, ...).

use std::{path::Path, thread, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Local};

use crate::{
    check,
    cl::{self, QuitMode},
    config::{
        parser::{parse_file, ParseError, ParseOutcome},
        DeviceConfig, DeviceState,
    },
    device::{smartctl::SmartctlDevice, Device},
    pidfile, platform, registration, scheduler, signals,
};

/// Process exit status categories (spec §6 "Exit statuses"). Numbering is
/// this implementation's own; the original defines the same named
/// categories without published numeric values.
///
/// `BadCmdline` is never constructed here: argument parsing errors are
/// reported and exited on by `clap` itself before [`run`] is called.
/// `CaughtSignal`, `InternalBug`, and `OutOfMemory` are likewise never
/// constructed: a fatal signal or an allocation failure terminates the
/// process before application code observes it, and a graceful
/// TERM/QUIT/INT shutdown exits `Ok`, not `CaughtSignal`. They are kept
/// in the taxonomy for completeness with spec §6.
#[expect(dead_code, reason = "full exit-status taxonomy kept for completeness; several categories are unreachable from application code")]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExitStatus {
    /// Clean shutdown
    Ok = 0,
    /// The command line could not be parsed
    BadCmdline = 1,
    /// The config file does not exist
    NoConfig = 2,
    /// A directive in the config file violated the grammar
    BadConfig = 3,
    /// The config file exists but could not be read
    ReadConfig = 4,
    /// Zero devices registered at startup, under `-q nodev`/`nodevstartup`
    NoDevice = 5,
    /// Daemonization, signal installation, or PID-file setup failed
    StartupFailure = 6,
    /// The PID file specifically could not be created
    PidFileFailure = 7,
    /// A fatal signal was caught
    CaughtSignal = 8,
    /// An internal invariant was violated
    InternalBug = 9,
    /// Memory allocation failed
    OutOfMemory = 10,
}

impl ExitStatus {
    /// Process exit code
    pub(crate) fn code(self) -> i32 {
        self as i32
    }
}

impl From<&ParseError> for ExitStatus {
    fn from(e: &ParseError) -> Self {
        match e {
            ParseError::FileMissing(_) => Self::NoConfig,
            ParseError::FileUnreadable { .. } => Self::ReadConfig,
            ParseError::Syntax { .. } => Self::BadConfig,
        }
    }
}

/// One registered device: its configuration, mutable check-engine state,
/// and handle
type Registered = (DeviceConfig, DeviceState, Box<dyn Device>);

/// Parse `path` and register every entry, logging and dropping entries
/// that fail registration (spec §4.5). A `DEVICESCAN` template yields no
/// devices: synthesizing a device list by scanning the bus is out of
/// scope (spec §1 Non-goals).
fn load_devices(path: &Path, checktime: u32) -> Result<Vec<Registered>, ExitStatus> {
    let entries = match parse_file(path) {
        Ok(ParseOutcome::Entries(entries)) => entries,
        Ok(ParseOutcome::ScanTemplate(_)) => {
            log::info!("DEVICESCAN template given; device-bus scanning is not implemented, no devices registered from it");
            Vec::new()
        }
        Err(e) => {
            log::error!("failed to parse config file {}: {e}", path.display());
            return Err(ExitStatus::from(&e));
        }
    };

    let mut out = Vec::with_capacity(entries.len());
    for mut cfg in entries {
        let force_type = (cfg.dev_type != crate::device::DevType::Auto)
            .then(|| cfg.dev_type.to_string());
        let mut device: Box<dyn Device> = Box::new(SmartctlDevice::new(
            Path::new(&cfg.name).to_owned(),
            cfg.dev_type,
            force_type,
        ));
        match registration::register(device.as_mut(), &mut cfg, checktime) {
            Ok(state) => out.push((cfg, state, device)),
            Err(e) => log::error!("{}: registration failed, dropping entry: {e}", cfg.name),
        }
    }
    Ok(out)
}

/// Print the next 90 days of scheduled self-tests for every device
/// (`-q showtests`, spec §4.7)
fn print_schedule_preview(devices: &[Registered], checktime: i64) {
    let now = Local::now();
    for (cfg, _state, _device) in devices {
        let entries =
            scheduler::preview_schedule(&cfg.testdata, cfg.testdata.not_capable, now, checktime);
        if entries.is_empty() {
            continue;
        }
        println!("{}:", cfg.name);
        for entry in entries {
            println!(
                "  {} self-test scheduled for {}",
                entry.test,
                entry.when.format("%Y-%m-%d %H:%M")
            );
        }
    }
}

/// Run one check cycle against every device, in configuration order
/// (spec §5 "Ordering guarantees")
fn check_all(devices: &mut [Registered], now: DateTime<Local>, signals: &signals::SignalFlags) {
    for (cfg, state, device) in devices {
        if signals.exit_requested() {
            return;
        }
        if let Err(e) = check::check_device(device.as_mut(), cfg, state, now) {
            log::error!("{}: check failed: {e:#}", cfg.name);
        }
    }
}

/// Sleep until `target`, polling in 1-second ticks so SIGTERM/SIGUSR1/
/// SIGHUP take effect promptly (spec §5 "an implementation may achieve
/// this with short repeated sleeps of one unit and a shared atomic flag")
fn sleep_until(target: DateTime<Local>, signals: &signals::SignalFlags) {
    loop {
        if signals.exit_requested() || signals.peek_check_now() || signals.peek_reload() {
            return;
        }
        let remaining = target - Local::now();
        if remaining <= Duration::zero() {
            return;
        }
        let tick = remaining.min(Duration::seconds(1));
        thread::sleep(tick.to_std().unwrap_or(StdDuration::from_secs(1)));
    }
}

/// Default PID-free config path used when `-c` is not given
const DEFAULT_CONFIG_FILE: &str = "/etc/smartd.conf";

/// Entry point called from `main`: parse args into a run, own the whole
/// process lifetime, and return the exit status to report.
pub(crate) fn run(args: &cl::Args) -> ExitStatus {
    if args.directives_help {
        println!("{}", cl::DIRECTIVES_HELP);
        return ExitStatus::Ok;
    }

    let config_path = args
        .config_file
        .clone()
        .unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE).to_owned());

    let mut devices = match load_devices(&config_path, args.interval) {
        Ok(devices) => devices,
        Err(status) => return status,
    };

    let checktime = i64::from(args.interval);

    if args.quit == QuitMode::Showtests {
        print_schedule_preview(&devices, checktime);
        return ExitStatus::Ok;
    }

    if devices.is_empty() && matches!(args.quit, QuitMode::Nodev | QuitMode::Nodevstartup) {
        log::error!("no devices registered at startup, exiting ({})", args.quit);
        return ExitStatus::NoDevice;
    }

    let one_shot = args.quit == QuitMode::Onecheck;

    if !args.debug && !args.no_fork && !one_shot {
        if let Err(e) = platform::daemonize() {
            log::error!("failed to daemonize: {e:#}");
            return ExitStatus::StartupFailure;
        }
    }

    let _pid_file = match args.pid_file.clone() {
        Some(path) => match pidfile::PidFile::create(path) {
            Ok(pid_file) => Some(pid_file),
            Err(e) => {
                log::error!("failed to write PID file: {e:#}");
                return ExitStatus::PidFileFailure;
            }
        },
        None => None,
    };

    let signal_flags = match signals::SignalFlags::install(args.debug) {
        Ok(flags) => flags,
        Err(e) => {
            log::error!("failed to install signal handlers: {e:#}");
            return ExitStatus::StartupFailure;
        }
    };

    if one_shot {
        check_all(&mut devices, Local::now(), &signal_flags);
        return ExitStatus::Ok;
    }

    let mut wakeuptime = Local::now() + Duration::seconds(checktime);

    loop {
        if signal_flags.exit_requested() {
            log::info!("exit requested, shutting down");
            return ExitStatus::Ok;
        }

        if signal_flags.take_reload() {
            log::info!("reloading configuration from {}", config_path.display());
            match load_devices(&config_path, args.interval) {
                Ok(reloaded) => devices = reloaded,
                Err(status) if args.quit == QuitMode::Errors => return status,
                Err(_) => log::error!("config reload failed, keeping previous configuration"),
            }
        }

        check_all(&mut devices, Local::now(), &signal_flags);

        if signal_flags.exit_requested() {
            log::info!("exit requested, shutting down");
            return ExitStatus::Ok;
        }

        wakeuptime += Duration::seconds(checktime);
        let now = Local::now();
        if wakeuptime - now > Duration::seconds(checktime) {
            log::error!("system clock jumped backwards, resetting wake time");
            wakeuptime = now + Duration::seconds(checktime);
        }

        let remaining = (wakeuptime - now).to_std().unwrap_or(StdDuration::ZERO);
        log::debug!("sleeping for {} until next cycle", humantime::format_duration(remaining));
        sleep_until(wakeuptime, &signal_flags);
        let _ = signal_flags.take_check_now();
        if signal_flags.take_toggle_debug() {
            log::info!("toggling debug logging level");
            log::set_max_level(if log::max_level() == log::LevelFilter::Debug {
                log::LevelFilter::Info
            } else {
                log::LevelFilter::Debug
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_config_file_maps_to_no_config() {
        let result = load_devices(Path::new("/nonexistent/smartd.conf"), 1800);
        assert_eq!(result.unwrap_err(), ExitStatus::NoConfig);
    }

    #[test]
    fn syntax_error_maps_to_bad_config() {
        let file = write_config("-Z bogus /dev/sda\n");
        let result = load_devices(file.path(), 1800);
        assert_eq!(result.unwrap_err(), ExitStatus::BadConfig);
    }

    #[test]
    fn devicescan_template_yields_no_devices() {
        let file = write_config("DEVICESCAN -a\n");
        let result = load_devices(file.path(), 1800).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn nonexistent_device_path_is_dropped() {
        let file = write_config("/dev/definitely-not-a-real-device -a\n");
        let result = load_devices(file.path(), 1800).unwrap();
        assert!(result.is_empty());
    }
}
