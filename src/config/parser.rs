//! Config-file grammar (spec §4.3 / §6): a line-oriented directive
//! language, tokenized in two phases — join continuation lines into a
//! logical line, then parse directives off that line — so the directive
//! parser can be driven in isolation from tests (Design Notes, "hand-rolled
//! line-continuation parser").

use std::{fmt, fs, io, path::Path, str::FromStr};

use super::{
    AttributeLabel, DeviceConfig, FixFirmwareBug, Frequency, PendingSectorIds, PresetPolicy,
};
use crate::{
    bitset::AttributeFlagCategory,
    device::{DevType, TriState},
};

/// Maximum length of one physical (pre-continuation) line
pub(crate) const MAXLINELEN: usize = 256;
/// Maximum length of one logical (post-continuation) line
pub(crate) const MAXCONTLINE: usize = 1024;

/// Pseudo-identifier that synthesizes one entry per scanned device
pub(crate) const DEVICESCAN: &str = "DEVICESCAN";

/// Outcome of parsing a whole config file
pub(crate) enum ParseOutcome {
    /// `N` device entries, parsed in file order
    Entries(Vec<DeviceConfig>),
    /// `DEVICESCAN` was used: a template entry to seed synthesized devices
    ScanTemplate(DeviceConfig),
}

/// Parse failure, discriminated the way callers need to react (spec §4.3
/// return discipline)
#[derive(Debug)]
pub(crate) enum ParseError {
    /// The config file does not exist
    FileMissing(std::path::PathBuf),
    /// The config file exists but could not be read
    FileUnreadable {
        /// Path that failed to read
        path: std::path::PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },
    /// A directive, argument, or line violated the grammar
    Syntax {
        /// 1-based source line
        line: u32,
        /// 1-based column within the logical line
        col: u32,
        /// Human-readable description
        message: String,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileMissing(p) => write!(f, "config file {} does not exist", p.display()),
            Self::FileUnreadable { path, source } => {
                write!(f, "cannot read config file {}: {source}", path.display())
            }
            Self::Syntax { line, col, message } => {
                write!(f, "line {line}, column {col}: {message}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Read `path` (or stdin, if `path` is `-`) and parse it
pub(crate) fn parse_file(path: &Path) -> Result<ParseOutcome, ParseError> {
    if path.as_os_str() == "-" {
        let content = io::read_to_string(io::stdin()).map_err(|source| ParseError::FileUnreadable {
            path: path.to_owned(),
            source,
        })?;
        return parse_str(&content);
    }
    if !path.exists() {
        return Err(ParseError::FileMissing(path.to_owned()));
    }
    let content = fs::read_to_string(path).map_err(|source| ParseError::FileUnreadable {
        path: path.to_owned(),
        source,
    })?;
    parse_str(&content)
}

/// One logical (continuation-joined) line with its starting line number
struct LogicalLine {
    /// 1-based line number of the first physical line it started on
    line_no: u32,
    /// Joined, comment-stripped text
    text: String,
}

/// Phase 1: strip comments, join `\`-continued physical lines, enforce
/// the per-physical-line and per-logical-line length caps
fn join_lines(content: &str) -> Result<Vec<LogicalLine>, ParseError> {
    let mut out = Vec::new();
    let mut pending: Option<LogicalLine> = None;
    for (idx, raw_line) in content.lines().enumerate() {
        let line_no = u32::try_from(idx + 1).unwrap_or(u32::MAX);
        if raw_line.len() > MAXLINELEN {
            return Err(ParseError::Syntax {
                line: line_no,
                col: 1,
                message: format!("line exceeds {MAXLINELEN} characters"),
            });
        }
        let without_comment = strip_comment(raw_line);
        let (body, continues) = match without_comment.strip_suffix('\\') {
            Some(b) => (b, true),
            None => (without_comment, false),
        };
        let mut logical = pending.take().unwrap_or(LogicalLine {
            line_no,
            text: String::new(),
        });
        if !logical.text.is_empty() {
            logical.text.push(' ');
        }
        logical.text.push_str(body.trim());
        if logical.text.len() > MAXCONTLINE {
            return Err(ParseError::Syntax {
                line: logical.line_no,
                col: 1,
                message: format!("continued line exceeds {MAXCONTLINE} characters"),
            });
        }
        if continues {
            pending = Some(logical);
        } else {
            if !logical.text.trim().is_empty() {
                out.push(logical);
            }
            pending = None;
        }
    }
    if let Some(logical) = pending {
        if !logical.text.trim().is_empty() {
            out.push(logical);
        }
    }
    Ok(out)
}

/// Strip a `#`-to-end-of-line comment
fn strip_comment(line: &str) -> &str {
    line.find('#').map_or(line, |idx| &line[..idx])
}

/// Parse the whole content of a config file
pub(crate) fn parse_str(content: &str) -> Result<ParseOutcome, ParseError> {
    let lines = join_lines(content)?;
    let mut entries = Vec::new();
    for (i, logical) in lines.iter().enumerate() {
        let mut tokens = logical.text.split_whitespace().peekable();
        let Some(name) = tokens.next() else {
            continue;
        };
        if name == DEVICESCAN {
            if i != 0 || lines.len() != 1 {
                return Err(ParseError::Syntax {
                    line: logical.line_no,
                    col: 1,
                    message: format!("{DEVICESCAN} must be the first and only entry"),
                });
            }
            let mut template = DeviceConfig::new(DEVICESCAN, 0);
            parse_directives(&mut template, &mut tokens, logical.line_no)?;
            return Ok(ParseOutcome::ScanTemplate(template));
        }
        let mut cfg = DeviceConfig::new(name, logical.line_no);
        parse_directives(&mut cfg, &mut tokens, logical.line_no)?;
        validate_entry(&mut cfg, logical.line_no)?;
        entries.push(cfg);
    }
    Ok(ParseOutcome::Entries(entries))
}

/// Per-entry post-validation (spec §4.3)
fn validate_entry(cfg: &mut DeviceConfig, line: u32) -> Result<(), ParseError> {
    if !cfg.any_check_enabled() {
        cfg.apply_all_checks();
    }
    let m_given = cfg.mailwarn.emailtest
        || cfg.mailwarn.frequency != Frequency::Once
        || cfg.mailwarn.exec.is_some() && cfg.mailwarn.addresses.is_empty();
    if m_given && cfg.mailwarn.addresses.is_empty() && cfg.mailwarn.exec.is_none() {
        // an -M was seen (tracked via the sentinel fields above) but no -m
        return Err(ParseError::Syntax {
            line,
            col: 1,
            message: "-M given without -m".to_owned(),
        });
    }
    if cfg.mailwarn.addresses.iter().any(|a| a == "<nomailer>") && cfg.mailwarn.exec.is_none() {
        return Err(ParseError::Syntax {
            line,
            col: 1,
            message: "-m <nomailer> requires -M exec".to_owned(),
        });
    }
    Ok(())
}

/// Take the next token, erroring with a named directive context if absent
fn next_arg<'a>(
    tokens: &mut std::iter::Peekable<std::str::SplitWhitespace<'a>>,
    directive: &str,
    line: u32,
) -> Result<&'a str, ParseError> {
    tokens.next().ok_or_else(|| ParseError::Syntax {
        line,
        col: 1,
        message: format!("directive {directive} is missing its argument"),
    })
}

/// Parse one integer argument in `range`
fn parse_int_in_range(
    raw: &str,
    range: std::ops::RangeInclusive<i64>,
    directive: &str,
    line: u32,
) -> Result<u8, ParseError> {
    let value: i64 = raw.parse().map_err(|_| ParseError::Syntax {
        line,
        col: 1,
        message: format!("directive {directive} expects an integer, got {raw:?}"),
    })?;
    if !range.contains(&value) {
        return Err(ParseError::Syntax {
            line,
            col: 1,
            message: format!(
                "directive {directive} argument {value} out of range {}..={}",
                range.start(),
                range.end()
            ),
        });
    }
    u8::try_from(value).map_err(|_| ParseError::Syntax {
        line,
        col: 1,
        message: format!("directive {directive} argument {value} does not fit a u8"),
    })
}

/// Parse the three comma-separated integers for `-W`
fn parse_three_ints(raw: &str, directive: &str, line: u32) -> Result<(u8, u8, u8), ParseError> {
    let parts: Vec<&str> = raw.split(',').collect();
    let [a, b, c] = parts.as_slice() else {
        return Err(ParseError::Syntax {
            line,
            col: 1,
            message: format!("directive {directive} expects three comma-separated integers"),
        });
    };
    Ok((
        parse_int_in_range(a, 0..=255, directive, line)?,
        parse_int_in_range(b, 0..=255, directive, line)?,
        parse_int_in_range(c, 0..=255, directive, line)?,
    ))
}

/// Parse directives off an already-tokenized logical line into `cfg`
fn parse_directives(
    cfg: &mut DeviceConfig,
    tokens: &mut std::iter::Peekable<std::str::SplitWhitespace<'_>>,
    line: u32,
) -> Result<(), ParseError> {
    while let Some(tok) = tokens.next() {
        match tok {
            "-d" => {
                let arg = next_arg(tokens, "-d", line)?;
                if arg.eq_ignore_ascii_case("removable") {
                    cfg.removable = true;
                } else {
                    cfg.dev_type = DevType::from_str(arg).map_err(|_| ParseError::Syntax {
                        line,
                        col: 1,
                        message: format!("unknown device type {arg:?}"),
                    })?;
                }
            }
            "-T" => {
                let arg = next_arg(tokens, "-T", line)?;
                cfg.permissive = match arg {
                    "permissive" => true,
                    "normal" => false,
                    _ => {
                        return Err(ParseError::Syntax {
                            line,
                            col: 1,
                            message: format!("-T expects normal|permissive, got {arg:?}"),
                        });
                    }
                };
            }
            "-o" => cfg.autoofflinetest = parse_on_off(tokens, "-o", line)?,
            "-S" => cfg.autosave = parse_on_off(tokens, "-S", line)?,
            "-n" => {
                let arg = next_arg(tokens, "-n", line)?;
                let (mode, quiet) = arg.split_once(',').unwrap_or((arg, ""));
                cfg.powermode = match mode {
                    "never" => 0,
                    "sleep" => 1,
                    "standby" => 2,
                    "idle" => 3,
                    _ => {
                        return Err(ParseError::Syntax {
                            line,
                            col: 1,
                            message: format!("-n expects never|sleep|standby|idle, got {mode:?}"),
                        });
                    }
                };
                cfg.powerquiet = quiet == "q";
            }
            "-H" => cfg.smartcheck = true,
            "-s" => {
                let arg = next_arg(tokens, "-s", line)?;
                let anchored = format!("^(?:{arg})$");
                let compiled = regex::Regex::new(&anchored).map_err(|e| ParseError::Syntax {
                    line,
                    col: 1,
                    message: format!("invalid -s schedule regex {arg:?}: {e}"),
                })?;
                cfg.testdata.pattern = Some(arg.to_owned());
                cfg.testdata.regex = Some(compiled);
            }
            "-l" => {
                let arg = next_arg(tokens, "-l", line)?;
                match arg {
                    "error" => cfg.errorlog = true,
                    "selftest" => cfg.selftest = true,
                    _ => {
                        return Err(ParseError::Syntax {
                            line,
                            col: 1,
                            message: format!("-l expects error|selftest, got {arg:?}"),
                        });
                    }
                }
            }
            "-f" => cfg.usagefailed = true,
            "-m" => {
                let arg = next_arg(tokens, "-m", line)?;
                cfg.mailwarn
                    .addresses
                    .extend(arg.split(',').map(ToOwned::to_owned));
            }
            "-M" => {
                let arg = next_arg(tokens, "-M", line)?;
                match arg {
                    "once" => cfg.mailwarn.frequency = Frequency::Once,
                    "daily" => cfg.mailwarn.frequency = Frequency::Daily,
                    "diminishing" => cfg.mailwarn.frequency = Frequency::Diminishing,
                    "test" => cfg.mailwarn.emailtest = true,
                    "exec" => {
                        let cmd_tokens: Vec<&str> = tokens.by_ref().collect();
                        if cmd_tokens.is_empty() {
                            return Err(ParseError::Syntax {
                                line,
                                col: 1,
                                message: "-M exec requires a command line".to_owned(),
                            });
                        }
                        cfg.mailwarn.exec = Some(cmd_tokens.join(" "));
                    }
                    _ => {
                        return Err(ParseError::Syntax {
                            line,
                            col: 1,
                            message: format!("unknown -M argument {arg:?}"),
                        });
                    }
                }
            }
            "-p" => cfg.prefail = true,
            "-u" => cfg.usage = true,
            "-t" => {
                cfg.prefail = true;
                cfg.usage = true;
            }
            "-r" => {
                let id = parse_int_in_range(next_arg(tokens, "-r", line)?, 1..=255, "-r", line)?;
                cfg.monitorattflags.set(AttributeFlagCategory::RawPrint, id);
            }
            "-R" => {
                let id = parse_int_in_range(next_arg(tokens, "-R", line)?, 1..=255, "-R", line)?;
                cfg.monitorattflags.set(AttributeFlagCategory::RawPrint, id);
                cfg.monitorattflags.set(AttributeFlagCategory::Raw, id);
            }
            "-i" => {
                let id = parse_int_in_range(next_arg(tokens, "-i", line)?, 1..=255, "-i", line)?;
                cfg.monitorattflags.set(AttributeFlagCategory::FailUse, id);
            }
            "-I" => {
                let id = parse_int_in_range(next_arg(tokens, "-I", line)?, 1..=255, "-I", line)?;
                cfg.monitorattflags.set(AttributeFlagCategory::Ignore, id);
            }
            "-C" => {
                let id = parse_int_in_range(next_arg(tokens, "-C", line)?, 0..=255, "-C", line)?;
                cfg.pending.current_pending = (id != 0).then_some(id);
            }
            "-U" => {
                let id = parse_int_in_range(next_arg(tokens, "-U", line)?, 0..=255, "-U", line)?;
                cfg.pending.offline_uncorrectable = (id != 0).then_some(id);
            }
            "-W" => {
                let arg = next_arg(tokens, "-W", line)?;
                let (d, i, c) = parse_three_ints(arg, "-W", line)?;
                cfg.tempdiff = d;
                cfg.tempinfo = i;
                cfg.tempcrit = c;
            }
            "-v" => {
                let arg = next_arg(tokens, "-v", line)?;
                let (id_str, label_str) = arg.split_once(',').ok_or_else(|| ParseError::Syntax {
                    line,
                    col: 1,
                    message: "-v expects ID,FORMAT".to_owned(),
                })?;
                let id = parse_int_in_range(id_str, 1..=255, "-v", line)?;
                let label = AttributeLabel::from_str(&label_str.replace(['-', '/'], ""))
                    .map_err(|_| ParseError::Syntax {
                        line,
                        col: 1,
                        message: format!("-v unknown attribute format {label_str:?}"),
                    })?;
                #[expect(clippy::indexing_slicing)]
                {
                    cfg.attributedefs[usize::from(id)] = label;
                }
            }
            "-P" => {
                let arg = next_arg(tokens, "-P", line)?;
                cfg.preset_policy = PresetPolicy::from_str(arg).map_err(|_| ParseError::Syntax {
                    line,
                    col: 1,
                    message: format!("-P expects use|ignore|show|showall, got {arg:?}"),
                })?;
                cfg.ignorepresets = cfg.preset_policy == PresetPolicy::Ignore;
                cfg.showpresets = matches!(cfg.preset_policy, PresetPolicy::Show | PresetPolicy::ShowAll);
            }
            "-a" => cfg.apply_all_checks(),
            "-F" => {
                let arg = next_arg(tokens, "-F", line)?;
                cfg.fixfirmwarebug =
                    FixFirmwareBug::from_str(arg).map_err(|_| ParseError::Syntax {
                        line,
                        col: 1,
                        message: format!("unknown -F firmware workaround {arg:?}"),
                    })?;
            }
            other => {
                return Err(ParseError::Syntax {
                    line,
                    col: 1,
                    message: format!("unknown directive {other:?}"),
                });
            }
        }
    }
    Ok(())
}

/// Parse an `on|off` argument into a [`TriState`]
fn parse_on_off(
    tokens: &mut std::iter::Peekable<std::str::SplitWhitespace<'_>>,
    directive: &str,
    line: u32,
) -> Result<TriState, ParseError> {
    let arg = next_arg(tokens, directive, line)?;
    match arg {
        "on" => Ok(TriState::Enable),
        "off" => Ok(TriState::Disable),
        _ => Err(ParseError::Syntax {
            line,
            col: 1,
            message: format!("{directive} expects on|off, got {arg:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(content: &str) -> Vec<DeviceConfig> {
        match parse_str(content).unwrap() {
            ParseOutcome::Entries(e) => e,
            ParseOutcome::ScanTemplate(_) => panic!("expected entries"),
        }
    }

    #[test]
    fn simple_entry_with_dash_a() {
        let cfg = &entries("/dev/sda -a")[0];
        assert!(cfg.smartcheck && cfg.usagefailed && cfg.selftest && cfg.errorlog);
    }

    #[test]
    fn no_check_directive_implies_dash_a() {
        let cfg = &entries("/dev/sda -m root@localhost")[0];
        assert!(cfg.smartcheck && cfg.usagefailed);
    }

    #[test]
    fn comment_and_blank_lines_are_skipped() {
        let content = "# comment\n\n/dev/sda -a # trailing comment\n";
        assert_eq!(entries(content).len(), 1);
    }

    #[test]
    fn continuation_joins_lines() {
        let content = "/dev/sda -a \\\n  -m root@localhost\n";
        let cfg = &entries(content)[0];
        assert_eq!(cfg.mailwarn.addresses, vec!["root@localhost".to_owned()]);
    }

    #[test]
    fn devicescan_must_be_alone() {
        let content = "DEVICESCAN -a\n/dev/sda -a\n";
        assert!(parse_str(content).is_err());
    }

    #[test]
    fn devicescan_produces_template() {
        let content = "DEVICESCAN -a -m root@localhost\n";
        match parse_str(content).unwrap() {
            ParseOutcome::ScanTemplate(t) => {
                assert_eq!(t.line_no, 0);
                assert!(t.smartcheck);
            }
            ParseOutcome::Entries(_) => panic!("expected scan template"),
        }
    }

    #[test]
    fn unknown_directive_is_syntax_error() {
        let result = parse_str("/dev/sda -Z");
        assert!(matches!(result, Err(ParseError::Syntax { .. })));
    }

    #[test]
    fn missing_argument_is_syntax_error() {
        let result = parse_str("/dev/sda -C");
        assert!(matches!(result, Err(ParseError::Syntax { .. })));
    }

    #[test]
    fn out_of_range_integer_is_syntax_error() {
        let result = parse_str("/dev/sda -i 0");
        assert!(matches!(result, Err(ParseError::Syntax { .. })));
    }

    #[test]
    fn zero_disables_pending_sector_monitoring() {
        let cfg = &entries("/dev/sda -H -C 0 -U 0")[0];
        assert_eq!(cfg.pending.current_pending, None);
        assert_eq!(cfg.pending.offline_uncorrectable, None);
    }

    #[test]
    fn m_without_m_lowercase_is_rejected() {
        let result = parse_str("/dev/sda -H -M once");
        assert!(result.is_err());
    }

    #[test]
    fn nomailer_without_exec_is_rejected() {
        let result = parse_str("/dev/sda -H -m <nomailer>");
        assert!(result.is_err());
    }

    #[test]
    fn nomailer_with_exec_is_accepted() {
        let cfg = &entries("/dev/sda -H -m <nomailer> -M exec /bin/true")[0];
        assert_eq!(cfg.mailwarn.exec.as_deref(), Some("/bin/true"));
    }

    #[test]
    fn exec_command_with_arguments_consumes_rest_of_line() {
        let cfg = &entries("/dev/sda -H -m <nomailer> -M exec /bin/notify --flag value")[0];
        assert_eq!(
            cfg.mailwarn.exec.as_deref(),
            Some("/bin/notify --flag value")
        );
    }

    #[test]
    fn invalid_schedule_regex_is_rejected() {
        let result = parse_str("/dev/sda -H -s L/(");
        assert!(result.is_err());
    }

    #[test]
    fn valid_schedule_regex_is_compiled_and_anchored() {
        let cfg = &entries(r"/dev/sda -H -s L/../.././02")[0];
        let re = cfg.testdata.regex.as_ref().unwrap();
        assert!(re.is_match("L/06/15/3/02"));
        assert!(!re.is_match("X/06/15/3/02"));
    }

    #[test]
    fn raw_and_rawprint_flags_set_independently() {
        let cfg = &entries("/dev/sda -H -r 5 -R 9")[0];
        assert!(cfg
            .monitorattflags
            .is_off(AttributeFlagCategory::RawPrint, 5));
        assert!(!cfg.monitorattflags.is_off(AttributeFlagCategory::Raw, 5));
        assert!(cfg
            .monitorattflags
            .is_off(AttributeFlagCategory::RawPrint, 9));
        assert!(cfg.monitorattflags.is_off(AttributeFlagCategory::Raw, 9));
    }

    #[test]
    fn line_exceeding_maxlinelen_is_rejected() {
        let long_line = "/dev/sda ".to_owned() + &"-H ".repeat(100);
        assert!(long_line.len() > MAXLINELEN);
        assert!(parse_str(&long_line).is_err());
    }

    #[test]
    fn multiple_entries_parsed_in_order() {
        let content = "/dev/sda -a\n/dev/sdb -a\n";
        let parsed = entries(content);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "/dev/sda");
        assert_eq!(parsed[1].name, "/dev/sdb");
    }
}
