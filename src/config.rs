//! Functions and structures related to configuring a Flock load test.
//!
//! Flock can be configured at run time by passing in the options and flags defined by
//! the [`FlockConfiguration`] structure.
//!
//! Flock can be configured programmatically with [`FlockDefaultType::set_default`].
//! Options set on the command line always win over programmatic defaults, which win
//! over the built-in defaults.

use gumdrop::Options;
use serde::{Deserialize, Serialize};
use simplelog::*;
use std::fmt;
use std::path::PathBuf;

use crate::util;
use crate::{Flock, FlockError};

/// Default graceful stop cap, in seconds.
pub(crate) const DEFAULT_STOP_TIMEOUT: usize = 30;

/// Default exit code when errors were recorded.
pub(crate) const DEFAULT_EXIT_CODE_ON_ERROR: i32 = 1;

/// Runtime options available when launching a Flock load test.
///
/// Custom defaults can be programmatically set for most of these options using
/// [`FlockDefaultType::set_default`].
#[derive(Options, Debug, Clone, Default, Serialize, Deserialize)]
#[options(
    help = r#"Flock is a distributed load testing engine. Simulated users run as lightweight
tasks, optionally spread across many Worker processes coordinated by one Master.

The following runtime options are available when launching a Flock load test:"#
)]
pub struct FlockConfiguration {
    /// Displays this help
    #[options(short = "h")]
    pub help: bool,
    /// Prints version information
    #[options(short = "V")]
    pub version: bool,
    /// Lists all user specs and tasks and exits
    // Add a blank line after this option
    #[options(short = "l", help = "Lists all user specs and tasks and exits\n")]
    pub list: bool,

    /// Sets concurrent users (default: 1)
    #[options(short = "u")]
    pub users: Option<usize>,
    /// Sets per-second user hatch rate (default: 1)
    #[options(short = "r", meta = "RATE")]
    pub hatch_rate: Option<String>,
    /// Stops load test after (30s, 20m, 3h, 1h30m, etc)
    #[options(short = "t", meta = "TIME")]
    pub run_time: String,
    /// Caps how long a graceful stop waits for users (default: 30s)
    #[options(no_short, meta = "TIME")]
    pub stop_timeout: String,
    /// Limits how many users this process will launch
    #[options(no_short)]
    pub max_users: Option<usize>,
    /// Treats every positive user spec weight as 1
    #[options(no_short)]
    pub equal_weights: bool,
    /// Waits for a start command instead of starting immediately
    #[options(no_short)]
    pub no_autostart: bool,
    /// Quits this many seconds after the run time or load shape ends the test
    #[options(
        no_short,
        meta = "SECONDS",
        help = "Quits this many seconds after the run time or load shape ends the test\n"
    )]
    pub autoquit: Option<usize>,

    /// Enables Flock log file and sets name
    #[options(short = "G", meta = "NAME")]
    pub log_file: String,
    /// Increases Flock log level (-g, -gg, etc)
    #[options(short = "g", count)]
    pub log_level: u8,
    /// Decreases Flock verbosity (-q, -qq, etc)
    #[options(count, short = "q", help = "Decreases Flock verbosity (-q, -qq, etc)")]
    pub quiet: u8,
    /// Increases Flock verbosity (-v, -vv, etc)
    #[options(
        count,
        short = "v",
        // Add a blank line and then a 'Stats:' header after this option
        help = "Increases Flock verbosity (-v, -vv, etc)\n\nStats:"
    )]
    pub verbose: u8,

    /// How often to optionally print running stats
    #[options(no_short, meta = "TIME")]
    pub running_metrics: Option<usize>,
    /// Resets stats after all users have started
    #[options(no_short)]
    pub reset_stats: bool,
    /// Doesn't display stats at end of load test
    #[options(no_short)]
    pub no_print_stats: bool,
    /// Doesn't display an error summary
    #[options(no_short)]
    pub no_error_summary: bool,
    /// Prints the final stats as JSON
    #[options(no_short)]
    pub json: bool,
    /// Sets the process exit code when errors were recorded (default: 1)
    #[options(
        no_short,
        meta = "CODE",
        help = "Sets the process exit code when errors were recorded (default: 1)\n\nGaggle:"
    )]
    pub exit_code_on_error: Option<i32>,

    /// Enables distributed load test Master mode
    #[options(no_short)]
    pub master: bool,
    /// Sets number of Workers to wait for before starting (default: 1)
    #[options(no_short)]
    pub expect_workers: Option<usize>,
    /// Gives up if Workers haven't connected after this many seconds
    #[options(no_short, meta = "TIME")]
    pub expect_workers_max_wait: Option<usize>,
    /// Sets host Master listens on (default: 0.0.0.0)
    #[options(no_short, meta = "HOST")]
    pub master_bind_host: String,
    /// Sets port Master listens on (default: 5115)
    #[options(no_short, meta = "PORT")]
    pub master_bind_port: u16,
    /// Enables distributed load test Worker mode
    #[options(no_short)]
    pub worker: bool,
    /// Sets host Worker connects to (default: 127.0.0.1)
    #[options(no_short, meta = "HOST")]
    pub master_host: String,
    /// Sets port Worker connects to (default: 5115)
    #[options(no_short, meta = "PORT")]
    pub master_port: u16,
    /// Sets milliseconds between Worker heartbeats (default: 1000)
    #[options(no_short, meta = "MS")]
    pub heartbeat_interval: Option<usize>,
    /// Sets missed heartbeats before a Worker is missing (default: 3)
    #[options(no_short)]
    pub heartbeat_liveness: Option<usize>,
    /// Sets milliseconds between Worker stats reports (default: 3000)
    #[options(
        no_short,
        meta = "MS",
        help = "Sets milliseconds between Worker stats reports (default: 3000)\n\nControllers:"
    )]
    pub report_interval: Option<usize>,

    /// Doesn't enable telnet Controller
    #[options(no_short)]
    pub no_telnet: bool,
    /// Sets telnet Controller host (default: 0.0.0.0)
    #[options(no_short, meta = "HOST")]
    pub telnet_host: String,
    /// Sets telnet Controller TCP port (default: 5116)
    #[options(no_short, meta = "PORT")]
    pub telnet_port: u16,
}

/// Optional default values for Flock run-time options.
///
/// These custom defaults can be configured using [`FlockDefaultType::set_default()`].
#[derive(Clone, Debug, Default)]
pub(crate) struct FlockDefaults {
    pub users: Option<usize>,
    pub hatch_rate: Option<String>,
    pub run_time: Option<usize>,
    pub stop_timeout: Option<usize>,
    pub max_users: Option<usize>,
    pub equal_weights: Option<bool>,
    pub no_autostart: Option<bool>,
    pub autoquit: Option<usize>,
    pub log_file: Option<String>,
    pub log_level: Option<u8>,
    pub quiet: Option<u8>,
    pub verbose: Option<u8>,
    pub running_metrics: Option<usize>,
    pub reset_stats: Option<bool>,
    pub no_print_stats: Option<bool>,
    pub no_error_summary: Option<bool>,
    pub json: Option<bool>,
    pub exit_code_on_error: Option<i32>,
    pub master: Option<bool>,
    pub expect_workers: Option<usize>,
    pub expect_workers_max_wait: Option<usize>,
    pub master_bind_host: Option<String>,
    pub master_bind_port: Option<u16>,
    pub worker: Option<bool>,
    pub master_host: Option<String>,
    pub master_port: Option<u16>,
    pub heartbeat_interval: Option<usize>,
    pub heartbeat_liveness: Option<usize>,
    pub report_interval: Option<usize>,
    pub no_telnet: Option<bool>,
    pub telnet_host: Option<String>,
    pub telnet_port: Option<u16>,
}

/// Defines all [`FlockConfiguration`] options that can be programmatically configured with
/// a custom default.
#[derive(Debug)]
pub enum FlockDefault {
    Users,
    HatchRate,
    RunTime,
    StopTimeout,
    MaxUsers,
    EqualWeights,
    NoAutoStart,
    AutoQuit,
    LogFile,
    LogLevel,
    Quiet,
    Verbose,
    RunningMetrics,
    ResetStats,
    NoPrintStats,
    NoErrorSummary,
    Json,
    ExitCodeOnError,
    Master,
    ExpectWorkers,
    ExpectWorkersMaxWait,
    MasterBindHost,
    MasterBindPort,
    Worker,
    MasterHost,
    MasterPort,
    HeartbeatInterval,
    HeartbeatLiveness,
    ReportInterval,
    NoTelnet,
    TelnetHost,
    TelnetPort,
}

/// Most run-time options can be programmatically configured with custom defaults.
///
/// The following run-time options can be configured with a custom default using a
/// borrowed string slice ([`&str`]):
///  - [`FlockDefault::HatchRate`]
///  - [`FlockDefault::LogFile`]
///  - [`FlockDefault::MasterBindHost`]
///  - [`FlockDefault::MasterHost`]
///  - [`FlockDefault::TelnetHost`]
///
/// The following run-time flags can be configured with a custom default using a
/// [`bool`]:
///  - [`FlockDefault::EqualWeights`], [`FlockDefault::NoAutoStart`]
///  - [`FlockDefault::ResetStats`], [`FlockDefault::NoPrintStats`],
///    [`FlockDefault::NoErrorSummary`], [`FlockDefault::Json`]
///  - [`FlockDefault::Master`], [`FlockDefault::Worker`], [`FlockDefault::NoTelnet`]
///
/// Every other option takes a [`usize`].
pub trait FlockDefaultType<T> {
    /// Sets a [`FlockDefault`] to the provided value.
    ///
    /// # Example
    /// ```rust
    /// use flock::prelude::*;
    ///
    /// fn main() -> Result<(), FlockError> {
    ///     Flock::initialize()?
    ///         .set_default(FlockDefault::Users, 20)?
    ///         .set_default(FlockDefault::HatchRate, "4")?
    ///         .set_default(FlockDefault::NoTelnet, true)?;
    ///
    ///     Ok(())
    /// }
    /// ```
    fn set_default(self, key: FlockDefault, value: T) -> Result<Box<Self>, FlockError>;
}
impl FlockDefaultType<&str> for Flock {
    fn set_default(mut self, key: FlockDefault, value: &str) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::HatchRate => self.defaults.hatch_rate = Some(value.to_string()),
            FlockDefault::LogFile => self.defaults.log_file = Some(value.to_string()),
            FlockDefault::MasterBindHost => {
                self.defaults.master_bind_host = Some(value.to_string())
            }
            FlockDefault::MasterHost => self.defaults.master_host = Some(value.to_string()),
            FlockDefault::TelnetHost => self.defaults.telnet_host = Some(value.to_string()),
            FlockDefault::EqualWeights
            | FlockDefault::NoAutoStart
            | FlockDefault::ResetStats
            | FlockDefault::NoPrintStats
            | FlockDefault::NoErrorSummary
            | FlockDefault::Json
            | FlockDefault::Master
            | FlockDefault::Worker
            | FlockDefault::NoTelnet => return Err(wrong_type(key, value, "bool", "&str")),
            _ => return Err(wrong_type(key, value, "usize", "&str")),
        }
        Ok(Box::new(self))
    }
}
impl FlockDefaultType<usize> for Flock {
    fn set_default(mut self, key: FlockDefault, value: usize) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::Users => self.defaults.users = Some(value),
            FlockDefault::RunTime => self.defaults.run_time = Some(value),
            FlockDefault::StopTimeout => self.defaults.stop_timeout = Some(value),
            FlockDefault::MaxUsers => self.defaults.max_users = Some(value),
            FlockDefault::AutoQuit => self.defaults.autoquit = Some(value),
            FlockDefault::LogLevel => self.defaults.log_level = Some(value as u8),
            FlockDefault::Quiet => self.defaults.quiet = Some(value as u8),
            FlockDefault::Verbose => self.defaults.verbose = Some(value as u8),
            FlockDefault::RunningMetrics => self.defaults.running_metrics = Some(value),
            FlockDefault::ExitCodeOnError => self.defaults.exit_code_on_error = Some(value as i32),
            FlockDefault::ExpectWorkers => self.defaults.expect_workers = Some(value),
            FlockDefault::ExpectWorkersMaxWait => {
                self.defaults.expect_workers_max_wait = Some(value)
            }
            FlockDefault::MasterBindPort => self.defaults.master_bind_port = Some(value as u16),
            FlockDefault::MasterPort => self.defaults.master_port = Some(value as u16),
            FlockDefault::HeartbeatInterval => self.defaults.heartbeat_interval = Some(value),
            FlockDefault::HeartbeatLiveness => self.defaults.heartbeat_liveness = Some(value),
            FlockDefault::ReportInterval => self.defaults.report_interval = Some(value),
            FlockDefault::TelnetPort => self.defaults.telnet_port = Some(value as u16),
            FlockDefault::HatchRate
            | FlockDefault::LogFile
            | FlockDefault::MasterBindHost
            | FlockDefault::MasterHost
            | FlockDefault::TelnetHost => {
                return Err(wrong_type(key, &value.to_string(), "&str", "usize"))
            }
            _ => return Err(wrong_type(key, &value.to_string(), "bool", "usize")),
        }
        Ok(Box::new(self))
    }
}
impl FlockDefaultType<bool> for Flock {
    fn set_default(mut self, key: FlockDefault, value: bool) -> Result<Box<Self>, FlockError> {
        match key {
            FlockDefault::EqualWeights => self.defaults.equal_weights = Some(value),
            FlockDefault::NoAutoStart => self.defaults.no_autostart = Some(value),
            FlockDefault::ResetStats => self.defaults.reset_stats = Some(value),
            FlockDefault::NoPrintStats => self.defaults.no_print_stats = Some(value),
            FlockDefault::NoErrorSummary => self.defaults.no_error_summary = Some(value),
            FlockDefault::Json => self.defaults.json = Some(value),
            FlockDefault::Master => self.defaults.master = Some(value),
            FlockDefault::Worker => self.defaults.worker = Some(value),
            FlockDefault::NoTelnet => self.defaults.no_telnet = Some(value),
            FlockDefault::HatchRate
            | FlockDefault::LogFile
            | FlockDefault::MasterBindHost
            | FlockDefault::MasterHost
            | FlockDefault::TelnetHost => {
                return Err(wrong_type(key, &value.to_string(), "&str", "bool"))
            }
            _ => return Err(wrong_type(key, &value.to_string(), "usize", "bool")),
        }
        Ok(Box::new(self))
    }
}

fn wrong_type(key: FlockDefault, value: &str, expected: &str, received: &str) -> FlockError {
    FlockError::InvalidOption {
        option: format!("FlockDefault::{:?}", key),
        value: value.to_string(),
        detail: format!(
            "set_default(FlockDefault::{:?}, {}) expected {} value, received {}",
            key, value, expected, received
        ),
    }
}

/// Used internally to configure [`FlockConfiguration`] values based on precedence rules.
#[derive(Debug, Clone)]
pub(crate) struct FlockValue<'a, T> {
    /// The optional value to set.
    pub(crate) value: Option<T>,
    /// Filter using this value if true.
    pub(crate) filter: bool,
    /// An optional INFO level log message.
    pub(crate) message: &'a str,
}

pub(crate) trait FlockConfigure<T> {
    /// The first unfiltered value, in order.
    fn get_value(&self, values: Vec<FlockValue<T>>) -> Option<T>;
}
impl<T: fmt::Display> FlockConfigure<T> for FlockConfiguration {
    fn get_value(&self, values: Vec<FlockValue<T>>) -> Option<T> {
        for value in values {
            if let Some(v) = value.value {
                if value.filter {
                    continue;
                }
                if !value.message.is_empty() {
                    info!("{} = {}", value.message, v)
                }
                return Some(v);
            }
        }
        None
    }
}

impl FlockConfiguration {
    /// Implement precedence rules for all [`FlockConfiguration`] values.
    pub(crate) fn configure(&mut self, defaults: &FlockDefaults) {
        self.quiet = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.quiet),
                    filter: self.quiet == 0,
                    message: "",
                },
                FlockValue {
                    value: defaults.quiet,
                    filter: defaults.quiet.is_none(),
                    message: "",
                },
            ])
            .unwrap_or(0);
        self.verbose = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.verbose),
                    filter: self.verbose == 0,
                    message: "",
                },
                FlockValue {
                    value: defaults.verbose,
                    filter: defaults.verbose.is_none(),
                    message: "",
                },
            ])
            .unwrap_or(0);
        self.log_level = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.log_level),
                    filter: self.log_level == 0,
                    message: "",
                },
                FlockValue {
                    value: defaults.log_level,
                    filter: defaults.log_level.is_none(),
                    message: "",
                },
            ])
            .unwrap_or(0);
        self.log_file = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.log_file.to_string()),
                    filter: self.log_file.is_empty(),
                    message: "",
                },
                FlockValue {
                    value: defaults.log_file.clone(),
                    filter: defaults.log_file.is_none(),
                    message: "",
                },
            ])
            .unwrap_or_default();

        // Initialize the Flock logger.
        self.initialize_logger();

        // Mode flags come first, many defaults depend on them.
        self.master = self.configure_flag(self.master, defaults.master, "master");
        self.worker = self.configure_flag(self.worker, defaults.worker, "worker");

        // Configure `users`, which the Master sends to Workers.
        self.users = self.get_value(vec![
            FlockValue {
                value: self.users,
                filter: self.users.is_none(),
                message: "users",
            },
            FlockValue {
                value: defaults.users,
                filter: defaults.users.is_none() || self.worker,
                message: "users",
            },
            FlockValue {
                value: Some(1),
                filter: self.worker,
                message: "users",
            },
        ]);

        // Configure `hatch_rate`, which the Master sends to Workers.
        self.hatch_rate = self.get_value(vec![
            FlockValue {
                value: self.hatch_rate.clone(),
                filter: self.hatch_rate.is_none(),
                message: "hatch_rate",
            },
            FlockValue {
                value: defaults.hatch_rate.clone(),
                filter: defaults.hatch_rate.is_none() || self.worker,
                message: "hatch_rate",
            },
            FlockValue {
                value: Some("1".to_string()),
                filter: self.worker,
                message: "",
            },
        ]);

        // Configure `run_time`, which is ignored on Workers.
        if self.worker && defaults.run_time.is_some() {
            info!("run_time is ignored on a Worker, the Master decides when to stop");
        }
        self.run_time = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.run_time.to_string()),
                    filter: self.run_time.is_empty(),
                    message: "run_time",
                },
                FlockValue {
                    value: defaults.run_time.map(|r| r.to_string()),
                    filter: defaults.run_time.is_none() || self.worker,
                    message: "run_time",
                },
            ])
            .unwrap_or_default();

        self.stop_timeout = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.stop_timeout.to_string()),
                    filter: self.stop_timeout.is_empty(),
                    message: "stop_timeout",
                },
                FlockValue {
                    value: defaults.stop_timeout.map(|s| s.to_string()),
                    filter: defaults.stop_timeout.is_none(),
                    message: "stop_timeout",
                },
                FlockValue {
                    value: Some(DEFAULT_STOP_TIMEOUT.to_string()),
                    filter: false,
                    message: "",
                },
            ])
            .unwrap_or_default();

        self.max_users = self.get_value(vec![
            FlockValue {
                value: self.max_users,
                filter: self.max_users.is_none(),
                message: "max_users",
            },
            FlockValue {
                value: defaults.max_users,
                filter: defaults.max_users.is_none(),
                message: "max_users",
            },
        ]);
        self.equal_weights =
            self.configure_flag(self.equal_weights, defaults.equal_weights, "equal_weights");
        self.no_autostart =
            self.configure_flag(self.no_autostart, defaults.no_autostart, "no_autostart");

        // Workers quit when their Master tells them to.
        self.autoquit = self.get_value(vec![
            FlockValue {
                value: self.autoquit,
                filter: self.autoquit.is_none(),
                message: "autoquit",
            },
            FlockValue {
                value: defaults.autoquit,
                filter: defaults.autoquit.is_none() || self.worker,
                message: "autoquit",
            },
        ]);

        // Workers never print running stats.
        self.running_metrics = self.get_value(vec![
            FlockValue {
                value: self.running_metrics,
                filter: self.running_metrics.is_none(),
                message: "running_metrics",
            },
            FlockValue {
                value: defaults.running_metrics,
                filter: defaults.running_metrics.is_none() || self.worker,
                message: "running_metrics",
            },
        ]);
        self.reset_stats = self.configure_flag(
            self.reset_stats,
            defaults.reset_stats.filter(|_| !self.worker),
            "reset_stats",
        );
        self.no_print_stats =
            self.configure_flag(self.no_print_stats, defaults.no_print_stats, "no_print_stats");
        self.no_error_summary = self.configure_flag(
            self.no_error_summary,
            defaults.no_error_summary,
            "no_error_summary",
        );
        self.json = self.configure_flag(self.json, defaults.json, "json");
        self.exit_code_on_error = self.get_value(vec![
            FlockValue {
                value: self.exit_code_on_error,
                filter: self.exit_code_on_error.is_none(),
                message: "exit_code_on_error",
            },
            FlockValue {
                value: defaults.exit_code_on_error,
                filter: defaults.exit_code_on_error.is_none(),
                message: "exit_code_on_error",
            },
            FlockValue {
                value: Some(DEFAULT_EXIT_CODE_ON_ERROR),
                filter: false,
                message: "",
            },
        ]);

        self.configure_master(defaults);
        self.configure_worker(defaults);

        self.no_telnet = self.configure_flag(self.no_telnet, defaults.no_telnet, "no_telnet");
        self.telnet_host = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.telnet_host.to_string()),
                    filter: self.telnet_host.is_empty(),
                    message: "telnet_host",
                },
                FlockValue {
                    value: defaults.telnet_host.clone(),
                    filter: defaults.telnet_host.is_none() || self.worker,
                    message: "telnet_host",
                },
                FlockValue {
                    value: Some(crate::controller::DEFAULT_TELNET_HOST.to_string()),
                    filter: self.no_telnet || self.worker,
                    message: "",
                },
            ])
            .unwrap_or_default();
        self.telnet_port = self
            .get_value(vec![
                FlockValue {
                    value: Some(self.telnet_port),
                    filter: self.telnet_port == 0,
                    message: "telnet_port",
                },
                FlockValue {
                    value: defaults.telnet_port,
                    filter: defaults.telnet_port.is_none() || self.worker,
                    message: "telnet_port",
                },
                FlockValue {
                    value: Some(crate::controller::DEFAULT_TELNET_PORT),
                    filter: self.no_telnet || self.worker,
                    message: "",
                },
            ])
            .unwrap_or(0);
    }

    // A flag is set if it's set on the command line or by a programmatic default.
    pub(crate) fn configure_flag(&self, flag: bool, default: Option<bool>, message: &str) -> bool {
        self.get_value(vec![
            FlockValue {
                value: Some(flag),
                filter: !flag,
                message,
            },
            FlockValue {
                value: default,
                filter: default.is_none(),
                message,
            },
        ])
        .unwrap_or(false)
    }

    /// Validate configured [`FlockConfiguration`] values.
    pub(crate) fn validate(&self) -> Result<(), FlockError> {
        // Can't set both --verbose and --quiet.
        if self.verbose > 0 && self.quiet > 0 {
            return Err(FlockError::InvalidOption {
                option: "`configuration.verbose`".to_string(),
                value: self.verbose.to_string(),
                detail: "`configuration.verbose` can not be set with `configuration.quiet`."
                    .to_string(),
            });
        }

        // Can't be both Master and Worker.
        if self.master && self.worker {
            return Err(FlockError::InvalidOption {
                option: "`configuration.master`".to_string(),
                value: true.to_string(),
                detail: "`configuration.master` can not be set together with `configuration.worker`."
                    .to_string(),
            });
        }

        // If set, hatch rate must be a positive number.
        if let Some(hatch_rate) = self.hatch_rate.as_ref() {
            match util::get_float_from_string(Some(hatch_rate.to_string())) {
                Some(rate) if rate.is_finite() && rate > 0.0 => (),
                _ => {
                    return Err(FlockError::InvalidOption {
                        option: "`configuration.hatch_rate`".to_string(),
                        value: hatch_rate.to_string(),
                        detail: "`configuration.hatch_rate` must be a number greater than 0."
                            .to_string(),
                    })
                }
            }
        }

        if !self.run_time.is_empty()
            && self.run_time != "0"
            && util::parse_timespan(&self.run_time) == 0
        {
            return Err(FlockError::InvalidOption {
                option: "`configuration.run_time`".to_string(),
                value: self.run_time.to_string(),
                detail: "`configuration.run_time` must be a time span such as 30s, 20m or 1h30m."
                    .to_string(),
            });
        }

        for (option, value) in &[
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_liveness", self.heartbeat_liveness),
            ("report_interval", self.report_interval),
        ] {
            if *value == Some(0) {
                return Err(FlockError::InvalidOption {
                    option: format!("`configuration.{}`", option),
                    value: "0".to_string(),
                    detail: format!("`configuration.{}` must be greater than 0.", option),
                });
            }
        }

        self.validate_master()?;
        self.validate_worker()?;

        Ok(())
    }

    /// Graceful stop cap.
    pub(crate) fn stop_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(util::parse_timespan(&self.stop_timeout) as u64)
    }

    /// Run time in seconds, 0 when unset.
    pub(crate) fn run_time(&self) -> usize {
        util::parse_timespan(&self.run_time)
    }

    pub(crate) fn hatch_rate(&self) -> f32 {
        util::get_hatch_rate(self.hatch_rate.clone())
    }

    /// Optionally initialize the Flock logger which writes to standard out and/or to
    /// a configurable log file.
    pub(crate) fn initialize_logger(&self) {
        // Configure debug output level.
        let debug_level = match self.verbose {
            0 => match self.quiet {
                0 => LevelFilter::Info,
                _ => LevelFilter::Warn,
            },
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Configure Flock log level.
        let log_level = match self.log_level {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        let log_file: Option<PathBuf> = if !self.log_file.is_empty() {
            Some(PathBuf::from(&self.log_file))
        } else {
            None
        };

        let mut loggers: Vec<Box<dyn SharedLogger>> =
            vec![SimpleLogger::new(debug_level, Config::default())];
        if let Some(log_to_file) = log_file.as_ref() {
            match std::fs::File::create(log_to_file) {
                Ok(file) => loggers.push(WriteLogger::new(log_level, Config::default(), file)),
                Err(e) => eprintln!(
                    "failed to create log file {}: {}",
                    log_to_file.display(),
                    e
                ),
            }
        }
        if let Err(e) = CombinedLogger::init(loggers) {
            info!("failed to initialize CombinedLogger: {}", e);
        }
        if let Some(log_to_file) = log_file {
            info!("Writing to log file: {}", log_to_file.display());
        }

        info!("Output verbosity level: {}", debug_level);
        info!("Logfile verbosity level: {}", log_level);
    }
}
