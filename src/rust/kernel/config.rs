// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    kernel::policy::{
        AdmissionPolicy,
        DispatchPolicy,
    },
    runtime::{
        fail::Fail,
        limits,
    },
};
use ::std::{
    fmt,
    fs::File,
    io::Read,
    net::SocketAddr,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Kernel endpoint options.
mod kernel_config {
    pub const SECTION_NAME: &str = "kernel";
    // Address the kernel listens on for peer handshakes and events.
    pub const LISTEN_ADDR: &str = "listen_addr";
    // Address of the memory manager.
    pub const MEMORY_ADDR: &str = "memory_addr";
    pub const LOG_LEVEL: &str = "log_level";
}

// Scheduler options.
mod scheduler_config {
    pub const SECTION_NAME: &str = "scheduler";
    pub const DISPATCH_POLICY: &str = "dispatch_policy";
    pub const ADMISSION_POLICY: &str = "admission_policy";
    pub const ALPHA: &str = "alpha";
    pub const INITIAL_ESTIMATE: &str = "initial_estimate";
    pub const SUSPENSION_TIMEOUT: &str = "suspension_timeout";
    pub const MULTIPROGRAMMING: &str = "multiprogramming";
    pub const MEMORY_INIT_ATTEMPTS: &str = "memory_init_attempts";
    pub const MEMORY_INIT_RETRY_DELAY: &str = "memory_init_retry_delay";
    pub const IO_UNAVAILABLE_POLICY: &str = "io_unavailable_policy";
    pub const BOOTSTRAP_MEMORY_INIT: &str = "bootstrap_memory_init";
}

// Transport timeouts.
mod transport_config {
    pub const SECTION_NAME: &str = "transport";
    pub const CONNECT_TIMEOUT: &str = "connect_timeout";
    pub const REQUEST_TIMEOUT: &str = "request_timeout";
}

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ALPHA: f64 = 0.5;
const DEFAULT_INITIAL_ESTIMATE_MS: u64 = 5000;
const DEFAULT_SUSPENSION_TIMEOUT_MS: u64 = 4500;
const DEFAULT_MULTIPROGRAMMING: usize = 1;
const DEFAULT_MEMORY_INIT_ATTEMPTS: u32 = 5;
const DEFAULT_MEMORY_INIT_RETRY_DELAY_MS: u64 = 2000;

//======================================================================================================================
// Structures
//======================================================================================================================

/// What to do with a process whose I/O request cannot be delivered to any device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoUnavailablePolicy {
    /// Skip the I/O instruction and return the process to READY.
    Continue,
    /// Finalize the process.
    Finalize,
}

/// Validated scheduler parameters.
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    pub dispatch_policy: DispatchPolicy,
    pub admission_policy: AdmissionPolicy,
    /// Smoothing factor of the burst estimate, in [0, 1].
    pub alpha: f64,
    /// Burst estimate given to new processes, in milliseconds.
    pub initial_estimate: f64,
    pub suspension_timeout: Duration,
    /// Degree of multiprogramming. Always at least one.
    pub multiprogramming: usize,
    pub memory_init_attempts: u32,
    pub memory_init_retry_delay: Duration,
    pub io_unavailable_policy: IoUnavailablePolicy,
    /// Whether the bootstrap process also goes through memory initialization on its first admission.
    pub bootstrap_memory_init: bool,
}

/// Timeouts applied to every connection the kernel opens to a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

/// Kernel configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SchedulerOptions {
    /// Clamps out-of-range values to their defaults.
    pub fn validated(mut self) -> Self {
        if !(0.0..=1.0).contains(&self.alpha) || self.alpha.is_nan() {
            warn!("validated(): alpha {} is out of range, using {}", self.alpha, DEFAULT_ALPHA);
            self.alpha = DEFAULT_ALPHA;
        }
        if self.multiprogramming < 1 {
            warn!("validated(): multiprogramming must be at least 1");
            self.multiprogramming = 1;
        }
        if self.memory_init_attempts < 1 {
            warn!("validated(): memory_init_attempts must be at least 1");
            self.memory_init_attempts = 1;
        }
        if !self.initial_estimate.is_finite() || self.initial_estimate < 0.0 {
            self.initial_estimate = DEFAULT_INITIAL_ESTIMATE_MS as f64;
        }
        self
    }
}

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::parse(&config_s)
    }

    /// Parses configuration text.
    pub fn parse(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("invalid configuration: {}", e);
                error!("parse(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }

    fn get_kernel_config(&self) -> Result<&Yaml, Fail> {
        Self::get_subsection(&self.0, kernel_config::SECTION_NAME)
    }

    /// A missing section reads as `BadValue`, so every option in it falls back to its default.
    fn get_optional_subsection(&self, index: &str) -> &Yaml {
        self.0.index(index)
    }

    /// Kernel config: Reads the listening address from the environment variable first and then the underlying
    /// configuration file.
    pub fn listen_addr(&self) -> Result<SocketAddr, Fail> {
        self.get_addr(kernel_config::LISTEN_ADDR)
    }

    /// Kernel config: Reads the memory manager address.
    pub fn memory_addr(&self) -> Result<SocketAddr, Fail> {
        self.get_addr(kernel_config::MEMORY_ADDR)
    }

    /// Kernel config: Reads the log level. Defaults to `info`.
    pub fn log_level(&self) -> Result<String, Fail> {
        if let Some(level) = Self::get_typed_env_option::<String>(kernel_config::LOG_LEVEL)? {
            return Ok(level);
        }
        match self.get_kernel_config() {
            Ok(section) => Ok(Self::get_optional_str(section, kernel_config::LOG_LEVEL)?
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())),
            Err(_) => Ok(DEFAULT_LOG_LEVEL.to_string()),
        }
    }

    /// Transport config: Reads the connection and request timeouts.
    pub fn transport_options(&self) -> Result<TransportOptions, Fail> {
        let section: &Yaml = self.get_optional_subsection(transport_config::SECTION_NAME);
        let defaults: TransportOptions = TransportOptions::default();
        Ok(TransportOptions {
            connect_timeout: Self::get_millis_option(section, transport_config::CONNECT_TIMEOUT)?
                .unwrap_or(defaults.connect_timeout),
            request_timeout: Self::get_millis_option(section, transport_config::REQUEST_TIMEOUT)?
                .unwrap_or(defaults.request_timeout),
        })
    }

    /// Scheduler config: Reads every scheduler option, falling back to defaults for missing keys and for values that
    /// are out of range.
    pub fn scheduler_options(&self) -> Result<SchedulerOptions, Fail> {
        let section: &Yaml = self.get_optional_subsection(scheduler_config::SECTION_NAME);
        let defaults: SchedulerOptions = SchedulerOptions::default();

        let dispatch_policy: DispatchPolicy = match Self::get_string(section, scheduler_config::DISPATCH_POLICY)? {
            Some(name) => DispatchPolicy::from_str(&name).unwrap_or_else(|_| {
                warn!("scheduler_options(): unknown dispatch policy {:?}, using FIFO", name);
                DispatchPolicy::Fifo
            }),
            None => defaults.dispatch_policy,
        };
        let admission_policy: AdmissionPolicy = match Self::get_string(section, scheduler_config::ADMISSION_POLICY)? {
            Some(name) => AdmissionPolicy::from_str(&name).unwrap_or_else(|_| {
                warn!("scheduler_options(): unknown admission policy {:?}, using FIFO", name);
                AdmissionPolicy::Fifo
            }),
            None => defaults.admission_policy,
        };
        let io_unavailable_policy: IoUnavailablePolicy =
            match Self::get_string(section, scheduler_config::IO_UNAVAILABLE_POLICY)? {
                Some(name) => IoUnavailablePolicy::from_str(&name).unwrap_or_else(|_| {
                    warn!("scheduler_options(): unknown io_unavailable_policy {:?}, using CONTINUE", name);
                    IoUnavailablePolicy::Continue
                }),
                None => defaults.io_unavailable_policy,
            };

        let options: SchedulerOptions = SchedulerOptions {
            dispatch_policy,
            admission_policy,
            alpha: Self::get_float(section, scheduler_config::ALPHA)?.unwrap_or(defaults.alpha),
            initial_estimate: Self::get_float(section, scheduler_config::INITIAL_ESTIMATE)?
                .unwrap_or(defaults.initial_estimate),
            suspension_timeout: Self::get_millis_option(section, scheduler_config::SUSPENSION_TIMEOUT)?
                .unwrap_or(defaults.suspension_timeout),
            multiprogramming: Self::get_int::<i64>(section, scheduler_config::MULTIPROGRAMMING)?
                .map(|n: i64| n.max(0) as usize)
                .unwrap_or(defaults.multiprogramming),
            memory_init_attempts: Self::get_int::<u32>(section, scheduler_config::MEMORY_INIT_ATTEMPTS)?
                .unwrap_or(defaults.memory_init_attempts),
            memory_init_retry_delay: Self::get_millis_option(section, scheduler_config::MEMORY_INIT_RETRY_DELAY)?
                .unwrap_or(defaults.memory_init_retry_delay),
            io_unavailable_policy,
            bootstrap_memory_init: Self::get_bool(section, scheduler_config::BOOTSTRAP_MEMORY_INIT)?
                .unwrap_or(defaults.bootstrap_memory_init),
        };
        Ok(options.validated())
    }

    fn get_addr(&self, index: &str) -> Result<SocketAddr, Fail> {
        if let Some(addr) = Self::get_typed_env_option(index)? {
            return Ok(addr);
        }
        Self::get_typed_str_option(self.get_kernel_config()?, index, |val: &str| val.parse().ok())
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Similar to `get_typed_option` using `Yaml::as_hash` receiver. This method returns a `&Yaml` instead of
    /// yaml::Hash, and Yaml is more natural for indexing.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find value at `index`, validating it as a string.
    fn get_typed_str_option<T, Fn>(yaml: &Yaml, index: &str, parser: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&str) -> Option<T>,
    {
        let option: &Yaml = Self::get_option(yaml, index)?;
        if let Some(value) = option.as_str() {
            if let Some(value) = parser(value) {
                return Ok(value);
            }
        }
        let message: String = format!("parameter {} has unexpected type", index);
        Err(Fail::new(libc::EINVAL, message.as_str()))
    }

    /// Same as indexing `yaml`, but a missing key (or section) yields `None`.
    fn get_optional<'a>(yaml: &'a Yaml, index: &str) -> Option<&'a Yaml> {
        match yaml {
            Yaml::Hash(_) => match yaml.index(index) {
                Yaml::BadValue | Yaml::Null => None,
                value => Some(value),
            },
            _ => None,
        }
    }

    fn get_optional_str(yaml: &Yaml, index: &str) -> Result<Option<String>, Fail> {
        match Self::get_optional(yaml, index) {
            None => Ok(None),
            Some(value) => match value.as_str() {
                Some(value) => Ok(Some(value.to_string())),
                None => {
                    let message: String = format!("parameter {} has unexpected type", index);
                    Err(Fail::new(libc::EINVAL, message.as_str()))
                },
            },
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        // Check for the environment variable.
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    fn get_string(yaml: &Yaml, index: &str) -> Result<Option<String>, Fail> {
        match Self::get_typed_env_option::<String>(index)? {
            Some(value) => Ok(Some(value)),
            None => Self::get_optional_str(yaml, index),
        }
    }

    /// Reads an integer option, verifying that the destination type may hold the value.
    fn get_int<T: TryFrom<i64> + FromStr>(yaml: &Yaml, index: &str) -> Result<Option<T>, Fail> {
        if let Some(value) = Self::get_typed_env_option::<T>(index)? {
            return Ok(Some(value));
        }
        let val: i64 = match Self::get_optional(yaml, index) {
            None => return Ok(None),
            Some(value) => match value.as_i64() {
                Some(val) => val,
                None => {
                    let message: String = format!("parameter {} has unexpected type", index);
                    return Err(Fail::new(libc::EINVAL, message.as_str()));
                },
            },
        };
        match T::try_from(val) {
            Ok(val) => Ok(Some(val)),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }

    /// Reads a floating point option. Integers are accepted as well.
    fn get_float(yaml: &Yaml, index: &str) -> Result<Option<f64>, Fail> {
        if let Some(value) = Self::get_typed_env_option::<f64>(index)? {
            return Ok(Some(value));
        }
        match Self::get_optional(yaml, index) {
            None => Ok(None),
            Some(Yaml::Integer(val)) => Ok(Some(*val as f64)),
            Some(value) => match value.as_f64() {
                Some(val) => Ok(Some(val)),
                None => {
                    let message: String = format!("parameter {} has unexpected type", index);
                    Err(Fail::new(libc::EINVAL, message.as_str()))
                },
            },
        }
    }

    fn get_bool(yaml: &Yaml, index: &str) -> Result<Option<bool>, Fail> {
        if let Some(value) = Self::get_typed_env_option::<bool>(index)? {
            return Ok(Some(value));
        }
        match Self::get_optional(yaml, index) {
            None => Ok(None),
            Some(value) => match value.as_bool() {
                Some(val) => Ok(Some(val)),
                None => {
                    let message: String = format!("parameter {} has unexpected type", index);
                    Err(Fail::new(libc::EINVAL, message.as_str()))
                },
            },
        }
    }

    /// Reads a duration given in milliseconds.
    fn get_millis_option(yaml: &Yaml, index: &str) -> Result<Option<Duration>, Fail> {
        Ok(Self::get_int::<u64>(yaml, index)?.map(Duration::from_millis))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            dispatch_policy: DispatchPolicy::Fifo,
            admission_policy: AdmissionPolicy::Fifo,
            alpha: DEFAULT_ALPHA,
            initial_estimate: DEFAULT_INITIAL_ESTIMATE_MS as f64,
            suspension_timeout: Duration::from_millis(DEFAULT_SUSPENSION_TIMEOUT_MS),
            multiprogramming: DEFAULT_MULTIPROGRAMMING,
            memory_init_attempts: DEFAULT_MEMORY_INIT_ATTEMPTS,
            memory_init_retry_delay: Duration::from_millis(DEFAULT_MEMORY_INIT_RETRY_DELAY_MS),
            io_unavailable_policy: IoUnavailablePolicy::Continue,
            bootstrap_memory_init: false,
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: limits::CONNECT_TIMEOUT_DEFAULT,
            request_timeout: limits::REQUEST_TIMEOUT_DEFAULT,
        }
    }
}

impl FromStr for IoUnavailablePolicy {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CONTINUE" => Ok(Self::Continue),
            "FINALIZE" => Ok(Self::Finalize),
            _ => Err(Fail::new(libc::EINVAL, "unknown io_unavailable_policy")),
        }
    }
}

impl fmt::Display for IoUnavailablePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "CONTINUE"),
            Self::Finalize => write!(f, "FINALIZE"),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
