//! Loader configuration.
//!
//! A [`Config`] is built once, before [`crate::initialize_with`], and stays
//! fixed for the rest of the process. Every field has a default that suits
//! ordinary statically-linked Linux programs:
//!
//! | Field                  | Default                  |
//! | ---------------------- | ------------------------ |
//! | `log_level`            | `Warn`                   |
//! | `page_size`            | page size of the system  |
//! | `foreign_trap_status`  | `139`                    |
//! | `stack_size`           | 8 MiB                    |
//! | `alternate_stack_size` | 64 KiB                   |
//! | `reserve_segments`     | `true`                   |
//!
//! The log level can also be picked from the `LAZYLOAD_LOG` environment
//! variable (`off`, `error`, `warn`, `info`, `debug` or `trace`) through
//! [`Config::from_env`].

use crate::PageSize;
use log::LevelFilter;

/// Environment variable holding the log level.
pub const LOG_ENV: &str = "LAZYLOAD_LOG";

/// The settings of the loader.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Most verbose log level printed.
    pub log_level: LevelFilter,
    /// Granularity at which pages are serviced.
    pub page_size: PageSize,
    /// Exit status of the process when a trap other than an invalid memory
    /// access reaches the handler.
    pub foreign_trap_status: i32,
    /// Size of the initial stack of the program.
    pub stack_size: usize,
    /// Size of the stack the trap handler runs on.
    pub alternate_stack_size: usize,
    /// Whether the page spans of the segments are reserved before the
    /// program starts.
    pub reserve_segments: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LevelFilter::Warn,
            page_size: PageSize::host(),
            foreign_trap_status: 139,
            stack_size: 8 << 20,
            alternate_stack_size: 64 << 10,
            reserve_segments: true,
        }
    }
}

impl Config {
    /// Starts building a configuration from the defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// The default configuration, with the log level taken from
    /// `LAZYLOAD_LOG` if it is set to a valid level.
    pub fn from_env() -> Self {
        Self::builder().env_log_level().build()
    }
}

/// A builder for [`Config`].
///
/// ```
/// use lazyload::Config;
///
/// let config = Config::builder()
///     .stack_size(1 << 20)
///     .reserve_segments(false)
///     .build();
/// assert_eq!(config.stack_size, 1 << 20);
/// ```
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Sets the most verbose log level printed.
    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.config.log_level = level;
        self
    }

    /// Applies the log level in `LAZYLOAD_LOG`, if any.
    pub fn env_log_level(self) -> Self {
        let spec = std::env::var(LOG_ENV).ok();
        self.log_spec(spec.as_deref())
    }

    fn log_spec(mut self, spec: Option<&str>) -> Self {
        if let Some(level) = spec.and_then(|s| s.trim().parse().ok()) {
            self.config.log_level = level;
        }
        self
    }

    /// Sets the page size.
    pub fn page_size(mut self, page_size: PageSize) -> Self {
        self.config.page_size = page_size;
        self
    }

    /// Sets the exit status used for traps that are not invalid accesses.
    pub fn foreign_trap_status(mut self, status: i32) -> Self {
        self.config.foreign_trap_status = status;
        self
    }

    /// Sets the size of the initial stack of the program.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.config.stack_size = bytes;
        self
    }

    /// Sets the size of the stack the trap handler runs on.
    pub fn alternate_stack_size(mut self, bytes: usize) -> Self {
        self.config.alternate_stack_size = bytes;
        self
    }

    /// Enables or disables the reservation of segment page spans.
    pub fn reserve_segments(mut self, reserve: bool) -> Self {
        self.config.reserve_segments = reserve;
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}
