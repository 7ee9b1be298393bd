//! A library and application for flashing MeshCore firmware onto ESP32 and
//! nRF52 devices.
//!
//! [meshflash] walks a user through selecting a device and a firmware
//! version from a published catalog, then either programs the device over a
//! serial connection or opens an interactive console on it.
//!
//! ## As an application
//!
//! [meshflash] can be installed using `cargo install`:
//!
//! ```bash
//! $ cargo install meshflash --locked
//! ```
//!
//! ## As a library
//!
//! [meshflash] can be used as a library in other applications:
//!
//! ```toml
//! meshflash = { version = "0.1", default-features = false }
//! ```
//!
//! The catalog, selection and dispatching types do not depend on any of the
//! interactive front-end crates, which are gated behind the `cli` feature.
//!
//! [meshflash]: https://crates.io/crates/meshflash

pub use self::error::{DfuError, Error};

pub mod catalog;
#[cfg(feature = "cli")]
pub mod cli;
pub mod console;
pub mod dfu;
pub mod esp;
pub mod flashing;
pub mod progress;
pub mod selection;

mod error;

/// Logging utilities
#[cfg(feature = "cli")]
pub mod logging {
    use env_logger::{Builder, Env};
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
