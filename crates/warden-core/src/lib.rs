//! Host side of the warden plugin system: discover plugin executables, run
//! each in its own process and call its functions over loopback RPC.

pub mod client;
pub mod config;
pub mod error;
pub mod loader;
pub mod plugin;
pub mod port;
pub mod process;
pub mod registry;
pub mod runtime;

#[cfg(test)]
mod testing;

pub use error::{Phase, PluginError};
pub use loader::Loader;
pub use plugin::{Plugin, PluginState};
pub use registry::Registry;
pub use runtime::Runtime;

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
