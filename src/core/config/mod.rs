pub mod data;
pub mod io;

pub use data::{Config, McpServerConfig, ProviderSettings};
pub use io::ConfigError;

#[cfg(test)]
mod tests;
