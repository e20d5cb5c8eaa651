pub mod data;
pub mod defaults;
pub mod io;

pub use data::{OAuthConfig, PoolConfig, ServerConfig};
pub use io::ConfigError;

#[cfg(test)]
mod tests;
