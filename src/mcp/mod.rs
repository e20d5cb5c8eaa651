pub mod client;
pub mod pool;
pub mod session;
pub mod tool;
pub mod transport;
pub mod user_sessions;

#[cfg(test)]
pub(crate) mod test_support;
