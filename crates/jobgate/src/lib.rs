pub mod common;
pub mod server;
pub mod store;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::GatewayError;
pub type Result<T> = std::result::Result<T, Error>;

pub const JOBGATE_VERSION: &str = {
    match option_env!("JOBGATE_BUILD_VERSION") {
        Some(version) => version,
        None => env!("CARGO_PKG_VERSION"),
    }
};
