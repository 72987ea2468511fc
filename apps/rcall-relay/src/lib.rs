pub mod config;
pub mod relay;

pub use relay::{RelayState, router, serve};
