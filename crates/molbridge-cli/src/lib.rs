//! molbridge-cli: operator tooling around the molbridge worker bridge.

pub mod logging;
pub mod relay;
