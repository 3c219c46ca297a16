pub mod fmt;
pub mod logging;
