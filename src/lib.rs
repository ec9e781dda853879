pub mod logging;
pub mod swap;
