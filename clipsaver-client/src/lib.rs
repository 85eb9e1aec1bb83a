pub mod clipboard;
pub mod logging;
pub mod relay;
pub mod store;
pub mod worker;
