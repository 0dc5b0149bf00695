pub mod config;
pub mod demo;
pub mod driver;
pub mod time_step;
