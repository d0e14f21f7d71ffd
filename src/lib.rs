// Library exports for pipelog

pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod logs;
pub mod process;
pub mod signal;
pub mod state;
