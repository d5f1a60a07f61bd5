pub mod amas;
pub mod cache;
pub mod config;
pub mod core;
pub mod db;
pub mod logging;
pub mod services;
pub mod state;
pub mod workers;

pub use state::AmasRuntime;
