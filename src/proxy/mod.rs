// Gateway core

pub mod admission;
pub mod common;
pub mod handlers;
pub mod mappers;
pub mod middleware;
pub mod monitor;
pub mod server;
pub mod telemetry;
pub mod upstream;
