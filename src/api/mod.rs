//! HTTP surface: trigger a run, look one up, health

mod server;

pub use server::{router, ApiServer, ApiState};
