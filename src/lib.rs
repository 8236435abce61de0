// lib.rs
#![warn(clippy::large_futures)]
#![allow(async_fn_in_trait)]

pub use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

pub use anyhow::bail;
pub use serde::{Deserialize, Serialize};
pub use tokio::time::{Duration, sleep};

mod config;
pub use config::*;

mod cache;
pub use cache::*;

mod session;
pub use session::*;

mod power;
pub use power::*;

mod runtime;
pub use runtime::*;

mod clock;
pub use clock::*;

mod state;
pub use state::*;

mod sensors;
pub use sensors::*;

mod display;
pub use display::*;

mod publisher;
pub use publisher::*;

mod webserver;
pub use webserver::*;

mod sim;
pub use sim::*;

pub const FW_VERSION: &str = env!("CARGO_PKG_VERSION");

// EOF
