//! Host telemetry agent: collectors run on their own cadence and emit
//! canonical, tagged time-series points into one stream.

pub mod agent;
pub mod collector;
pub mod config;
pub mod context;
pub mod datapoint;
pub mod dispatch;
pub mod export;
pub mod metadata;
pub mod output;
pub mod process;
