pub mod config;
pub mod controller;
pub mod entities;
pub mod logging;
pub mod network;
pub mod partition;
pub mod profiling;
pub mod scenario;
pub mod scheduler;
