//! Industrial data-acquisition and control gateway: polls ControlLogix/CIP,
//! Modbus/TCP, MQTT, and SQL field devices, maintains a live tag snapshot,
//! routes writes back out through a bounded per-device queue, fans changed
//! values out to a cognitive collaborator, and exposes both over an HTTP
//! control plane.

pub mod api;
pub mod cognitive;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fanout;
pub mod logbus;
pub mod logging;
pub mod routing;
pub mod snapshot;
pub mod supervisor;
pub mod worker;
