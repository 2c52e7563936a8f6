mod model;
mod settings;

pub use model::{DataKind, DeviceConfig, GatewayConfig, ProjectConfig, Protocol, TagConfig};
