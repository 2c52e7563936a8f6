mod controllogix;
mod modbus;
mod mqtt;
mod sql;
mod traits;

pub use controllogix::ControlLogixDriver;
pub use modbus::ModbusTcpDriver;
pub use mqtt::MqttDriver;
pub use sql::SqlDriver;
pub use traits::{ProtocolDriver, WriteOutcome};

use crate::config::{DeviceConfig, Protocol};
use crate::error::GatewayError;

/// Selects the concrete adapter for a device's configured `protocol`
/// (§4.1, §9 — factory by the `tipo` string rather than reflection).
pub fn build_driver(config: &DeviceConfig) -> Result<Box<dyn ProtocolDriver>, GatewayError> {
    Ok(match config.protocol {
        Protocol::Controllogix => Box::new(ControlLogixDriver::new(config.clone())),
        Protocol::ModbusTcp => Box::new(ModbusTcpDriver::new(config.clone())),
        Protocol::Mqtt => Box::new(MqttDriver::new(config.clone())),
        Protocol::Sql => Box::new(SqlDriver::new(config.clone())?),
    })
}
