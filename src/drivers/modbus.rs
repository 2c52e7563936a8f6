use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tracing::debug;

use crate::config::{DataKind, DeviceConfig, TagConfig};
use crate::error::GatewayError;
use crate::snapshot::Value;

use super::traits::{ProtocolDriver, WriteOutcome};

/// Modbus/TCP adapter (§4.1). Addresses are integer register offsets: bool
/// reads/writes a single coil, int reads/writes a single holding register,
/// float reads/writes two consecutive holding registers as big-endian
/// IEEE-754 (§4.1, per `original_source/driver/modbus_driver_process.py`).
pub struct ModbusTcpDriver {
    config: DeviceConfig,
    context: Option<Context>,
}

impl ModbusTcpDriver {
    pub fn new(config: DeviceConfig) -> Self {
        ModbusTcpDriver {
            config,
            context: None,
        }
    }

    fn parse_address(address: &str) -> Result<u16, GatewayError> {
        address
            .parse::<u16>()
            .map_err(|e| GatewayError::Configuration(format!("bad register address {address}: {e}")))
    }

    fn registers_to_f32(hi: u16, lo: u16) -> f32 {
        let bits = ((hi as u32) << 16) | (lo as u32);
        f32::from_bits(bits)
    }

    fn f32_to_registers(value: f32) -> [u16; 2] {
        let bits = value.to_bits();
        [((bits >> 16) & 0xFFFF) as u16, (bits & 0xFFFF) as u16]
    }

    async fn read_one(ctx: &mut Context, tag: &TagConfig) -> Result<Value, GatewayError> {
        let addr = Self::parse_address(&tag.address)?;
        match tag.data_kind {
            DataKind::Bool => {
                let coils = ctx
                    .read_coils(addr, 1)
                    .await
                    .map_err(|e| GatewayError::Transport(format!("coil read failed: {e}")))?
                    .map_err(|e| GatewayError::Protocol(format!("exception reading coil: {e}")))?;
                Ok(Value::Bool(coils.first().copied().unwrap_or(false)))
            }
            DataKind::Int => {
                let regs = ctx
                    .read_holding_registers(addr, 1)
                    .await
                    .map_err(|e| GatewayError::Transport(format!("register read failed: {e}")))?
                    .map_err(|e| GatewayError::Protocol(format!("exception reading register: {e}")))?;
                Ok(Value::Int(regs.first().copied().unwrap_or(0) as i64))
            }
            DataKind::Float => {
                let regs = ctx
                    .read_holding_registers(addr, 2)
                    .await
                    .map_err(|e| GatewayError::Transport(format!("register read failed: {e}")))?
                    .map_err(|e| GatewayError::Protocol(format!("exception reading registers: {e}")))?;
                if regs.len() < 2 {
                    return Err(GatewayError::Protocol("short register read".into()));
                }
                Ok(Value::Float(Self::registers_to_f32(regs[0], regs[1]) as f64))
            }
            DataKind::String => Err(GatewayError::Coercion(
                "modbus has no native string representation".into(),
            )),
        }
    }
}

#[async_trait]
impl ProtocolDriver for ModbusTcpDriver {
    async fn open(&mut self, timeout: Duration) -> Result<(), GatewayError> {
        let socket_addr = self
            .config
            .endpoint
            .parse()
            .map_err(|e| GatewayError::Configuration(format!("bad endpoint {}: {e}", self.config.endpoint)))?;

        debug!(device = %self.config.id, endpoint = %self.config.endpoint, "opening modbus/tcp session");

        let mut ctx = tokio::time::timeout(timeout, tcp::connect(socket_addr))
            .await
            .map_err(|_| GatewayError::Transport("connect timed out".into()))?
            .map_err(|e| GatewayError::Transport(format!("connect failed: {e}")))?;

        if let Some(slave_id) = self.config.slave_id {
            ctx.set_slave(Slave(slave_id));
        }

        self.context = Some(ctx);
        Ok(())
    }

    async fn read(&mut self, tags: &[TagConfig]) -> Vec<Result<Value, GatewayError>> {
        let ctx = match self.context.as_mut() {
            Some(c) => c,
            None => {
                return tags
                    .iter()
                    .map(|_| Err(GatewayError::Transport("not connected".into())))
                    .collect()
            }
        };

        let mut out = Vec::with_capacity(tags.len());
        for tag in tags {
            out.push(Self::read_one(ctx, tag).await);
        }
        out
    }

    async fn write(
        &mut self,
        address: &str,
        value: Value,
        kind: DataKind,
    ) -> Result<WriteOutcome, GatewayError> {
        let ctx = self
            .context
            .as_mut()
            .ok_or_else(|| GatewayError::Transport("not connected".into()))?;
        let addr = Self::parse_address(address)?;

        match (kind, &value) {
            (DataKind::Bool, Value::Bool(b)) => {
                ctx.write_single_coil(addr, *b)
                    .await
                    .map_err(|e| GatewayError::Transport(format!("coil write failed: {e}")))?
                    .map_err(|e| GatewayError::Protocol(format!("exception writing coil: {e}")))?;
            }
            (DataKind::Int, Value::Int(i)) => {
                ctx.write_single_register(addr, *i as u16)
                    .await
                    .map_err(|e| GatewayError::Transport(format!("register write failed: {e}")))?
                    .map_err(|e| GatewayError::Protocol(format!("exception writing register: {e}")))?;
            }
            (DataKind::Float, Value::Float(f)) => {
                let regs = Self::f32_to_registers(*f as f32);
                ctx.write_multiple_registers(addr, &regs)
                    .await
                    .map_err(|e| GatewayError::Transport(format!("register write failed: {e}")))?
                    .map_err(|e| GatewayError::Protocol(format!("exception writing registers: {e}")))?;
            }
            (kind, value) => {
                return Err(GatewayError::Coercion(format!(
                    "cannot write {value:?} as {kind:?} over modbus"
                )))
            }
        }

        Ok(WriteOutcome::unconfirmed())
    }

    async fn close(&mut self) {
        self.context = None;
    }

    fn alive(&self) -> bool {
        self.context.is_some()
    }
}
