//! Modbus transport and point-map decode/encode.
//!
//! A point is decoded/encoded identically whether the wire is a real TCP
//! socket (`remote`) or the in-process emulator register bank (`local`) —
//! both implement [`ModbusTransport`]. This mirrors the data-driven point
//! map in `domain::modbus_point`: nothing here hardcodes a vendor register
//! layout, every address and scale comes from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::modbus_point::{decode_point, encode_point};
use crate::domain::{ByteOrder, PointName, PointSpec, TransportMode, WordOrder};
use crate::errors::TransportError;

/// A fully resolved per-plant, per-transport-mode Modbus endpoint contract.
/// Grounded in the original source's `runtime.contracts.resolve_modbus_endpoint`.
#[derive(Debug, Clone)]
pub struct ModbusEndpoint {
    pub host: String,
    pub port: u16,
    pub byte_order: ByteOrder,
    pub word_order: WordOrder,
    pub points: HashMap<PointName, PointSpec>,
}

impl ModbusEndpoint {
    pub fn point(&self, name: &str) -> Result<&PointSpec> {
        self.points
            .get(name)
            .ok_or_else(|| anyhow!("endpoint has no point named {name}"))
    }
}

/// Holding-register bank shared in-process by the `local` transport. The
/// Plant Emulator owns and mutates it directly; every other local-mode task
/// reads/writes through [`LocalTransport`] instead of a real socket.
#[derive(Debug, Default)]
pub struct RegisterBank {
    registers: RwLock<HashMap<u16, u16>>,
}

impl RegisterBank {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn read(&self, address: u16, count: u16) -> Vec<u16> {
        let regs = self.registers.read();
        (address..address + count)
            .map(|a| *regs.get(&a).unwrap_or(&0))
            .collect()
    }

    pub fn write(&self, address: u16, values: &[u16]) {
        let mut regs = self.registers.write();
        for (i, v) in values.iter().enumerate() {
            regs.insert(address + i as u16, *v);
        }
    }
}

#[async_trait]
pub trait ModbusTransport: Send + Sync {
    async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, TransportError>;
    async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<(), TransportError>;
}

/// Transport for `TransportMode::Local`: reads and writes go straight to the
/// shared register bank owned by the Plant Emulator, no socket involved.
pub struct LocalTransport {
    bank: Arc<RegisterBank>,
}

impl LocalTransport {
    pub fn new(bank: Arc<RegisterBank>) -> Self {
        Self { bank }
    }
}

#[async_trait]
impl ModbusTransport for LocalTransport {
    async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
        Ok(self.bank.read(address, count))
    }

    async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<(), TransportError> {
        self.bank.write(address, values);
        Ok(())
    }
}

/// Read one named point, honoring the endpoint's byte/word order.
pub async fn read_point(
    transport: &dyn ModbusTransport,
    endpoint: &ModbusEndpoint,
    name: &str,
) -> Result<f64> {
    let spec = endpoint.point(name)?;
    let words = transport
        .read_holding_registers(spec.address, spec.format.word_count())
        .await?;
    Ok(decode_point(&words, spec, endpoint.byte_order, endpoint.word_order)?)
}

/// Write one named point, honoring the endpoint's byte/word order.
pub async fn write_point(
    transport: &dyn ModbusTransport,
    endpoint: &ModbusEndpoint,
    name: &str,
    value: f64,
) -> Result<()> {
    let spec = endpoint.point(name)?;
    let words = encode_point(value, spec, endpoint.byte_order, endpoint.word_order)?;
    transport.write_multiple_registers(spec.address, &words).await?;
    Ok(())
}

/// Both transport candidates for one plant. The `local` candidate always
/// exists (the in-process emulator); `remote` is only populated when a real
/// controller endpoint is configured. Agents resolve which one to use per
/// tick from `SharedState::transport_mode`, so a `transport.switch` command
/// takes effect on every agent's next tick without any agent needing to be
/// restarted.
#[derive(Clone)]
pub struct PlantTransport {
    pub local: (ModbusEndpoint, Arc<dyn ModbusTransport>),
    pub remote: Option<(ModbusEndpoint, Arc<dyn ModbusTransport>)>,
}

impl PlantTransport {
    pub fn resolve(&self, mode: TransportMode) -> (&ModbusEndpoint, &dyn ModbusTransport) {
        match mode {
            TransportMode::Remote if self.remote.is_some() => {
                let (endpoint, transport) = self.remote.as_ref().unwrap();
                (endpoint, transport.as_ref())
            }
            _ => (&self.local.0, self.local.1.as_ref()),
        }
    }
}

#[cfg(feature = "modbus")]
pub mod remote {
    use super::{async_trait, ModbusTransport, Result, TransportError};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_modbus::client::tcp;
    use tokio_modbus::prelude::*;

    /// Transport for `TransportMode::Remote`: a real Modbus/TCP client
    /// against the physical controller.
    pub struct RemoteTransport {
        context: Arc<Mutex<tokio_modbus::client::Context>>,
        unit_id: u8,
    }

    impl RemoteTransport {
        pub async fn connect(host: &str, port: u16, unit_id: u8) -> Result<Self> {
            let socket_addr = format!("{host}:{port}")
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid socket address {host}:{port}: {e}"))?;
            let ctx = tcp::connect(socket_addr)
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            Ok(Self {
                context: Arc::new(Mutex::new(ctx)),
                unit_id,
            })
        }
    }

    #[async_trait]
    impl ModbusTransport for RemoteTransport {
        async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, TransportError> {
            let mut ctx = self.context.lock().await;
            ctx.set_slave(Slave(self.unit_id));
            ctx.read_holding_registers(address, count)
                .await
                .map_err(|e| TransportError::ReadFailed(e.to_string()))
        }

        async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<(), TransportError> {
            let mut ctx = self.context.lock().await;
            ctx.set_slave(Slave(self.unit_id));
            ctx.write_multiple_registers(address, values)
                .await
                .map_err(|e| TransportError::WriteFailed(e.to_string()))
        }
    }
}

#[cfg(not(feature = "modbus"))]
pub mod remote {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PointAccess, RegisterFormat};

    fn endpoint() -> ModbusEndpoint {
        let mut points = HashMap::new();
        points.insert(
            "p_setpoint".to_string(),
            PointSpec {
                address: 100,
                format: RegisterFormat::Int32,
                access: PointAccess::Rw,
                unit: "kW".to_string(),
                eng_per_count: 0.1,
            },
        );
        ModbusEndpoint {
            host: "localhost".to_string(),
            port: 5020,
            byte_order: ByteOrder::Big,
            word_order: WordOrder::MswFirst,
            points,
        }
    }

    #[tokio::test]
    async fn local_transport_round_trips_through_register_bank() {
        let bank = RegisterBank::new();
        let transport = LocalTransport::new(bank);
        let endpoint = endpoint();

        write_point(&transport, &endpoint, "p_setpoint", 123.4).await.unwrap();
        let value = read_point(&transport, &endpoint, "p_setpoint").await.unwrap();
        assert!((value - 123.4).abs() <= 0.1);
    }

    #[tokio::test]
    async fn reading_unknown_point_errors() {
        let bank = RegisterBank::new();
        let transport = LocalTransport::new(bank);
        let endpoint = endpoint();
        assert!(read_point(&transport, &endpoint, "not_a_point").await.is_err());
    }
}
