//! Profibus-DP driver.
//!
//! Reuses the S7 ISO-on-TCP transport in DP client mode: rack and slot
//! are forced to 0/0 and the configured slave address selects the remote
//! station through the TSAP. Area addressing and the read-only rules are
//! identical to the S7 driver.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ProtocolConfig;
use crate::driver::{ProtocolDriver, ReadRequest, WriteRequest};
use crate::error::GatewayResult;
use crate::iso_tcp::ConnectionType;
use crate::s7::S7Driver;
use crate::supervisor::ConnectionSupervisor;
use crate::value::PlcValue;

/// Profibus-DP driver, a DP-mode veneer over the S7 core.
pub struct ProfibusDriver {
    inner: Arc<S7Driver>,
}

impl ProfibusDriver {
    /// Build from configuration. `slave_address` addresses the DP slave;
    /// rack and slot are always 0/0 in DP mode.
    pub fn new(config: ProtocolConfig) -> Arc<Self> {
        let slave = config.slave_address as u16;
        let inner = S7Driver::with_endpoint(config, 0, slave, ConnectionType::Basic);
        Arc::new(ProfibusDriver { inner })
    }
}

#[async_trait]
impl ProtocolDriver for ProfibusDriver {
    async fn connect(&self) -> GatewayResult<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) -> GatewayResult<()> {
        self.inner.disconnect().await
    }

    async fn read(&self, request: &ReadRequest) -> GatewayResult<Vec<PlcValue>> {
        self.inner.read(request).await
    }

    async fn write(&self, request: &WriteRequest) -> GatewayResult<()> {
        self.inner.write(request).await
    }

    async fn ping(&self) -> bool {
        self.inner.ping().await
    }

    fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        self.inner.supervisor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolKind;
    use crate::error::GatewayError;
    use crate::value::DataType;

    fn driver() -> Arc<ProfibusDriver> {
        let mut config = ProtocolConfig::new(ProtocolKind::ProfibusDp, "127.0.0.1")
            .with_heartbeat_interval_ms(0);
        config.slave_address = 4;
        ProfibusDriver::new(config)
    }

    #[tokio::test]
    async fn test_read_only_area_write_rejected() {
        let d = driver();
        let result = d
            .write(&WriteRequest::new("I0.0", true, DataType::Bool))
            .await;
        assert!(matches!(result, Err(GatewayError::Address { .. })));
    }

    #[test]
    fn test_kind_preserved_in_status() {
        let d = driver();
        assert_eq!(d.status().protocol_kind, ProtocolKind::ProfibusDp);
    }
}
