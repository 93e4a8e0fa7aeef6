//! Physical connection driver: adopt an existing link.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::dataplane::Dataplane;
use crate::model::TransportConfig;

use super::{ConnCtx, ConnectionDriver, ConnectionState, DriverError};

pub struct PhysicalDriver {
    dp: Arc<dyn Dataplane>,
}

impl PhysicalDriver {
    pub fn new(dp: Arc<dyn Dataplane>) -> Self {
        Self { dp }
    }
}

#[async_trait]
impl ConnectionDriver for PhysicalDriver {
    async fn apply(&self, ctx: &ConnCtx<'_>) -> Result<ConnectionState, DriverError> {
        let TransportConfig::Physical(config) = &ctx.conn.config else {
            return Err(DriverError::Fatal("not a physical connection".to_string()));
        };
        self.dp.link_adopt(&ctx.ni.id, &config.interface_name).await?;
        self.dp
            .addr_sync(&ctx.ni.id, &config.interface_name, &ctx.addrs)
            .await?;
        self.dp.link_up(&ctx.ni.id, &config.interface_name).await?;
        Ok(ConnectionState::Connecting)
    }

    async fn observe(&self, ctx: &ConnCtx<'_>) -> Result<ConnectionState, DriverError> {
        let ifname = ctx.interface_name();
        if !self.dp.link_exists(&ctx.ni.id, &ifname).await? {
            return Ok(ConnectionState::Idle);
        }
        if self.dp.link_is_up(&ctx.ni.id, &ifname).await? {
            Ok(ConnectionState::Active)
        } else {
            Ok(ConnectionState::Degraded)
        }
    }

    async fn teardown(&self, ctx: &ConnCtx<'_>) -> Result<(), DriverError> {
        let ifname = ctx.interface_name();
        info!(ni = %ctx.ni.id, link = %ifname, "returning physical link");
        self.dp.link_release(&ctx.ni.id, &ifname).await?;
        Ok(())
    }
}
