//! IPsec connection driver.
//!
//! Owns the per-connection XFRM link and the swanctl connection block.
//! The XFRM device is created in the EXTERNAL instance (where the IKE
//! daemon terminates the outer packets) and moved into the tenant
//! instance, matching on the derived if_id on both sides.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::alloc::xfrm_if_id;
use crate::config::EXTERNAL_NI;
use crate::dataplane::{Dataplane, LinkKind, LinkSpec};
use crate::ike::{swanctl, IkeControl};
use crate::model::{Initiation, TransportConfig};

use super::{ConnCtx, ConnectionDriver, ConnectionState, DriverError};

pub struct IpsecDriver {
    dp: Arc<dyn Dataplane>,
    ike: Arc<dyn IkeControl>,
}

impl IpsecDriver {
    pub fn new(dp: Arc<dyn Dataplane>, ike: Arc<dyn IkeControl>) -> Self {
        Self { dp, ike }
    }

    fn link_spec(ctx: &ConnCtx<'_>) -> LinkSpec {
        LinkSpec {
            name: ctx.interface_name(),
            kind: LinkKind::Xfrm {
                if_id: xfrm_if_id(ctx.info.as_ref(), ctx.conn.id),
            },
            parent_ns: Some(EXTERNAL_NI.to_string()),
        }
    }
}

#[async_trait]
impl ConnectionDriver for IpsecDriver {
    async fn apply(&self, ctx: &ConnCtx<'_>) -> Result<ConnectionState, DriverError> {
        let TransportConfig::Ipsec(ipsec) = &ctx.conn.config else {
            return Err(DriverError::Fatal("not an IPsec connection".to_string()));
        };

        let link = Self::link_spec(ctx);
        self.dp.link_ensure(&ctx.ni.id, &link).await?;
        self.dp.addr_sync(&ctx.ni.id, &link.name, &ctx.addrs).await?;
        self.dp.link_up(&ctx.ni.id, &link.name).await?;

        // One config file per NI; re-rendering is idempotent and the
        // write-plus-reload is atomic per connection block.
        let rendered = swanctl::render_config(ctx.service, ctx.ni, ctx.info.as_ref());
        self.ike
            .write_config(&ctx.ni.id, rendered)
            .await
            .map_err(fatal_if_rejected)?;

        if ipsec.initiation == Initiation::Start {
            // Initiating an established connection would install a
            // duplicate SA; only kick idle ones.
            let sas = self
                .ike
                .list_sas(Some(&ctx.ike_name()))
                .await
                .map_err(|e| DriverError::Transient(e.to_string()))?;
            if sas.is_empty() {
                self.ike
                    .initiate(&ctx.ike_name())
                    .await
                    .map_err(fatal_if_rejected)?;
            }
        }
        Ok(ConnectionState::Connecting)
    }

    async fn observe(&self, ctx: &ConnCtx<'_>) -> Result<ConnectionState, DriverError> {
        if !self.dp.link_exists(&ctx.ni.id, &ctx.interface_name()).await? {
            return Ok(ConnectionState::Idle);
        }
        let sas = self
            .ike
            .list_sas(Some(&ctx.ike_name()))
            .await
            .map_err(|e| DriverError::Transient(e.to_string()))?;
        if sas.iter().any(|sa| sa.state == "ESTABLISHED") {
            Ok(ConnectionState::Active)
        } else {
            Ok(ConnectionState::Degraded)
        }
    }

    async fn teardown(&self, ctx: &ConnCtx<'_>) -> Result<(), DriverError> {
        info!(ni = %ctx.ni.id, conn = ctx.conn.id, "tearing down IPsec connection");
        let _ = self.ike.terminate_ike(&ctx.ike_name()).await;

        // Re-render the NI config without this connection.
        let mut remaining = ctx.ni.clone();
        remaining.connections.remove(&ctx.conn.id);
        let rendered = swanctl::render_config(ctx.service, &remaining, ctx.info.as_ref());
        self.ike
            .write_config(&ctx.ni.id, rendered)
            .await
            .map_err(|e| DriverError::Transient(e.to_string()))?;

        self.dp.link_delete(&ctx.ni.id, &ctx.interface_name()).await?;
        Ok(())
    }
}

fn fatal_if_rejected(e: crate::ike::IkeError) -> DriverError {
    match e {
        crate::ike::IkeError::Rejected(msg) => DriverError::Fatal(msg),
        other => DriverError::Transient(other.to_string()),
    }
}
