//! Read-only observability endpoint.
//!
//! Serves the per-connection summary, the active NAT translations and
//! the BGP neighbor summary as JSON on a loopback listener. The
//! reconciler and pollers publish into [`StatusRegistry`]; handlers
//! only ever read.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use ipnet::Ipv6Net;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::drivers::ConnectionState;
use crate::frr::NeighborState;
use crate::model::TransportKind;

/// One row of the connection summary.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub tenant: String,
    pub network_instance: String,
    pub connection: u8,
    #[serde(rename = "type")]
    pub kind: TransportKind,
    pub state: ConnectionState,
    pub interface: String,
    pub addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    /// Populated when the connection is stuck CONFIGURED or DEGRADED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Active translations of one network instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NatStatus {
    pub nat64: Vec<Ipv6Net>,
    /// (internal, external) NPTv6 pairs.
    pub nptv6: Vec<(Ipv6Net, Ipv6Net)>,
}

#[derive(Debug, Default)]
pub struct StatusRegistry {
    connections: RwLock<BTreeMap<String, ConnectionStatus>>,
    nat: RwLock<BTreeMap<String, NatStatus>>,
    bgp: RwLock<Vec<NeighborState>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn conn_key(ni: &str, conn: u8) -> String {
        format!("{ni}-{conn}")
    }

    pub async fn publish_connection(&self, status: ConnectionStatus) {
        let key = Self::conn_key(&status.network_instance, status.connection);
        self.connections.write().await.insert(key, status);
    }

    pub async fn forget_connection(&self, ni: &str, conn: u8) {
        self.connections
            .write()
            .await
            .remove(&Self::conn_key(ni, conn));
    }

    pub async fn publish_nat(&self, ni: &str, status: NatStatus) {
        self.nat.write().await.insert(ni.to_string(), status);
    }

    pub async fn forget_ni(&self, ni: &str) {
        self.nat.write().await.remove(ni);
        self.connections
            .write()
            .await
            .retain(|_, c| c.network_instance != ni);
    }

    pub async fn publish_bgp(&self, neighbors: Vec<NeighborState>) {
        *self.bgp.write().await = neighbors;
    }

    pub async fn connections(&self) -> Vec<ConnectionStatus> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn connection_state(&self, ni: &str, conn: u8) -> Option<ConnectionState> {
        self.connections
            .read()
            .await
            .get(&Self::conn_key(ni, conn))
            .map(|c| c.state)
    }

    pub async fn nat(&self) -> BTreeMap<String, NatStatus> {
        self.nat.read().await.clone()
    }

    pub async fn bgp(&self) -> Vec<NeighborState> {
        self.bgp.read().await.clone()
    }
}

async fn get_connections(
    State(registry): State<Arc<StatusRegistry>>,
) -> Json<Vec<ConnectionStatus>> {
    Json(registry.connections().await)
}

async fn get_nat(State(registry): State<Arc<StatusRegistry>>) -> Json<BTreeMap<String, NatStatus>> {
    Json(registry.nat().await)
}

async fn get_bgp(State(registry): State<Arc<StatusRegistry>>) -> Json<Vec<NeighborState>> {
    Json(registry.bgp().await)
}

pub fn router(registry: Arc<StatusRegistry>) -> Router {
    Router::new()
        .route("/v1/connections", get(get_connections))
        .route("/v1/nat", get(get_nat))
        .route("/v1/bgp", get(get_bgp))
        .with_state(registry)
}

/// Serve the status endpoint until the process exits.
pub async fn serve(registry: Arc<StatusRegistry>, listen: &str) -> crate::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listen, "status endpoint listening");
    axum::serve(listener, router(registry))
        .await
        .map_err(|e| crate::error::Error::Io(std::io::Error::other(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_tracks_connections_per_ni() {
        let registry = StatusRegistry::new();
        registry
            .publish_connection(ConnectionStatus {
                tenant: "C0001".to_string(),
                network_instance: "C0001-00".to_string(),
                connection: 0,
                kind: TransportKind::Ipsec,
                state: ConnectionState::Active,
                interface: "xfrm0".to_string(),
                addresses: vec!["100.99.0.1/28".to_string()],
                remote: Some("203.0.113.10".to_string()),
                reason: None,
            })
            .await;

        assert_eq!(
            registry.connection_state("C0001-00", 0).await,
            Some(ConnectionState::Active)
        );

        registry.forget_ni("C0001-00").await;
        assert!(registry.connections().await.is_empty());
    }
}
