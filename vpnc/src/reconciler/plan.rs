//! Desired-state computation for one network instance.
//!
//! Pure functions from the validated snapshot to the set of kernel
//! objects the instance must own. The apply engine in the parent
//! module diffs this against observed state.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv6Net};
use tracing::warn;

use crate::alloc;
use crate::config::CORE_NI;
use crate::dataplane::RouteSpec;
use crate::error::Result;
use crate::model::{
    Connection, DownlinkInfo, NetworkInstance, NiType, Service, ServiceMode, TransportKind,
};

/// Desired state of one connection.
#[derive(Debug, Clone)]
pub struct ConnPlan {
    pub conn_id: u8,
    pub kind: TransportKind,
    /// Resolved interface addresses (explicit or allocator-assigned).
    pub addrs: Vec<IpNet>,
    /// Routes inside the instance, shadowed duplicates already removed.
    pub routes: Vec<RouteSpec>,
    /// Prefixes advertised into CORE while this connection is ACTIVE
    /// and blackholed while it is not.
    pub core_adverts: Vec<IpNet>,
}

/// Veth wiring between a downlink/endpoint instance and CORE.
#[derive(Debug, Clone)]
pub struct VethPlan {
    pub core_name: String,
    pub inner_name: String,
    /// Link-local pair; the inner side also carries a v4 pair in
    /// endpoint mode.
    pub endpoint_mode: bool,
    /// Management routes installed inside the instance via the veth.
    pub uplink_routes: Vec<RouteSpec>,
}

/// Full desired state of one network instance.
#[derive(Debug, Clone)]
pub struct NiPlan {
    pub ns: String,
    pub ni_type: NiType,
    pub forwarding: bool,
    pub veth: Option<VethPlan>,
    pub connections: Vec<ConnPlan>,
    /// NAT64 pool bound to the instance (hub downlinks only).
    pub nat64: Option<Ipv6Net>,
    /// NPTv6 mappings (internal, external).
    pub nptv6: Vec<(Ipv6Net, Ipv6Net)>,
    /// Routes suppressed by the lowest-connection-id tie-break.
    pub shadowed: Vec<(u8, IpNet)>,
}

impl NiPlan {
    /// NAT64 prefixes to advertise upstream.
    pub fn nat64_prefixes(&self) -> Vec<Ipv6Net> {
        self.nat64.into_iter().collect()
    }

    /// External NPTv6 prefixes to advertise upstream.
    pub fn nptv6_prefixes(&self) -> Vec<Ipv6Net> {
        self.nptv6.iter().map(|(_, external)| *external).collect()
    }
}

/// Compute the desired state of one instance.
pub fn compute(service: &Service, ni: &NetworkInstance) -> Result<NiPlan> {
    let is_hub = service.mode == ServiceMode::Hub;
    let info = match ni.ni_type {
        NiType::Downlink => Some(DownlinkInfo::parse(&ni.id)?),
        _ => None,
    };

    let veth = ni.ni_type.linked_to_core().then(|| VethPlan {
        core_name: ni.veth_core_name(),
        inner_name: ni.veth_inner_name(),
        endpoint_mode: service.mode == ServiceMode::Endpoint,
        uplink_routes: uplink_routes(service, &ni.veth_inner_name()),
    });

    // NPTv6 assignment is NI-wide so carve-outs cannot collide. An
    // instance without connections owns no translations either.
    let (nat64, nptv6) = if is_hub && ni.ni_type == NiType::Downlink && !ni.connections.is_empty()
    {
        let info = info.as_ref().expect("downlink info parsed above");
        let lowest_conn = *ni.connections.keys().next().expect("connections nonempty");
        let scope = alloc::nptv6_scope(service, info)?;
        let route_lists: Vec<(u8, &[crate::model::RouteV6])> = ni
            .connections
            .values()
            .map(|c| (c.id, c.routes.ipv6.as_slice()))
            .collect();
        let assigned = alloc::assign_nptv6(scope, &route_lists)?;
        (
            Some(alloc::nat64_pool(service, info, lowest_conn)?),
            assigned
                .iter()
                .map(|a| (a.internal, a.external))
                .collect::<Vec<_>>(),
        )
    } else {
        (None, Vec::new())
    };

    let mut connections = Vec::new();
    let mut shadowed: Vec<(u8, IpNet)> = Vec::new();
    let mut seen_routes: Vec<(u8, IpNet)> = Vec::new();

    for conn in ni.connections.values() {
        let addrs = resolve_addrs(service, ni, info.as_ref(), conn)?;
        let ifname = crate::drivers::interface_name(ni, conn);

        let mut routes = Vec::new();
        let mut core_adverts = Vec::new();

        for route in &conn.routes.ipv4 {
            let dst = IpNet::V4(route.to);
            if let Some((owner, _)) = seen_routes.iter().find(|(_, d)| *d == dst) {
                warn!(
                    ni = %ni.id,
                    conn = conn.id,
                    winner = owner,
                    route = %dst,
                    "RouteShadowed: suppressed by lower connection id"
                );
                shadowed.push((conn.id, dst));
                continue;
            }
            seen_routes.push((conn.id, dst));
            routes.push(RouteSpec::unicast(
                dst,
                route.via.map(IpAddr::V4),
                Some(ifname.clone()),
            ));
        }
        for route in &conn.routes.ipv6 {
            let dst = IpNet::V6(route.to);
            if let Some((owner, _)) = seen_routes.iter().find(|(_, d)| *d == dst) {
                warn!(
                    ni = %ni.id,
                    conn = conn.id,
                    winner = owner,
                    route = %dst,
                    "RouteShadowed: suppressed by lower connection id"
                );
                shadowed.push((conn.id, dst));
                continue;
            }
            seen_routes.push((conn.id, dst));
            routes.push(RouteSpec::unicast(
                dst,
                route.via.map(IpAddr::V6),
                Some(ifname.clone()),
            ));

            if ni.ni_type.linked_to_core() {
                // Advertise the translated prefix when NPTv6 applies,
                // the native prefix otherwise.
                let advert = if is_hub && route.nptv6 {
                    nptv6
                        .iter()
                        .find(|(internal, _)| *internal == route.to)
                        .map(|(_, external)| IpNet::V6(*external))
                } else {
                    Some(dst)
                };
                if let Some(advert) = advert {
                    core_adverts.push(advert);
                }
            }
        }

        connections.push(ConnPlan {
            conn_id: conn.id,
            kind: conn.config.kind(),
            addrs,
            routes,
            core_adverts,
        });
    }

    // The NAT64 /96 follows the lowest connection's liveness.
    if let (Some(pool), Some(first)) = (nat64, connections.first_mut()) {
        first.core_adverts.push(IpNet::V6(pool));
    }

    Ok(NiPlan {
        ns: ni.id.clone(),
        ni_type: ni.ni_type,
        forwarding: ni.ni_type.forwards(),
        veth,
        connections,
        nat64,
        nptv6,
        shadowed,
    })
}

/// Resolve interface addresses: explicit config wins, hub downlinks
/// fall back to the allocator pools.
fn resolve_addrs(
    service: &Service,
    ni: &NetworkInstance,
    info: Option<&DownlinkInfo>,
    conn: &Connection,
) -> Result<Vec<IpNet>> {
    let mut addrs: Vec<IpNet> = Vec::new();
    let auto = service.mode == ServiceMode::Hub && ni.ni_type == NiType::Downlink;

    if conn.interface.ipv4.is_empty() && auto {
        let info = info.expect("downlink info present for downlink NIs");
        addrs.push(IpNet::V4(alloc::interface_v4(service, info, conn.id)?));
    } else {
        addrs.extend(conn.interface.ipv4.iter().copied().map(IpNet::V4));
    }

    if conn.interface.ipv6.is_empty() && auto {
        let info = info.expect("downlink info present for downlink NIs");
        addrs.push(IpNet::V6(alloc::interface_v6(service, info, conn.id)?));
    } else {
        addrs.extend(conn.interface.ipv6.iter().copied().map(IpNet::V6));
    }

    Ok(addrs)
}

/// Routes from a linked instance toward the management side, via the
/// veth pair into CORE.
fn uplink_routes(service: &Service, inner_veth: &str) -> Vec<RouteSpec> {
    let mut routes = Vec::new();
    let Some(core) = service.network_instances.get(CORE_NI) else {
        return routes;
    };
    for conn in core.connections.values() {
        for route in &conn.routes.ipv6 {
            routes.push(RouteSpec::unicast(
                IpNet::V6(route.to),
                Some("fe80::".parse().expect("static address")),
                Some(inner_veth.to_string()),
            ));
        }
        if service.mode == ServiceMode::Endpoint {
            for route in &conn.routes.ipv4 {
                routes.push(RouteSpec::unicast(
                    IpNet::V4(route.to),
                    Some("169.254.0.1".parse().expect("static address")),
                    Some(inner_veth.to_string()),
                ));
            }
        }
    }
    routes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{hub_service, ipsec_connection, tenant_with, wireguard_connection};

    #[test]
    fn downlink_plan_carries_nat64_and_interface_pools() {
        let service = hub_service();
        let tenant = tenant_with(0, vec![ipsec_connection(0)]);
        let ni = &tenant.network_instances["C0001-00"];
        let plan = compute(&service, ni).unwrap();

        assert_eq!(plan.nat64.unwrap().to_string(), "fdcc:0:c:1::/96");
        assert_eq!(plan.connections.len(), 1);
        let conn = &plan.connections[0];
        assert!(conn
            .addrs
            .iter()
            .any(|a| a.to_string() == "100.99.0.1/28"));
        assert!(conn.addrs.iter().any(|a| a.to_string() == "fdcc:cbe::/64"));

        // NPTv6 route advertises its translated prefix; NAT64 rides on
        // the lowest connection.
        assert!(conn
            .core_adverts
            .iter()
            .any(|a| a.to_string() == "fdcc:1::/48"));
        assert!(conn
            .core_adverts
            .iter()
            .any(|a| a.to_string() == "fdcc:0:c:1::/96"));
    }

    #[test]
    fn native_routes_advertise_themselves() {
        let service = hub_service();
        let tenant = tenant_with(1, vec![wireguard_connection(0)]);
        let ni = &tenant.network_instances["C0001-01"];
        let plan = compute(&service, ni).unwrap();
        let conn = &plan.connections[0];
        assert!(conn
            .core_adverts
            .iter()
            .any(|a| a.to_string() == "2001:db8:c58::/48"));
        // The /52 is NPTv6-flagged: translated into the NI scope.
        assert!(conn
            .core_adverts
            .iter()
            .any(|a| a.to_string() == "fdcc:1:1::/52"));
    }

    #[test]
    fn overlapping_routes_shadow_by_lowest_connection_id() {
        let service = hub_service();
        let mut first = ipsec_connection(0);
        first.routes.ipv4.push(crate::model::RouteV4 {
            to: "10.8.0.0/24".parse().unwrap(),
            via: None,
        });
        let mut second = wireguard_connection(1);
        second.routes.ipv4.push(crate::model::RouteV4 {
            to: "10.8.0.0/24".parse().unwrap(),
            via: None,
        });
        let tenant = tenant_with(0, vec![first, second]);
        let ni = &tenant.network_instances["C0001-00"];
        let plan = compute(&service, ni).unwrap();

        assert_eq!(plan.shadowed.len(), 1);
        assert_eq!(plan.shadowed[0].0, 1);
        // The winner keeps the route.
        assert!(plan.connections[0]
            .routes
            .iter()
            .any(|r| r.dst.to_string() == "10.8.0.0/24"));
        assert!(!plan.connections[1]
            .routes
            .iter()
            .any(|r| r.dst.to_string() == "10.8.0.0/24"));
    }

    #[test]
    fn core_plan_has_no_translations() {
        let service = hub_service();
        let ni = &service.network_instances["CORE"];
        let plan = compute(&service, ni).unwrap();
        assert!(plan.nat64.is_none());
        assert!(plan.nptv6.is_empty());
        assert!(plan.veth.is_none());
        assert!(plan.forwarding);
    }

    #[test]
    fn downlink_gets_uplink_routes_via_veth() {
        let service = hub_service();
        let tenant = tenant_with(0, vec![ipsec_connection(0)]);
        let ni = &tenant.network_instances["C0001-00"];
        let plan = compute(&service, ni).unwrap();
        let veth = plan.veth.unwrap();
        assert_eq!(veth.core_name, "C0001-00_C");
        assert_eq!(veth.inner_name, "C0001-00_D");
        assert!(veth
            .uplink_routes
            .iter()
            .any(|r| r.dst.to_string() == "fd00::/16"));
    }
}
