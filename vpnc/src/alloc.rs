//! Deterministic prefix allocation.
//!
//! Pure functions from `(tenant, network instance, connection, service
//! prefixes)` to interface pools, NAT64 /96s and NPTv6 scopes. Nothing
//! in here mutates state; conflicting configuration surfaces as errors
//! at plan time.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

use crate::error::{Error, Result};
use crate::model::{DownlinkInfo, RouteV6, Service};

/// NAT64 pool for one connection: a /96 that maps the full IPv4 space.
///
/// The offset embeds the tenant letter nibble, the tenant number, the
/// NI index and the connection id into consecutive 16-bit groups:
/// `fdcc:0::/32` + `C0001-00` conn 0 -> `fdcc:0:c:1::/96`.
pub fn nat64_pool(service: &Service, info: &DownlinkInfo, conn_id: u8) -> Result<Ipv6Net> {
    let base = service
        .prefix_downlink_nat64
        .ok_or_else(|| Error::invalid("prefix_downlink_nat64", "not configured"))?;
    let offset: u128 = (u128::from(info.letter.nibble()) << 80)
        | (u128::from(info.tenant_num) << 64)
        | (u128::from(info.ni_index) << 48)
        | (u128::from(conn_id) << 32);
    let addr = Ipv6Addr::from(u128::from(base.network()) | offset);
    Ok(Ipv6Net::new(addr, 96)
        .map_err(|e| Error::AllocatorExhausted(e.to_string()))?
        .trunc())
}

/// NPTv6 scope for one network instance: a /48 inside the service /12.
pub fn nptv6_scope(service: &Service, info: &DownlinkInfo) -> Result<Ipv6Net> {
    let base = service
        .prefix_downlink_nptv6
        .ok_or_else(|| Error::invalid("prefix_downlink_nptv6", "not configured"))?;
    let offset: u128 = (u128::from(info.letter.nibble()) << 112)
        | (u128::from(info.tenant_num) << 96)
        | (u128::from(info.ni_index) << 80);
    let addr = Ipv6Addr::from(u128::from(base.network()) | offset);
    Ok(Ipv6Net::new(addr, 48)
        .map_err(|e| Error::AllocatorExhausted(e.to_string()))?
        .trunc())
}

/// IPv4 interface address for a connection: the `.1` of the /28 carved
/// out of the per-NI /24.
pub fn interface_v4(service: &Service, info: &DownlinkInfo, conn_id: u8) -> Result<Ipv4Net> {
    let pool = service
        .prefix_downlink_interface_v4
        .ok_or_else(|| Error::invalid("prefix_downlink_interface_v4", "not configured"))?;
    if conn_id >= 16 {
        return Err(Error::AllocatorExhausted(format!(
            "connection {conn_id} exceeds the /28 pool of a /24"
        )));
    }
    let base = u32::from(pool.network());
    let addr = base | (u32::from(info.ni_index) << 8) | (u32::from(conn_id) << 4) | 1;
    Ipv4Net::new(Ipv4Addr::from(addr), 28).map_err(|e| Error::AllocatorExhausted(e.to_string()))
}

/// IPv6 interface address for a connection: the network address of the
/// /64 carved out of the per-NI /48.
pub fn interface_v6(service: &Service, info: &DownlinkInfo, conn_id: u8) -> Result<Ipv6Net> {
    let pool = service
        .prefix_downlink_interface_v6
        .ok_or_else(|| Error::invalid("prefix_downlink_interface_v6", "not configured"))?;
    let base = u128::from(pool.network());
    let addr = base | (u128::from(info.ni_index) << 80) | (u128::from(conn_id) << 64);
    Ipv6Net::new(Ipv6Addr::from(addr), 64).map_err(|e| Error::AllocatorExhausted(e.to_string()))
}

/// XFRM interface id for an IPsec connection.
///
/// Packs the hex spelling of the NI name plus the connection digit:
/// `C0001-00` connection 0 -> `0xC0001000`. Non-downlink instances use
/// `0x1000000 | connection`.
pub fn xfrm_if_id(info: Option<&DownlinkInfo>, conn_id: u8) -> u32 {
    match info {
        Some(i) => {
            (u32::from(i.letter.nibble()) << 28)
                | (u32::from(i.tenant_num) << 12)
                | (u32::from(i.ni_index) << 4)
                | u32::from(conn_id & 0xf)
        }
        None => 0x1000000 | u32::from(conn_id),
    }
}

/// One NPTv6 assignment: the internal (tenant) route and the external
/// prefix it is translated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nptv6Assignment {
    /// Connection id the route belongs to.
    pub conn_id: u8,
    /// Index of the route within the connection's IPv6 route list.
    pub route_index: usize,
    /// The route's own prefix.
    pub internal: Ipv6Net,
    /// Translated prefix inside the NI scope.
    pub external: Ipv6Net,
}

/// Assign NPTv6 prefixes for all flagged routes of a network instance.
///
/// Routes are visited in (connection id, route index) order. Explicit
/// prefixes are honored when they have the route's own length and fall
/// inside the scope; everything else gets the first free carve-out at
/// the route's length. Pure and deterministic.
pub fn assign_nptv6(
    scope: Ipv6Net,
    routes: &[(u8, &[RouteV6])],
) -> Result<Vec<Nptv6Assignment>> {
    let mut taken: Vec<Ipv6Net> = Vec::new();
    let mut out = Vec::new();

    // Explicit prefixes reserve their slot before any automatic carve.
    for (conn_id, conn_routes) in routes {
        for (idx, route) in conn_routes.iter().enumerate() {
            if !route.nptv6 {
                continue;
            }
            if let Some(explicit) = route.nptv6_prefix {
                if explicit.prefix_len() == route.to.prefix_len() && scope.contains(&explicit) {
                    taken.push(explicit);
                    out.push(Nptv6Assignment {
                        conn_id: *conn_id,
                        route_index: idx,
                        internal: route.to,
                        external: explicit,
                    });
                }
            }
        }
    }

    for (conn_id, conn_routes) in routes {
        for (idx, route) in conn_routes.iter().enumerate() {
            if !route.nptv6 {
                continue;
            }
            if out
                .iter()
                .any(|a| a.conn_id == *conn_id && a.route_index == idx)
            {
                continue;
            }
            let plen = route.to.prefix_len();
            if plen < scope.prefix_len() {
                return Err(Error::AllocatorExhausted(format!(
                    "route {} is wider than the NPTv6 scope {scope}",
                    route.to
                )));
            }
            let external = first_free(scope, plen, &taken)?;
            taken.push(external);
            out.push(Nptv6Assignment {
                conn_id: *conn_id,
                route_index: idx,
                internal: route.to,
                external,
            });
        }
    }

    out.sort_by_key(|a| (a.conn_id, a.route_index));
    Ok(out)
}

/// Scan limit for the first-fit carve. A /48 scope holds far more
/// subnets than any tenant configures routes.
const CARVE_SCAN_LIMIT: u128 = 65_536;

fn first_free(scope: Ipv6Net, plen: u8, taken: &[Ipv6Net]) -> Result<Ipv6Net> {
    let step = 1u128 << (128 - plen);
    let base = u128::from(scope.network());
    let count = 1u128 << (plen - scope.prefix_len());
    for k in 0..count.min(CARVE_SCAN_LIMIT) {
        let candidate = Ipv6Net::new(Ipv6Addr::from(base + k * step), plen)
            .map_err(|e| Error::AllocatorExhausted(e.to_string()))?;
        let overlaps = taken.iter().any(|t| {
            t.contains(&candidate.network()) || candidate.contains(&t.network())
        });
        if !overlaps {
            return Ok(candidate);
        }
    }
    Err(Error::AllocatorExhausted(format!(
        "no free /{plen} left in NPTv6 scope {scope}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ServiceMode, TenantLetter};
    use std::collections::BTreeMap;

    fn hub_service() -> Service {
        Service {
            version: "0.1.9".into(),
            id: "DEFAULT".into(),
            name: "DEFAULT".into(),
            metadata: BTreeMap::new(),
            mode: ServiceMode::Hub,
            local_id: "%any".into(),
            prefix_downlink_interface_v4: Some("100.99.0.0/16".parse().unwrap()),
            prefix_downlink_interface_v6: Some("fdcc:cbe::/32".parse().unwrap()),
            prefix_downlink_nat64: Some("fdcc:0::/32".parse().unwrap()),
            prefix_downlink_nptv6: Some("fdc0::/12".parse().unwrap()),
            bgp: None,
            network_instances: BTreeMap::new(),
        }
    }

    fn info(letter: TenantLetter, tenant_num: u16, ni_index: u8) -> DownlinkInfo {
        DownlinkInfo {
            letter,
            tenant_num,
            ni_index,
            connection: None,
        }
    }

    #[test]
    fn nat64_pool_embeds_identity() {
        let service = hub_service();
        let pool = nat64_pool(&service, &info(TenantLetter::C, 1, 0), 0).unwrap();
        assert_eq!(pool.to_string(), "fdcc:0:c:1::/96");

        let pool = nat64_pool(&service, &info(TenantLetter::D, 0x10, 2), 3).unwrap();
        assert_eq!(pool.to_string(), "fdcc:0:d:10:2:3::/96");
    }

    #[test]
    fn nat64_pools_are_disjoint_per_connection() {
        let service = hub_service();
        let a = nat64_pool(&service, &info(TenantLetter::C, 1, 0), 0).unwrap();
        let b = nat64_pool(&service, &info(TenantLetter::C, 1, 0), 1).unwrap();
        let c = nat64_pool(&service, &info(TenantLetter::C, 2, 0), 0).unwrap();
        assert!(!a.contains(&b.network()));
        assert!(!a.contains(&c.network()));
        assert!(!b.contains(&c.network()));
    }

    #[test]
    fn nptv6_scope_is_a_48() {
        let service = hub_service();
        let scope = nptv6_scope(&service, &info(TenantLetter::C, 1, 0)).unwrap();
        assert_eq!(scope.prefix_len(), 48);
        assert_eq!(scope.to_string(), "fdcc:1::/48");
    }

    #[test]
    fn interface_pools_per_connection() {
        let service = hub_service();
        let v4 = interface_v4(&service, &info(TenantLetter::C, 1, 1), 0).unwrap();
        assert_eq!(v4.to_string(), "100.99.1.1/28");
        let v4 = interface_v4(&service, &info(TenantLetter::C, 1, 1), 2).unwrap();
        assert_eq!(v4.to_string(), "100.99.1.33/28");

        let v6 = interface_v6(&service, &info(TenantLetter::C, 1, 1), 2).unwrap();
        assert_eq!(v6.to_string(), "fdcc:cbe:1:2::/64");
        assert!(interface_v4(&service, &info(TenantLetter::C, 1, 1), 16).is_err());
    }

    #[test]
    fn if_id_matches_hex_spelling() {
        let i = info(TenantLetter::C, 1, 0);
        assert_eq!(xfrm_if_id(Some(&i), 0), 0xC000_1000);
        assert_eq!(xfrm_if_id(Some(&i), 5), 0xC000_1005);
        assert_eq!(xfrm_if_id(None, 3), 0x0100_0003);
    }

    #[test]
    fn nptv6_first_fit_assignment() {
        let scope: Ipv6Net = "fdcc:1::/48".parse().unwrap();
        let routes0 = vec![
            RouteV6 {
                to: "2001:db8:1::/52".parse().unwrap(),
                via: None,
                nptv6: true,
                nptv6_prefix: None,
            },
            RouteV6 {
                to: "2001:db8:2::/52".parse().unwrap(),
                via: None,
                nptv6: true,
                nptv6_prefix: None,
            },
        ];
        let assigned = assign_nptv6(scope, &[(0, &routes0)]).unwrap();
        assert_eq!(assigned.len(), 2);
        assert_eq!(assigned[0].external.to_string(), "fdcc:1::/52");
        assert_eq!(assigned[1].external.to_string(), "fdcc:1:0:1000::/52");
    }

    #[test]
    fn nptv6_honors_valid_explicit_prefix() {
        let scope: Ipv6Net = "fdcc:1::/48".parse().unwrap();
        let routes = vec![RouteV6 {
            to: "2001:db8::/52".parse().unwrap(),
            via: None,
            nptv6: true,
            nptv6_prefix: Some("fdcc:1:0:2000::/52".parse().unwrap()),
        }];
        let assigned = assign_nptv6(scope, &[(0, &routes)]).unwrap();
        assert_eq!(assigned[0].external.to_string(), "fdcc:1:0:2000::/52");
    }

    #[test]
    fn nptv6_rejects_routes_wider_than_scope() {
        let scope: Ipv6Net = "fdcc:1::/48".parse().unwrap();
        let routes = vec![RouteV6 {
            to: "2001:db8::/40".parse().unwrap(),
            via: None,
            nptv6: true,
            nptv6_prefix: None,
        }];
        assert!(assign_nptv6(scope, &[(0, &routes)]).is_err());
    }
}
