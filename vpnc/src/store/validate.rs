//! Semantic validation of a combined configuration snapshot.
//!
//! Schema errors are caught by serde at parse time; everything here is
//! cross-field or cross-file: id shapes, mode/role compatibility, the
//! default network instances, prefix sizes, and per-connection rules.

use crate::config::{CORE_NI, ENDPOINT_NI, EXTERNAL_NI};
use crate::error::{Error, Result};
use crate::model::info::validate_ni_name;
use crate::model::tenant::ASN_RANGE;
use crate::model::{
    NetworkInstance, NiType, ServiceMode, Tenant, TenantId, TransportConfig,
};

use super::Snapshot;

pub fn validate(snapshot: &Snapshot) -> Result<()> {
    validate_service(snapshot)?;
    for tenant in snapshot.tenants.values() {
        validate_tenant(snapshot, tenant)?;
    }
    Ok(())
}

fn validate_service(snapshot: &Snapshot) -> Result<()> {
    let service = &snapshot.service;
    if service.id != "DEFAULT" || service.name != "DEFAULT" {
        return Err(Error::invalid(
            "DEFAULT.id",
            "the default tenant id and name must be DEFAULT",
        ));
    }

    let mut externals = 0;
    let mut cores = 0;
    let mut endpoints = 0;
    for (key, ni) in &service.network_instances {
        if key != &ni.id {
            return Err(Error::invalid(
                format!("DEFAULT.network_instances.{key}"),
                "key must equal the network instance id",
            ));
        }
        match ni.ni_type {
            NiType::External => {
                externals += 1;
                expect_name(ni, EXTERNAL_NI)?;
            }
            NiType::Core => {
                cores += 1;
                expect_name(ni, CORE_NI)?;
            }
            NiType::Endpoint => {
                endpoints += 1;
                expect_name(ni, ENDPOINT_NI)?;
                if service.mode != ServiceMode::Endpoint {
                    return Err(Error::invalid(
                        format!("DEFAULT.network_instances.{key}.type"),
                        "endpoint instances exist only in endpoint mode",
                    ));
                }
            }
            NiType::Downlink => {
                return Err(Error::invalid(
                    format!("DEFAULT.network_instances.{key}.type"),
                    "the default tenant cannot own downlink instances",
                ));
            }
        }
        validate_connections(&format!("DEFAULT.network_instances.{key}"), ni)?;
    }
    if externals != 1 {
        return Err(Error::invalid(
            "DEFAULT.network_instances",
            "exactly one EXTERNAL instance is required",
        ));
    }
    if cores != 1 {
        return Err(Error::invalid(
            "DEFAULT.network_instances",
            "exactly one CORE instance is required",
        ));
    }
    if service.mode == ServiceMode::Endpoint && endpoints != 1 {
        return Err(Error::invalid(
            "DEFAULT.network_instances",
            "endpoint mode requires exactly one ENDPOINT instance",
        ));
    }
    if service.mode == ServiceMode::Hub && endpoints != 0 {
        return Err(Error::invalid(
            "DEFAULT.network_instances",
            "hub mode does not allow an ENDPOINT instance",
        ));
    }

    match service.mode {
        ServiceMode::Hub => {
            check_prefix_len(
                "DEFAULT.prefix_downlink_interface_v4",
                service.prefix_downlink_interface_v4.map(|p| p.prefix_len()),
                16,
            )?;
            check_prefix_len(
                "DEFAULT.prefix_downlink_interface_v6",
                service.prefix_downlink_interface_v6.map(|p| p.prefix_len()),
                32,
            )?;
            check_prefix_len(
                "DEFAULT.prefix_downlink_nat64",
                service.prefix_downlink_nat64.map(|p| p.prefix_len()),
                32,
            )?;
            check_prefix_len(
                "DEFAULT.prefix_downlink_nptv6",
                service.prefix_downlink_nptv6.map(|p| p.prefix_len()),
                12,
            )?;
            let bgp = service
                .bgp
                .as_ref()
                .ok_or_else(|| Error::invalid("DEFAULT.bgp", "hub mode requires BGP settings"))?;
            if !ASN_RANGE.contains(&bgp.globals.asn) {
                return Err(Error::invalid(
                    "DEFAULT.bgp.globals.asn",
                    "ASN must be in the 32-bit private range",
                ));
            }
            for (i, neighbor) in bgp.neighbors.iter().enumerate() {
                if neighbor.priority > 9 {
                    return Err(Error::invalid(
                        format!("DEFAULT.bgp.neighbors.{i}.priority"),
                        "priority must be 0..=9",
                    ));
                }
            }
        }
        ServiceMode::Endpoint => {
            for (path, present) in [
                (
                    "prefix_downlink_interface_v4",
                    service.prefix_downlink_interface_v4.is_some(),
                ),
                (
                    "prefix_downlink_interface_v6",
                    service.prefix_downlink_interface_v6.is_some(),
                ),
                ("prefix_downlink_nat64", service.prefix_downlink_nat64.is_some()),
                ("prefix_downlink_nptv6", service.prefix_downlink_nptv6.is_some()),
                ("bgp", service.bgp.is_some()),
            ] {
                if present {
                    return Err(Error::invalid(
                        format!("DEFAULT.{path}"),
                        "must be unset in endpoint mode",
                    ));
                }
            }
        }
    }

    Ok(())
}

fn check_prefix_len(path: &str, actual: Option<u8>, expected: u8) -> Result<()> {
    match actual {
        Some(len) if len == expected => Ok(()),
        Some(len) => Err(Error::invalid(path, format!("must be a /{expected} (got /{len})"))),
        None => Err(Error::invalid(path, "must be configured in hub mode")),
    }
}

fn expect_name(ni: &NetworkInstance, expected: &str) -> Result<()> {
    if ni.id != expected {
        return Err(Error::invalid(
            format!("DEFAULT.network_instances.{}", ni.id),
            format!("a {:?} instance must be named {expected}", ni.ni_type),
        ));
    }
    Ok(())
}

fn validate_tenant(snapshot: &Snapshot, tenant: &Tenant) -> Result<()> {
    let tenant_id: TenantId = tenant.id.parse()?;
    let letter = match tenant_id {
        TenantId::Default => {
            return Err(Error::invalid(&tenant.id, "DEFAULT must live in DEFAULT.yaml"))
        }
        TenantId::Named { letter, .. } => letter,
    };

    match snapshot.service.mode {
        ServiceMode::Hub if !letter.is_downlink() => {
            return Err(Error::invalid(
                &tenant.id,
                "endpoint (E) tenants are not allowed in hub mode",
            ));
        }
        ServiceMode::Endpoint if letter.is_downlink() => {
            return Err(Error::invalid(
                &tenant.id,
                "downlink (C/D) tenants are not allowed in endpoint mode",
            ));
        }
        _ => {}
    }

    for (key, ni) in &tenant.network_instances {
        let path = format!("{}.network_instances.{key}", tenant.id);
        if key != &ni.id {
            return Err(Error::invalid(path, "key must equal the network instance id"));
        }
        if ni.ni_type != NiType::Downlink {
            return Err(Error::invalid(
                format!("{path}.type"),
                "tenant instances must be of type downlink",
            ));
        }
        if snapshot.service.mode != ServiceMode::Hub {
            return Err(Error::invalid(
                format!("{path}.type"),
                "downlink instances exist only in hub mode",
            ));
        }
        validate_ni_name(&tenant.id, &ni.id)?;
        validate_connections(&path, ni)?;
    }
    Ok(())
}

fn validate_connections(path: &str, ni: &NetworkInstance) -> Result<()> {
    for (key, conn) in &ni.connections {
        let conn_path = format!("{path}.connections.{key}");
        if *key != conn.id {
            return Err(Error::invalid(conn_path, "key must equal the connection id"));
        }
        match &conn.config {
            TransportConfig::Wireguard(wg) if wg.remote_addrs.is_empty() => {
                return Err(Error::invalid(
                    format!("{conn_path}.config.remote_addrs"),
                    "at least one remote address is required",
                ));
            }
            TransportConfig::Ssh(ssh) if ssh.remote_addrs.is_empty() => {
                return Err(Error::invalid(
                    format!("{conn_path}.config.remote_addrs"),
                    "at least one remote address is required",
                ));
            }
            _ => {}
        }
        if let TransportConfig::Ipsec(ipsec) = &conn.config {
            if !matches!(ipsec.ike_version, 1 | 2) {
                return Err(Error::invalid(
                    format!("{conn_path}.config.ike_version"),
                    "IKE version must be 1 or 2",
                ));
            }
            if ipsec.remote_addrs.is_empty() {
                return Err(Error::invalid(
                    format!("{conn_path}.config.remote_addrs"),
                    "at least one remote address is required",
                ));
            }
            if conn.id > 0xf {
                return Err(Error::invalid(
                    format!("{conn_path}.id"),
                    "IPsec connection ids must fit the XFRM if_id nibble (0..=15)",
                ));
            }
            let has_routes = !conn.routes.ipv4.is_empty() || !conn.routes.ipv6.is_empty();
            if has_routes && !ipsec.traffic_selectors.is_empty() {
                return Err(Error::invalid(
                    format!("{conn_path}.config.traffic_selectors"),
                    "routes and traffic selectors are mutually exclusive",
                ));
            }
        }
        for (i, route) in conn.routes.ipv6.iter().enumerate() {
            if let Some(prefix) = route.nptv6_prefix {
                if prefix.prefix_len() != route.to.prefix_len() {
                    return Err(Error::invalid(
                        format!("{conn_path}.routes.ipv6.{i}.nptv6_prefix"),
                        "NPTv6 prefix length must equal the route prefix length",
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{hub_snapshot, ipsec_connection};

    #[test]
    fn accepts_the_hub_fixture() {
        let snapshot = hub_snapshot();
        validate(&snapshot).unwrap();
    }

    #[test]
    fn rejects_routes_with_traffic_selectors() {
        let mut snapshot = hub_snapshot();
        let tenant = snapshot.tenants.get_mut("C0001").unwrap();
        let ni = tenant.network_instances.get_mut("C0001-00").unwrap();
        let conn = ni.connections.get_mut(&0).unwrap();
        if let TransportConfig::Ipsec(ipsec) = &mut conn.config {
            ipsec.traffic_selectors.local.push("10.0.0.0/24".parse().unwrap());
        }
        let err = validate(&snapshot).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"), "{err}");
    }

    #[test]
    fn rejects_downlink_tenants_in_endpoint_mode() {
        let mut snapshot = hub_snapshot();
        snapshot.service.mode = ServiceMode::Endpoint;
        snapshot.service.prefix_downlink_interface_v4 = None;
        snapshot.service.prefix_downlink_interface_v6 = None;
        snapshot.service.prefix_downlink_nat64 = None;
        snapshot.service.prefix_downlink_nptv6 = None;
        snapshot.service.bgp = None;
        // Endpoint mode also requires an ENDPOINT instance; the downlink
        // tenant must be rejected first.
        let err = validate(&snapshot).unwrap_err();
        assert!(err.to_string().contains("ENDPOINT") || err.to_string().contains("not allowed"));
    }

    #[test]
    fn rejects_large_ipsec_connection_ids() {
        let mut snapshot = hub_snapshot();
        let tenant = snapshot.tenants.get_mut("C0001").unwrap();
        let ni = tenant.network_instances.get_mut("C0001-00").unwrap();
        let mut conn = ipsec_connection(0);
        conn.id = 16;
        ni.connections.insert(16, conn);
        let err = validate(&snapshot).unwrap_err();
        assert!(err.to_string().contains("if_id"), "{err}");
    }
}
