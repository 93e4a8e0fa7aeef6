//! In-memory dataplane used by tests.
//!
//! Implements the same idempotence contract as the Linux backend and
//! counts mutations, so tests can assert that a second reconciliation
//! run touches nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv6Net};

use super::{Applied, Dataplane, DataplaneError, DpResult, LinkSpec, RouteSpec};

#[derive(Debug, Default, Clone)]
struct NsState {
    forwarding: bool,
    links: BTreeMap<String, LinkState>,
    routes: Vec<RouteSpec>,
    nat64: Option<Ipv6Net>,
    nptv6: Vec<(Ipv6Net, Ipv6Net)>,
}

#[derive(Debug, Clone, Default)]
struct LinkState {
    up: bool,
    addrs: BTreeSet<IpNet>,
    adopted: bool,
    /// The other end of a veth pair, as (namespace, name).
    peer: Option<(String, String)>,
}

#[derive(Debug, Default)]
struct Inner {
    namespaces: BTreeMap<String, NsState>,
    /// Links present in the default namespace, available for adoption.
    default_links: BTreeSet<String>,
    mutations: u64,
}

/// Fake dataplane with observable state.
#[derive(Debug, Default)]
pub struct MemoryDataplane {
    inner: Mutex<Inner>,
}

impl MemoryDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a link in the default namespace (for physical connections).
    pub fn seed_default_link(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .default_links
            .insert(name.to_string());
    }

    /// Number of state mutations performed so far.
    pub fn mutations(&self) -> u64 {
        self.inner.lock().unwrap().mutations
    }

    /// All objects recorded for a namespace, for teardown assertions:
    /// (links, routes, nat64 pool, nptv6 rules).
    #[allow(clippy::type_complexity)]
    pub fn ns_contents(
        &self,
        ns: &str,
    ) -> Option<(Vec<String>, Vec<RouteSpec>, Option<Ipv6Net>, Vec<(Ipv6Net, Ipv6Net)>)> {
        let inner = self.inner.lock().unwrap();
        inner.namespaces.get(ns).map(|state| {
            (
                state.links.keys().cloned().collect(),
                state.routes.clone(),
                state.nat64,
                state.nptv6.clone(),
            )
        })
    }

    /// Mark a link up or down, simulating a transport state change.
    pub fn set_link_state(&self, ns: &str, name: &str, up: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(link) = inner
            .namespaces
            .get_mut(ns)
            .and_then(|s| s.links.get_mut(name))
        {
            link.up = up;
        }
    }

    fn with_ns<T>(
        &self,
        ns: &str,
        f: impl FnOnce(&mut NsState, &mut u64) -> DpResult<T>,
    ) -> DpResult<T> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let state = inner
            .namespaces
            .get_mut(ns)
            .ok_or_else(|| DataplaneError::NotFound {
                object: format!("namespace {ns}"),
            })?;
        f(state, &mut inner.mutations)
    }
}

#[async_trait]
impl Dataplane for MemoryDataplane {
    async fn ns_list(&self) -> DpResult<Vec<String>> {
        Ok(self.inner.lock().unwrap().namespaces.keys().cloned().collect())
    }

    async fn ns_ensure(&self, name: &str) -> DpResult<Applied> {
        let mut inner = self.inner.lock().unwrap();
        if inner.namespaces.contains_key(name) {
            return Ok(Applied::Unchanged);
        }
        inner.namespaces.insert(name.to_string(), NsState::default());
        inner.mutations += 1;
        Ok(Applied::Created)
    }

    async fn ns_delete(&self, name: &str) -> DpResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(state) = inner.namespaces.remove(name) {
            // Veth ends parented here disappear from their peer
            // namespaces, like in the kernel.
            let peers: Vec<(String, String)> =
                state.links.values().filter_map(|l| l.peer.clone()).collect();
            for (peer_ns, peer) in peers {
                if let Some(peer_state) = inner.namespaces.get_mut(&peer_ns) {
                    peer_state.links.remove(&peer);
                }
            }
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn forwarding_enable(&self, ns: &str) -> DpResult<Applied> {
        self.with_ns(ns, |state, mutations| {
            if state.forwarding {
                return Ok(Applied::Unchanged);
            }
            state.forwarding = true;
            *mutations += 1;
            Ok(Applied::Changed)
        })
    }

    async fn link_ensure(&self, ns: &str, spec: &LinkSpec) -> DpResult<Applied> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let state = inner
            .namespaces
            .get_mut(ns)
            .ok_or_else(|| DataplaneError::NotFound {
                object: format!("namespace {ns}"),
            })?;
        if state.links.contains_key(&spec.name) {
            return Ok(Applied::Unchanged);
        }
        let mut link = LinkState::default();
        // A veth pair materializes its other end in the peer namespace.
        if let super::LinkKind::Veth { peer, peer_ns } = &spec.kind {
            link.peer = Some((peer_ns.clone(), peer.clone()));
            let peer_state = inner
                .namespaces
                .get_mut(peer_ns.as_str())
                .ok_or_else(|| DataplaneError::NotFound {
                    object: format!("namespace {peer_ns}"),
                })?;
            peer_state.links.insert(
                peer.clone(),
                LinkState {
                    peer: Some((ns.to_string(), spec.name.clone())),
                    ..LinkState::default()
                },
            );
        }
        let state = inner
            .namespaces
            .get_mut(ns)
            .expect("namespace checked above");
        state.links.insert(spec.name.clone(), link);
        inner.mutations += 1;
        Ok(Applied::Created)
    }

    async fn link_up(&self, ns: &str, name: &str) -> DpResult<Applied> {
        self.with_ns(ns, |state, mutations| {
            let link = state.links.get_mut(name).ok_or_else(|| DataplaneError::NotFound {
                object: format!("link {name}"),
            })?;
            if link.up {
                return Ok(Applied::Unchanged);
            }
            link.up = true;
            *mutations += 1;
            Ok(Applied::Changed)
        })
    }

    async fn link_delete(&self, ns: &str, name: &str) -> DpResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let removed = inner
            .namespaces
            .get_mut(ns)
            .and_then(|s| s.links.remove(name));
        if let Some(link) = removed {
            // The other end of a veth pair dies with this one.
            if let Some((peer_ns, peer)) = link.peer {
                if let Some(peer_state) = inner.namespaces.get_mut(&peer_ns) {
                    peer_state.links.remove(&peer);
                }
            }
            inner.mutations += 1;
        }
        Ok(())
    }

    async fn link_exists(&self, ns: &str, name: &str) -> DpResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .namespaces
            .get(ns)
            .map(|s| s.links.contains_key(name))
            .unwrap_or(false))
    }

    async fn link_is_up(&self, ns: &str, name: &str) -> DpResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .namespaces
            .get(ns)
            .and_then(|s| s.links.get(name))
            .map(|l| l.up)
            .unwrap_or(false))
    }

    async fn links(&self, ns: &str) -> DpResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .namespaces
            .get(ns)
            .map(|s| s.links.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn link_adopt(&self, ns: &str, name: &str) -> DpResult<Applied> {
        {
            let inner = self.inner.lock().unwrap();
            if inner
                .namespaces
                .get(ns)
                .map(|s| s.links.contains_key(name))
                .unwrap_or(false)
            {
                return Ok(Applied::Unchanged);
            }
            if !inner.default_links.contains(name) {
                return Err(DataplaneError::NotFound {
                    object: format!("link {name}"),
                });
            }
        }
        let mut inner = self.inner.lock().unwrap();
        inner.default_links.remove(name);
        let inner = &mut *inner;
        let state = inner
            .namespaces
            .get_mut(ns)
            .ok_or_else(|| DataplaneError::NotFound {
                object: format!("namespace {ns}"),
            })?;
        state.links.insert(
            name.to_string(),
            LinkState {
                adopted: true,
                ..LinkState::default()
            },
        );
        inner.mutations += 1;
        Ok(Applied::Changed)
    }

    async fn link_release(&self, ns: &str, name: &str) -> DpResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        if let Some(state) = inner.namespaces.get_mut(ns) {
            if let Some(link) = state.links.remove(name) {
                if link.adopted {
                    inner.default_links.insert(name.to_string());
                }
                inner.mutations += 1;
            }
        }
        Ok(())
    }

    async fn addr_sync(&self, ns: &str, link: &str, addrs: &[IpNet]) -> DpResult<Applied> {
        self.with_ns(ns, |state, mutations| {
            let link = state.links.get_mut(link).ok_or_else(|| DataplaneError::NotFound {
                object: format!("link {link}"),
            })?;
            let desired: BTreeSet<IpNet> = addrs.iter().copied().collect();
            if link.addrs == desired {
                return Ok(Applied::Unchanged);
            }
            link.addrs = desired;
            *mutations += 1;
            Ok(Applied::Changed)
        })
    }

    async fn addr_ensure(&self, ns: &str, link: &str, addr: &IpNet) -> DpResult<Applied> {
        self.with_ns(ns, |state, mutations| {
            let link = state.links.get_mut(link).ok_or_else(|| DataplaneError::NotFound {
                object: format!("link {link}"),
            })?;
            if link.addrs.contains(addr) {
                return Ok(Applied::Unchanged);
            }
            link.addrs.insert(*addr);
            *mutations += 1;
            Ok(Applied::Changed)
        })
    }

    async fn addrs(&self, ns: &str, link: &str) -> DpResult<Vec<IpNet>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .namespaces
            .get(ns)
            .and_then(|s| s.links.get(link))
            .map(|l| l.addrs.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn route_ensure(&self, ns: &str, route: &RouteSpec) -> DpResult<Applied> {
        self.with_ns(ns, |state, mutations| {
            if state.routes.iter().any(|r| r == route) {
                return Ok(Applied::Unchanged);
            }
            let replaced = state.routes.iter().position(|r| r.dst == route.dst);
            match replaced {
                Some(i) => {
                    state.routes[i] = route.clone();
                    *mutations += 1;
                    Ok(Applied::Changed)
                }
                None => {
                    state.routes.push(route.clone());
                    *mutations += 1;
                    Ok(Applied::Created)
                }
            }
        })
    }

    async fn route_delete(&self, ns: &str, dst: &IpNet) -> DpResult<()> {
        self.with_ns(ns, |state, mutations| {
            let before = state.routes.len();
            state.routes.retain(|r| r.dst != *dst);
            if state.routes.len() != before {
                *mutations += 1;
            }
            Ok(())
        })
    }

    async fn routes(&self, ns: &str) -> DpResult<Vec<RouteSpec>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .namespaces
            .get(ns)
            .map(|s| s.routes.clone())
            .unwrap_or_default())
    }

    async fn nat64_ensure(&self, ns: &str, pool: Ipv6Net) -> DpResult<Applied> {
        self.with_ns(ns, |state, mutations| {
            if state.nat64 == Some(pool) {
                return Ok(Applied::Unchanged);
            }
            let created = state.nat64.is_none();
            state.nat64 = Some(pool);
            *mutations += 1;
            Ok(if created { Applied::Created } else { Applied::Changed })
        })
    }

    async fn nat64_delete(&self, ns: &str) -> DpResult<()> {
        self.with_ns(ns, |state, mutations| {
            if state.nat64.take().is_some() {
                *mutations += 1;
            }
            Ok(())
        })
    }

    async fn nat64_pool(&self, ns: &str) -> DpResult<Option<Ipv6Net>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.namespaces.get(ns).and_then(|s| s.nat64))
    }

    async fn nptv6_sync(&self, ns: &str, rules: &[(Ipv6Net, Ipv6Net)]) -> DpResult<Applied> {
        self.with_ns(ns, |state, mutations| {
            if state.nptv6 == rules {
                return Ok(Applied::Unchanged);
            }
            let created = state.nptv6.is_empty();
            state.nptv6 = rules.to_vec();
            *mutations += 1;
            Ok(if created { Applied::Created } else { Applied::Changed })
        })
    }

    async fn nptv6_rules(&self, ns: &str) -> DpResult<Vec<(Ipv6Net, Ipv6Net)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .namespaces
            .get(ns)
            .map(|s| s.nptv6.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::LinkKind;

    #[tokio::test]
    async fn primitives_are_idempotent() {
        let dp = MemoryDataplane::new();
        assert_eq!(dp.ns_ensure("C0001-00").await.unwrap(), Applied::Created);
        assert_eq!(dp.ns_ensure("C0001-00").await.unwrap(), Applied::Unchanged);

        let spec = LinkSpec {
            name: "xfrm0".to_string(),
            kind: LinkKind::Xfrm { if_id: 0xC0001000 },
            parent_ns: Some("EXTERNAL".to_string()),
        };
        // The parent is irrelevant for the fake; create it anyway.
        dp.ns_ensure("EXTERNAL").await.unwrap();
        assert_eq!(dp.link_ensure("C0001-00", &spec).await.unwrap(), Applied::Created);
        assert_eq!(dp.link_ensure("C0001-00", &spec).await.unwrap(), Applied::Unchanged);

        let addr: IpNet = "100.99.0.1/28".parse().unwrap();
        assert_eq!(
            dp.addr_sync("C0001-00", "xfrm0", &[addr]).await.unwrap(),
            Applied::Changed
        );
        let before = dp.mutations();
        assert_eq!(
            dp.addr_sync("C0001-00", "xfrm0", &[addr]).await.unwrap(),
            Applied::Unchanged
        );
        assert_eq!(dp.mutations(), before);
    }

    #[tokio::test]
    async fn adopted_links_return_to_default_ns() {
        let dp = MemoryDataplane::new();
        dp.ns_ensure("C0001-00").await.unwrap();
        dp.seed_default_link("eth2");
        assert_eq!(dp.link_adopt("C0001-00", "eth2").await.unwrap(), Applied::Changed);
        assert!(dp.link_exists("C0001-00", "eth2").await.unwrap());
        dp.link_release("C0001-00", "eth2").await.unwrap();
        assert!(!dp.link_exists("C0001-00", "eth2").await.unwrap());
        // Adoptable again after release.
        assert_eq!(dp.link_adopt("C0001-00", "eth2").await.unwrap(), Applied::Changed);
    }
}
