//! Config store commit semantics on real directories.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use vpnc::error::Error;
use vpnc::model::{RouteV4, TransportConfig};
use vpnc::store::{CommitOptions, Store};
use vpnc::test_util::{hub_service, ipsec_connection, tenant_with};

struct Dirs {
    _root: TempDir,
    store: Store,
    active: std::path::PathBuf,
    candidate: std::path::PathBuf,
}

fn setup() -> Dirs {
    let root = TempDir::new().unwrap();
    let active = root.path().join("active");
    let candidate = root.path().join("candidate");
    fs::create_dir_all(&active).unwrap();
    fs::create_dir_all(&candidate).unwrap();

    let service = hub_service();
    let service_yaml = serde_yaml::to_string(&service).unwrap();
    fs::write(active.join("DEFAULT.yaml"), &service_yaml).unwrap();
    fs::write(candidate.join("DEFAULT.yaml"), &service_yaml).unwrap();

    let store = Store::new(&active, &candidate);
    Dirs {
        _root: root,
        store,
        active,
        candidate,
    }
}

fn write_tenant(dir: &Path, tenant: &vpnc::model::Tenant) {
    let yaml = serde_yaml::to_string(tenant).unwrap();
    fs::write(dir.join(format!("{}.yaml", tenant.id)), yaml).unwrap();
}

fn active_bytes(dirs: &Dirs) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<(String, Vec<u8>)> = fs::read_dir(&dirs.active)
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            (
                e.file_name().to_string_lossy().to_string(),
                fs::read(e.path()).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}

#[test]
fn commit_applies_candidate_to_active() {
    let dirs = setup();
    let tenant = tenant_with(0, vec![ipsec_connection(0)]);
    write_tenant(&dirs.candidate, &tenant);

    let report = dirs.store.commit("C0001", CommitOptions::default()).unwrap();
    assert!(report.changed);
    assert!(!report.diff.is_empty());

    let snapshot = dirs.store.load_active().unwrap();
    assert!(snapshot.tenants.contains_key("C0001"));
}

#[test]
fn dry_run_leaves_active_untouched() {
    let dirs = setup();
    let tenant = tenant_with(0, vec![ipsec_connection(0)]);
    write_tenant(&dirs.candidate, &tenant);

    let before = active_bytes(&dirs);
    let report = dirs
        .store
        .commit(
            "C0001",
            CommitOptions {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(report.changed);
    assert_eq!(active_bytes(&dirs), before);
}

#[test]
fn invalid_candidate_leaves_active_byte_identical() {
    let dirs = setup();

    // Routes and traffic selectors on the same IPsec connection.
    let mut conn = ipsec_connection(0);
    conn.routes.ipv4.push(RouteV4 {
        to: "10.0.0.0/24".parse().unwrap(),
        via: None,
    });
    if let TransportConfig::Ipsec(ipsec) = &mut conn.config {
        ipsec
            .traffic_selectors
            .local
            .push("10.0.0.0/24".parse().unwrap());
    }
    let tenant = tenant_with(0, vec![conn]);
    write_tenant(&dirs.candidate, &tenant);

    let before = active_bytes(&dirs);
    let err = dirs
        .store
        .commit("C0001", CommitOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
    assert!(err.to_string().contains("traffic_selectors"), "{err}");
    assert_eq!(active_bytes(&dirs), before);
}

#[test]
fn endpoint_mode_rejects_downlink_tenants() {
    let dirs = setup();

    // Rewrite the service into endpoint mode.
    let mut service = hub_service();
    service.mode = vpnc::model::ServiceMode::Endpoint;
    service.prefix_downlink_interface_v4 = None;
    service.prefix_downlink_interface_v6 = None;
    service.prefix_downlink_nat64 = None;
    service.prefix_downlink_nptv6 = None;
    service.bgp = None;
    let mut endpoint_ni = service.network_instances.get("CORE").cloned().unwrap();
    endpoint_ni.id = "ENDPOINT".to_string();
    endpoint_ni.ni_type = vpnc::model::NiType::Endpoint;
    service
        .network_instances
        .insert("ENDPOINT".to_string(), endpoint_ni);
    let yaml = serde_yaml::to_string(&service).unwrap();
    fs::write(dirs.active.join("DEFAULT.yaml"), &yaml).unwrap();

    let tenant = tenant_with(0, vec![ipsec_connection(0)]);
    write_tenant(&dirs.candidate, &tenant);

    let err = dirs
        .store
        .commit("C0001", CommitOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
    assert!(err.to_string().contains("not allowed"), "{err}");
}

#[test]
fn commit_revert_commit_is_a_noop() {
    let dirs = setup();
    let tenant = tenant_with(0, vec![ipsec_connection(0)]);
    write_tenant(&dirs.candidate, &tenant);

    let first = dirs.store.commit("C0001", CommitOptions::default()).unwrap();
    assert!(first.changed);
    let after_commit = active_bytes(&dirs);

    let revert = dirs
        .store
        .commit(
            "C0001",
            CommitOptions {
                revert: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert!(!revert.changed, "candidate already equals active");

    let second = dirs.store.commit("C0001", CommitOptions::default()).unwrap();
    assert!(!second.changed);
    assert_eq!(active_bytes(&dirs), after_commit);
}

#[test]
fn missing_candidate_deletes_the_tenant() {
    let dirs = setup();
    let tenant = tenant_with(0, vec![ipsec_connection(0)]);
    write_tenant(&dirs.candidate, &tenant);
    dirs.store.commit("C0001", CommitOptions::default()).unwrap();
    assert!(dirs.active.join("C0001.yaml").exists());

    fs::remove_file(dirs.candidate.join("C0001.yaml")).unwrap();
    let report = dirs.store.commit("C0001", CommitOptions::default()).unwrap();
    assert!(report.changed);
    assert!(!dirs.active.join("C0001.yaml").exists());
}

#[test]
fn default_tenant_cannot_be_deleted() {
    let dirs = setup();
    fs::remove_file(dirs.candidate.join("DEFAULT.yaml")).unwrap();
    let err = dirs
        .store
        .commit("DEFAULT", CommitOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}
