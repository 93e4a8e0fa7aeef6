//! Configuration store: active and candidate YAML directories.
//!
//! One file per tenant, `DEFAULT.yaml` carrying the service settings.
//! The reconciler only ever sees validated [`Snapshot`]s; partial
//! writes are invisible because commits rename into place.

mod diff;
mod validate;
mod watcher;

pub use diff::{ChangeKind, Diff, DiffEntry};
pub use validate::validate;
pub use watcher::spawn_watcher;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::config::DEFAULT_TENANT;
use crate::error::{Error, Result};
use crate::model::{Service, Tenant, TenantId};

/// A validated, point-in-time view of the active configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub service: Service,
    /// Non-default tenants, keyed by id.
    pub tenants: BTreeMap<String, Tenant>,
}


/// Options for [`Store::commit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOptions {
    /// Validate and diff without touching `active/`.
    pub dry_run: bool,
    /// Copy active back over the candidate instead of committing.
    pub revert: bool,
}

/// Result of a commit: whether anything changed and the field-level diff.
#[derive(Debug, Clone, Serialize)]
pub struct CommitReport {
    pub tenant: String,
    pub changed: bool,
    pub diff: Diff,
}

/// File-backed configuration store.
#[derive(Debug, Clone)]
pub struct Store {
    active_dir: PathBuf,
    candidate_dir: PathBuf,
}

impl Store {
    pub fn new(active_dir: impl Into<PathBuf>, candidate_dir: impl Into<PathBuf>) -> Self {
        Self {
            active_dir: active_dir.into(),
            candidate_dir: candidate_dir.into(),
        }
    }

    pub fn active_dir(&self) -> &Path {
        &self.active_dir
    }

    /// Load and validate the full active configuration.
    ///
    /// I/O failures propagate as [`Error::Io`]: an unreadable active
    /// store is the one condition that must escalate to process exit.
    pub fn load_active(&self) -> Result<Snapshot> {
        self.load_dir(&self.active_dir)
    }

    fn load_dir(&self, dir: &Path) -> Result<Snapshot> {
        let mut service: Option<Service> = None;
        let mut tenants = BTreeMap::new();

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let raw = fs::read_to_string(&path)?;
            if stem == DEFAULT_TENANT {
                let parsed: Service = serde_yaml::from_str(&raw).map_err(|e| {
                    Error::invalid(path.display().to_string(), e.to_string())
                })?;
                service = Some(parsed);
                continue;
            }
            let id: TenantId = stem.parse()?;
            let tenant: Tenant = serde_yaml::from_str(&raw)
                .map_err(|e| Error::invalid(path.display().to_string(), e.to_string()))?;
            if tenant.id != id.to_string() {
                return Err(Error::invalid(
                    path.display().to_string(),
                    format!("tenant id {} does not match the file name", tenant.id),
                ));
            }
            tenants.insert(tenant.id.clone(), tenant);
        }

        let service = service.ok_or_else(|| {
            Error::invalid(
                dir.join("DEFAULT.yaml").display().to_string(),
                "service configuration is missing",
            )
        })?;

        let snapshot = Snapshot { service, tenants };
        validate(&snapshot)?;
        Ok(snapshot)
    }

    fn active_path(&self, tenant: &str) -> PathBuf {
        self.active_dir.join(format!("{tenant}.yaml"))
    }

    fn candidate_path(&self, tenant: &str) -> PathBuf {
        self.candidate_dir.join(format!("{tenant}.yaml"))
    }

    /// Read the candidate tenant file, if present.
    pub fn read_candidate(&self, tenant: &str) -> Result<Option<Tenant>> {
        let path = self.candidate_path(tenant);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let parsed = serde_yaml::from_str(&raw)
            .map_err(|e| Error::invalid(path.display().to_string(), e.to_string()))?;
        Ok(Some(parsed))
    }

    /// Write (create or replace) a candidate tenant file.
    pub fn write_candidate(&self, tenant: &Tenant) -> Result<()> {
        let _: TenantId = tenant.id.parse()?;
        let yaml = serde_yaml::to_string(tenant)?;
        write_atomic(&self.candidate_path(&tenant.id), yaml.as_bytes())
    }

    /// Delete a candidate tenant file; committing afterwards deletes
    /// the tenant.
    pub fn delete_candidate(&self, tenant: &str) -> Result<()> {
        if tenant == DEFAULT_TENANT {
            return Err(Error::invalid(
                tenant,
                "the DEFAULT tenant cannot be deleted",
            ));
        }
        let path = self.candidate_path(tenant);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Commit the candidate file for one tenant into `active/`.
    ///
    /// The combined snapshot (all active files with this tenant's file
    /// replaced by the candidate) must validate, otherwise nothing is
    /// written and the active store is byte-identical before and after.
    /// A missing candidate file is a tenant deletion. With `revert`,
    /// the copy direction is reversed.
    pub fn commit(&self, tenant: &str, opts: CommitOptions) -> Result<CommitReport> {
        let _: TenantId = tenant.parse()?;

        if opts.revert {
            return self.revert(tenant, opts);
        }

        let pre = self.load_active()?;
        let candidate_path = self.candidate_path(tenant);
        let candidate_raw = match fs::read_to_string(&candidate_path) {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if candidate_raw.is_none() && tenant == DEFAULT_TENANT {
            return Err(Error::invalid(
                candidate_path.display().to_string(),
                "the DEFAULT tenant cannot be deleted",
            ));
        }

        // Build and validate the combined snapshot before anything is
        // renamed into place.
        let mut post = pre.clone();
        match &candidate_raw {
            Some(raw) => {
                if tenant == DEFAULT_TENANT {
                    post.service = serde_yaml::from_str(raw).map_err(|e| {
                        Error::invalid(candidate_path.display().to_string(), e.to_string())
                    })?;
                } else {
                    let parsed: Tenant = serde_yaml::from_str(raw).map_err(|e| {
                        Error::invalid(candidate_path.display().to_string(), e.to_string())
                    })?;
                    if parsed.id != tenant {
                        return Err(Error::invalid(
                            candidate_path.display().to_string(),
                            format!("tenant id {} does not match the file name", parsed.id),
                        ));
                    }
                    post.tenants.insert(tenant.to_string(), parsed);
                }
            }
            None => {
                post.tenants.remove(tenant);
            }
        }
        validate(&post)?;

        let diff = self.tenant_diff(tenant, &pre, &post)?;
        let changed = !diff.is_empty();

        if !opts.dry_run && changed {
            match candidate_raw {
                Some(raw) => write_atomic(&self.active_path(tenant), raw.as_bytes())?,
                None => fs::remove_file(self.active_path(tenant))?,
            }
            info!(tenant, entries = diff.entries.len(), "committed configuration");
        }

        Ok(CommitReport {
            tenant: tenant.to_string(),
            changed,
            diff,
        })
    }

    fn revert(&self, tenant: &str, opts: CommitOptions) -> Result<CommitReport> {
        let active_path = self.active_path(tenant);
        let candidate_path = self.candidate_path(tenant);
        let active_raw = match fs::read_to_string(&active_path) {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let candidate_raw = match fs::read_to_string(&candidate_path) {
            Ok(raw) => Some(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let old = yaml_or_null(candidate_raw.as_deref())?;
        let new = yaml_or_null(active_raw.as_deref())?;
        let diff = Diff::between(&old, &new);
        let changed = !diff.is_empty();

        if !opts.dry_run && changed {
            match active_raw {
                Some(raw) => write_atomic(&candidate_path, raw.as_bytes())?,
                None => {
                    fs::remove_file(&candidate_path)?;
                }
            }
            info!(tenant, "reverted candidate to active");
        }

        Ok(CommitReport {
            tenant: tenant.to_string(),
            changed,
            diff,
        })
    }

    fn tenant_diff(&self, tenant: &str, pre: &Snapshot, post: &Snapshot) -> Result<Diff> {
        let (old, new) = if tenant == DEFAULT_TENANT {
            (
                serde_yaml::to_value(&pre.service)?,
                serde_yaml::to_value(&post.service)?,
            )
        } else {
            (
                tenant_value(pre.tenants.get(tenant))?,
                tenant_value(post.tenants.get(tenant))?,
            )
        };
        Ok(Diff::between(&old, &new))
    }
}

fn tenant_value(tenant: Option<&Tenant>) -> Result<serde_yaml::Value> {
    match tenant {
        Some(t) => Ok(serde_yaml::to_value(t)?),
        None => Ok(serde_yaml::Value::Null),
    }
}

fn yaml_or_null(raw: Option<&str>) -> Result<serde_yaml::Value> {
    match raw {
        Some(raw) => Ok(serde_yaml::from_str(raw)?),
        None => Ok(serde_yaml::Value::Null),
    }
}

/// Write a file via a temp name in the same directory plus rename, so
/// concurrent readers never observe a partial document.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::invalid(path.display().to_string(), "path has no parent"))?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("file")
    ));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
