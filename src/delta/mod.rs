// src/delta/mod.rs

//! Delta packages
//!
//! A delta describes the difference between two releases of one binary
//! package. Its file name is derived from the package name, both releases,
//! the distribution release and the architecture, so the same pair always
//! yields the same name no matter which repository asks for it. That lets
//! deltas be cached in the pool and shared between repositories.
//!
//! Within a repository, every older release of a package gets a delta to the
//! highest release. Deltas are invalidated when either end is removed and
//! pruned when a newer release takes over as the target.

pub mod codec;

use crate::db::models::Artifact;
use crate::error::{Error, Result};
use crate::packages::DELTA_SUFFIX;
use crate::pool::Pool;
use crate::repository::collect_garbage;
use crate::repository::layout::Layout;
use glob::Pattern;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub use codec::{ZstdDeltaGenerator, apply_delta};

/// Inputs for one delta generation
#[derive(Debug, Clone, Copy)]
pub struct DeltaRequest<'a> {
    /// Package file of the older release
    pub old: &'a Path,
    /// Package file of the target release
    pub new: &'a Path,
    /// Scratch directory on the pool's filesystem for produced files
    pub work_dir: &'a Path,
    /// Conventional name of the delta
    pub delta_name: &'a str,
}

/// Produces delta packages between two releases
pub trait DeltaGenerator {
    /// Generate deltas for `request`, returning the produced files
    ///
    /// An empty list means no delta is possible for this pair.
    fn generate(&self, request: &DeltaRequest<'_>) -> Result<Vec<PathBuf>>;
}

/// Components parsed back out of a delta file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaName {
    pub from_release: u32,
    pub to_release: u32,
    pub distribution_release: String,
    pub architecture: String,
}

/// Name of the delta from `from` to `to`
pub fn delta_name(from: &Artifact, to: &Artifact) -> String {
    format!(
        "{}-{}-{}-{}-{}{}",
        to.package_name,
        from.release,
        to.release,
        to.distribution_release,
        to.architecture,
        DELTA_SUFFIX
    )
}

/// Pattern matching every delta that terminates at `artifact`'s release
pub fn delta_glob_to(artifact: &Artifact) -> Result<Pattern> {
    delta_glob(artifact, "*", &artifact.release.to_string())
}

/// Pattern matching every delta that originates from `artifact`'s release
pub fn delta_glob_from(artifact: &Artifact) -> Result<Pattern> {
    delta_glob(artifact, &artifact.release.to_string(), "*")
}

fn delta_glob(artifact: &Artifact, from: &str, to: &str) -> Result<Pattern> {
    let escape = |s: &str| if s == "*" { s.to_string() } else { Pattern::escape(s) };
    let pattern = format!(
        "{}-{}-{}-{}-{}{}",
        Pattern::escape(&artifact.package_name),
        escape(from),
        escape(to),
        Pattern::escape(&artifact.distribution_release),
        Pattern::escape(&artifact.architecture),
        Pattern::escape(DELTA_SUFFIX)
    );
    Pattern::new(&pattern).map_err(|e| Error::DeltaError(format!("Bad pattern {}: {}", pattern, e)))
}

/// Parse a delta file name belonging to `package`
///
/// Returns `None` for names of other packages, including packages whose name
/// merely starts with `package`.
pub fn parse_delta_name(name: &str, package: &str) -> Option<DeltaName> {
    let rest = name.strip_prefix(package)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(DELTA_SUFFIX)?;
    let parts: Vec<&str> = rest.split('-').collect();
    let [from, to, distribution_release, architecture] = parts.as_slice() else {
        return None;
    };
    Some(DeltaName {
        from_release: from.parse().ok()?,
        to_release: to.parse().ok()?,
        distribution_release: distribution_release.to_string(),
        architecture: architecture.to_string(),
    })
}

/// Delta files in `dir` invalidated by removing `artifact`
pub fn stale_deltas(dir: &Path, artifact: &Artifact) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let glob_to = delta_glob_to(artifact)?;
    let glob_from = delta_glob_from(artifact)?;

    let entries = fs::read_dir(dir).map_err(|e| Error::io("Failed to read", dir, e))?;
    let mut kills = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("Failed to read", dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !glob_to.matches(&name) && !glob_from.matches(&name) {
            continue;
        }
        // The wildcard must have been a release number
        let Some(parsed) = parse_delta_name(&name, &artifact.package_name) else {
            continue;
        };
        if parsed.from_release == artifact.release || parsed.to_release == artifact.release {
            kills.push(entry.path());
        }
    }

    kills.sort();
    Ok(kills)
}

/// Outcome of reconciling the deltas of one source
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Delta files newly linked into the repository
    pub linked: Vec<String>,
    /// Stale delta files removed from the repository
    pub pruned: Vec<String>,
}

impl ReconcileReport {
    pub fn changed(&self) -> bool {
        !self.linked.is_empty() || !self.pruned.is_empty()
    }
}

/// Computes, caches and prunes deltas within repositories
pub struct DeltaManager<'a> {
    pub layout: &'a Layout,
    pub pool: &'a Pool,
    pub generator: &'a dyn DeltaGenerator,
}

impl DeltaManager<'_> {
    /// Bring the deltas of one source in `repo` up to date
    ///
    /// For every binary package of the source, each older release gets a
    /// delta to the highest release. Deltas already in the pool are linked
    /// instead of regenerated.
    pub fn reconcile(&self, repo: &str, source: &str, artifacts: &[Artifact]) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let mut packages: BTreeMap<&str, Vec<&Artifact>> = BTreeMap::new();
        for artifact in artifacts {
            packages.entry(artifact.package_name.as_str()).or_default().push(artifact);
        }

        let source_dir = self.layout.source_dir(repo, source);
        for (package, mut bins) in packages {
            bins.sort_by(|a, b| b.release.cmp(&a.release));
            let top = bins[0];

            let mut expected = BTreeSet::new();
            for older in bins.iter().skip(1).filter(|a| a.release < top.release) {
                let name = delta_name(older, top);
                expected.insert(name.clone());

                let target = source_dir.join(&name);
                if target.exists() {
                    continue;
                }

                if self.pool.is_pooled(&name) {
                    info!("Using cached delta: {}", name);
                    self.pool.link_into(&name, &target)?;
                    report.linked.push(name);
                    continue;
                }

                info!("Creating delta: {}", name);
                for produced in self.generate(repo, older, top, &name)? {
                    expected.insert(produced.clone());
                    report.linked.push(produced);
                }
            }

            report.pruned.extend(self.prune(repo, source, package, top, &expected)?);
        }

        Ok(report)
    }

    fn generate(&self, repo: &str, older: &Artifact, top: &Artifact, name: &str) -> Result<Vec<String>> {
        self.pool.ensure_dir()?;
        let work_dir = tempfile::Builder::new()
            .prefix(".delta-")
            .tempdir_in(self.pool.dir())
            .map_err(|e| Error::io("Failed to create work directory in", self.pool.dir(), e))?;

        let old = self.layout.artifact_target(repo, older);
        let new = self.layout.artifact_target(repo, top);
        let request = DeltaRequest {
            old: &old,
            new: &new,
            work_dir: work_dir.path(),
            delta_name: name,
        };

        let produced = self.generator.generate(&request)?;
        if produced.is_empty() {
            info!("No delta possible for {}-{}", older.package_name, older.version);
            return Ok(Vec::new());
        }

        let mut linked = Vec::new();
        for path in produced {
            let Some(filename) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                warn!("Ignoring delta output without a file name: {}", path.display());
                continue;
            };
            if !self.pool.is_pooled(&filename) {
                self.pool.adopt(&path, &filename)?;
            }
            let target = self.layout.target_path(repo, &top.source_name, &filename);
            if !target.exists() {
                self.pool.link_into(&filename, &target)?;
                linked.push(filename);
            }
        }

        Ok(linked)
    }

    /// Remove deltas of `package` that no longer lead to `top`
    fn prune(
        &self,
        repo: &str,
        source: &str,
        package: &str,
        top: &Artifact,
        expected: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let dir = self.layout.source_dir(repo, source);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).map_err(|e| Error::io("Failed to read", &dir, e))?;
        let mut pruned = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("Failed to read", &dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = parse_delta_name(&name, package) else {
                continue;
            };
            if expected.contains(&name)
                || parsed.distribution_release != top.distribution_release
                || parsed.architecture != top.architecture
            {
                continue;
            }

            info!("Removing stale delta: {}", name);
            fs::remove_file(entry.path()).map_err(|e| Error::io("Unable to remove", &entry.path(), e))?;
            self.collect(source, &name)?;
            pruned.push(name);
        }

        Ok(pruned)
    }

    fn collect(&self, source: &str, filename: &str) -> Result<bool> {
        collect_garbage(self.layout, self.pool, source, filename)
    }
}
