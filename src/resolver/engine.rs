// src/resolver/engine.rs

//! Resolution against repository directories

use super::{Goal, InstalledPackage, ResolveRequest, Resolver};
use crate::error::{Error, Result};
use crate::packages::{Action, Nevra, Origin, PackageRecord};
use crate::repository::{LocalRepository, PackageMetadata};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// Resolves requests against loaded repository indexes
///
/// Picks the highest version of each requested name across all
/// repositories (earlier repositories win ties), then pulls in providers
/// for every unsatisfied requirement. Requirements already met by the base
/// tree are left alone.
pub struct DirectoryResolver {
    repos: Vec<LocalRepository>,
}

struct Chosen<'a> {
    record: PackageRecord,
    provides: Vec<String>,
    obsoletes: &'a [String],
}

impl DirectoryResolver {
    pub fn new(repos: Vec<LocalRepository>) -> Self {
        Self { repos }
    }

    fn all(&self) -> impl Iterator<Item = (&LocalRepository, &PackageMetadata)> {
        self.repos
            .iter()
            .flat_map(|r| r.metadata.packages.iter().map(move |p| (r, p)))
    }

    fn newest<'a>(
        it: impl Iterator<Item = (&'a LocalRepository, &'a PackageMetadata)>,
    ) -> Option<(&'a LocalRepository, &'a PackageMetadata)> {
        it.fold(None, |best, cand| match best {
            Some(b) if cand.1.nevra.cmp_evr(&b.1.nevra) != Ordering::Greater => Some(b),
            _ => Some(cand),
        })
    }

    /// Newest package named `name`
    fn by_name(&self, name: &str) -> Option<(&LocalRepository, &PackageMetadata)> {
        Self::newest(self.all().filter(|(_, p)| p.nevra.name == name))
    }

    /// Newest package named `what`, else the newest package providing it
    fn provider(&self, what: &str) -> Option<(&LocalRepository, &PackageMetadata)> {
        self.by_name(what)
            .or_else(|| Self::newest(self.all().filter(|(_, p)| p.provides(what))))
    }

    fn exact(&self, nevra: &Nevra) -> Option<(&LocalRepository, &PackageMetadata)> {
        self.all().find(|(_, p)| p.nevra == *nevra)
    }

    fn record_for(repo: &LocalRepository, pkg: &PackageMetadata, action: Action) -> PackageRecord {
        let mut record = PackageRecord::new(pkg.nevra.clone(), Origin::Repo(repo.id.clone()), action);
        record.size = pkg.size;
        record.repodata_checksum = Some(pkg.checksum.clone());
        record
    }
}

/// Action for `nevra` given what the base tree has under the same name
fn action_against(nevra: &Nevra, installed: Option<&InstalledPackage>) -> Option<(Action, Option<Nevra>)> {
    match installed {
        None => Some((Action::Install, None)),
        Some(inst) => match nevra.cmp_evr(&inst.nevra) {
            Ordering::Greater => Some((Action::Update, Some(inst.nevra.clone()))),
            Ordering::Less => Some((Action::Downgrade, Some(inst.nevra.clone()))),
            Ordering::Equal => None,
        },
    }
}

impl Resolver for DirectoryResolver {
    fn resolve(&self, request: &ResolveRequest) -> Result<Goal> {
        let installed: HashMap<&str, &InstalledPackage> = request
            .installed
            .iter()
            .map(|p| (p.nevra.name.as_str(), p))
            .collect();

        let removed: HashSet<&str> = request.remove.iter().map(String::as_str).collect();
        for name in &removed {
            if !installed.contains_key(name) {
                return Err(Error::ResolutionError(format!(
                    "Cannot remove '{}': not in the base tree",
                    name
                )));
            }
        }

        let mut chosen: Vec<Chosen<'_>> = Vec::new();
        let mut queue: VecDeque<(String, Option<String>)> = VecDeque::new();

        for local in &request.local {
            let inst = installed
                .get(local.record.name())
                .copied()
                .filter(|i| !removed.contains(i.nevra.name.as_str()));
            let Some((action, replaces)) = action_against(&local.record.nevra, inst) else {
                info!("{} is already in the base tree", local.record.nevra);
                continue;
            };
            let mut record = local.record.clone();
            record.action = action;
            record.replaces = replaces;
            for req in &local.requires {
                queue.push_back((req.clone(), Some(record.nevra.to_string())));
            }
            chosen.push(Chosen {
                record,
                provides: local.provides.clone(),
                obsoletes: &[],
            });
        }
        for spec in &request.install {
            queue.push_back((spec.clone(), None));
        }

        while let Some((what, needed_by)) = queue.pop_front() {
            let by_chosen = chosen
                .iter()
                .any(|c| c.record.nevra.name == what || c.provides.iter().any(|p| *p == what));
            if by_chosen {
                continue;
            }
            let in_base = request.installed.iter().any(|i| {
                !removed.contains(i.nevra.name.as_str())
                    && (i.nevra.name == what || i.provides.iter().any(|p| *p == what))
            });

            let pick = match &needed_by {
                Some(by) => {
                    if in_base {
                        continue;
                    }
                    self.provider(&what).ok_or_else(|| {
                        Error::ResolutionError(format!("Nothing provides '{}' needed by {}", what, by))
                    })?
                }
                None => {
                    let exact = Nevra::parse(&what).ok().and_then(|n| self.exact(&n));
                    match exact {
                        Some(found) => found,
                        None if in_base => match self.by_name(&what) {
                            Some(found) => found,
                            None => continue,
                        },
                        None => self.provider(&what).ok_or_else(|| {
                            Error::ResolutionError(format!("No package provides '{}'", what))
                        })?,
                    }
                }
            };

            let (repo, pkg) = pick;
            if chosen.iter().any(|c| c.record.nevra.name == pkg.nevra.name) {
                continue;
            }
            let inst = installed
                .get(pkg.nevra.name.as_str())
                .copied()
                .filter(|i| !removed.contains(i.nevra.name.as_str()));
            let Some((action, replaces)) = action_against(&pkg.nevra, inst) else {
                debug!("{} already satisfied by the base tree", pkg.nevra);
                continue;
            };

            let mut record = Self::record_for(repo, pkg, action);
            record.replaces = replaces;
            debug!("Resolved '{}' to {} ({})", what, record.nevra, action);
            for req in &pkg.requires {
                queue.push_back((req.clone(), Some(record.nevra.to_string())));
            }
            chosen.push(Chosen {
                record,
                provides: pkg.provides.clone(),
                obsoletes: &pkg.obsoletes,
            });
        }

        let mut packages: Vec<PackageRecord> = Vec::new();
        let mut obsoleted: HashSet<&str> = HashSet::new();
        for c in &chosen {
            for name in c.obsoletes {
                let Some(inst) = installed.get(name.as_str()) else {
                    continue;
                };
                let replaced = chosen.iter().any(|o| o.record.nevra.name == *name);
                if !removed.contains(name.as_str()) && !replaced && obsoleted.insert(name.as_str()) {
                    packages.push(PackageRecord::new(
                        inst.nevra.clone(),
                        Origin::Installed,
                        Action::Obsolete,
                    ));
                }
            }
        }

        let mut goal = Goal {
            packages: chosen.into_iter().map(|c| c.record).collect(),
        };
        goal.packages.append(&mut packages);
        for name in &request.remove {
            if let Some(inst) = installed.get(name.as_str()) {
                goal.packages.push(PackageRecord::new(
                    inst.nevra.clone(),
                    Origin::Installed,
                    Action::Remove,
                ));
            }
        }

        info!(
            "Resolved {} packages to install, {} to remove",
            goal.installs().count(),
            goal.removals().count()
        );
        Ok(goal)
    }
}
