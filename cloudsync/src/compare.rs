//! Three-way set compare between local mirror rows and upstream objects.
//!
//! Rows and objects are joined on external id through a hash index, so the
//! compare is linear in the size of both sides. Every output bucket is sorted
//! by external id.

use std::collections::{HashMap, HashSet};

use crate::model::{Managed, RemoteResource};

/// Anything that exposes the provider's global id.
pub trait Upstream {
    fn global_id(&self) -> &str;
}

impl Upstream for RemoteResource {
    fn global_id(&self) -> &str {
        &self.global_id
    }
}

/// Problems found while building the join. None of them abort the compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareIssue {
    /// Two local rows share an external id. The first by local id is kept.
    DuplicateLocal { external_id: String },
    /// The driver returned the same global id twice. The first is kept.
    DuplicateRemote { global_id: String },
    /// The driver returned an object without a global id. It is dropped.
    MissingGlobalId { name: String },
}

#[derive(Debug)]
pub struct CompareSet<L, R> {
    pub removed: Vec<L>,
    pub common_local: Vec<L>,
    pub common_remote: Vec<R>,
    pub added: Vec<R>,
    /// Local rows that were never pushed upstream.
    pub orphan_local: Vec<L>,
    pub issues: Vec<CompareIssue>,
}

impl<L, R> CompareSet<L, R> {
    pub fn is_in_sync(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Compare `local` against `remote`. `describe` names a remote object in
/// issue reports when it lacks a global id.
pub fn compare<L, R>(
    mut local: Vec<L>,
    remote: Vec<R>,
    local_id: impl Fn(&L) -> &str,
    describe: impl Fn(&R) -> String,
) -> CompareSet<L, R>
where
    L: Managed,
    R: Upstream,
{
    let mut issues = Vec::new();

    let mut remote_index: HashMap<String, usize> = HashMap::with_capacity(remote.len());
    let mut remote_slots: Vec<Option<R>> = Vec::with_capacity(remote.len());
    for r in remote {
        let gid = r.global_id();
        if gid.is_empty() {
            issues.push(CompareIssue::MissingGlobalId { name: describe(&r) });
            continue;
        }
        if remote_index.contains_key(gid) {
            issues.push(CompareIssue::DuplicateRemote {
                global_id: gid.to_string(),
            });
            continue;
        }
        remote_index.insert(gid.to_string(), remote_slots.len());
        remote_slots.push(Some(r));
    }

    // Deterministic winner among local duplicates.
    local.sort_by(|a, b| local_id(a).cmp(local_id(b)));

    let mut removed = Vec::new();
    let mut pairs = Vec::new();
    let mut orphan_local = Vec::new();
    let mut seen: HashSet<String> = HashSet::with_capacity(local.len());

    for l in local {
        let Some(ext) = l.external_id().map(str::to_string) else {
            orphan_local.push(l);
            continue;
        };
        if !seen.insert(ext.clone()) {
            issues.push(CompareIssue::DuplicateLocal { external_id: ext });
            continue;
        }
        match remote_index
            .get(&ext)
            .and_then(|&i| remote_slots[i].take())
        {
            Some(r) => pairs.push((ext, l, r)),
            None => removed.push((ext, l)),
        }
    }

    let mut added: Vec<R> = remote_slots.into_iter().flatten().collect();

    removed.sort_by(|a, b| a.0.cmp(&b.0));
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    added.sort_by(|a, b| a.global_id().cmp(b.global_id()));

    let (common_local, common_remote) = pairs.into_iter().map(|(_, l, r)| (l, r)).unzip();

    CompareSet {
        removed: removed.into_iter().map(|(_, l)| l).collect(),
        common_local,
        common_remote,
        added,
        orphan_local,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Resource, ResourceKind};

    fn local(id: &str, ext: &str) -> Resource {
        Resource::new(ResourceKind::AccessGroup, id)
            .with_id(id)
            .with_external("p1", ext)
    }

    fn run(
        l: Vec<Resource>,
        r: Vec<RemoteResource>,
    ) -> CompareSet<Resource, RemoteResource> {
        compare(l, r, |x| x.id.as_str(), |x| x.name.clone())
    }

    fn exts(v: &[Resource]) -> Vec<&str> {
        v.iter().filter_map(|r| r.external_id()).collect()
    }

    fn gids(v: &[RemoteResource]) -> Vec<&str> {
        v.iter().map(|r| r.global_id.as_str()).collect()
    }

    #[test]
    fn test_three_way_split_is_sorted() {
        let set = run(
            vec![local("3", "c"), local("1", "a"), local("2", "b")],
            vec![
                RemoteResource::new("d", "d"),
                RemoteResource::new("b", "b"),
                RemoteResource::new("e", "e"),
            ],
        );
        assert_eq!(exts(&set.removed), vec!["a", "c"]);
        assert_eq!(exts(&set.common_local), vec!["b"]);
        assert_eq!(gids(&set.common_remote), vec!["b"]);
        assert_eq!(gids(&set.added), vec!["d", "e"]);
        assert!(set.issues.is_empty());
    }

    #[test]
    fn test_local_without_external_id_is_orphan() {
        let mut pending = Resource::new(ResourceKind::AccessGroup, "new").with_id("9");
        pending.managed.external_id = Some(String::new());
        let set = run(
            vec![pending, Resource::new(ResourceKind::AccessGroup, "x")],
            vec![RemoteResource::new("a", "a")],
        );
        assert_eq!(set.orphan_local.len(), 2);
        assert!(set.removed.is_empty());
        assert_eq!(gids(&set.added), vec!["a"]);
    }

    #[test]
    fn test_duplicates_and_missing_ids_are_reported() {
        let set = run(
            vec![local("2", "a"), local("1", "a")],
            vec![
                RemoteResource::new("a", "first"),
                RemoteResource::new("a", "second"),
                RemoteResource::new("", "broken"),
            ],
        );
        assert_eq!(set.common_local.len(), 1);
        assert_eq!(set.common_local[0].id, "1");
        assert_eq!(set.common_remote[0].name, "first");
        assert_eq!(
            set.issues,
            vec![
                CompareIssue::DuplicateRemote {
                    global_id: "a".into()
                },
                CompareIssue::MissingGlobalId {
                    name: "broken".into()
                },
                CompareIssue::DuplicateLocal {
                    external_id: "a".into()
                },
            ]
        );
    }

    #[test]
    fn test_large_sets() {
        let n = 20_000;
        let l: Vec<_> = (0..n)
            .map(|i| local(&format!("{i}"), &format!("x-{i:06}")))
            .collect();
        let r: Vec<_> = (n / 2..n + n / 2)
            .map(|i| RemoteResource::new(format!("x-{i:06}"), "r"))
            .collect();
        let set = run(l, r);
        assert_eq!(set.removed.len(), n / 2);
        assert_eq!(set.common_local.len(), n / 2);
        assert_eq!(set.added.len(), n / 2);
        assert!(!set.is_in_sync());
    }
}
