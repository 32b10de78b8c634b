// Copyright 2023-2023 CrabNebula Ltd.
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # depsland-differ
//!
//! Computes the asset- and dependency-level change set between two
//! manifests of the same app, the input the publisher and installer both
//! drive off of.

use std::collections::BTreeSet;

use depsland_manifest::{AssetInfo, Manifest, PackageInfo, Scheme};

/// What happened to one manifest entry between `old` and `new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Present in `new` only.
    Append,
    /// Present in both, with different content.
    Update,
    /// Present in `old` only.
    Delete,
    /// Present in both, unchanged.
    Ignore,
}

/// One entry's transition from `old` to `new`.
#[derive(Debug, Clone)]
pub struct Change<T> {
    /// What kind of change this is.
    pub action: Action,
    /// The asset relative path or dependency normalized name.
    pub key: String,
    /// The entry as it was in the old manifest, if present.
    pub old: Option<T>,
    /// The entry as it is in the new manifest, if present.
    pub new: Option<T>,
}

/// The full change set between two manifests.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Asset changes, sorted by relative path.
    pub assets: Vec<Change<AssetInfo>>,
    /// Dependency changes, sorted by normalized package name.
    pub dependencies: Vec<Change<PackageInfo>>,
}

/// Compare `new` against `old`, producing a deterministic, key-sorted
/// change set for both assets and dependencies.
///
/// A `root`-scheme asset change is still recorded here; it's the
/// publisher and installer that treat `root` as a packaging no-op.
pub fn diff(new: &Manifest, old: &Manifest) -> DiffResult {
    DiffResult {
        assets: diff_assets(&new.assets, &old.assets),
        dependencies: diff_dependencies(&new.dependencies, &old.dependencies),
    }
}

fn diff_assets(
    new: &std::collections::BTreeMap<String, AssetInfo>,
    old: &std::collections::BTreeMap<String, AssetInfo>,
) -> Vec<Change<AssetInfo>> {
    let keys: BTreeSet<&String> = new.keys().chain(old.keys()).collect();
    keys.into_iter()
        .map(|key| {
            let new_info = new.get(key);
            let old_info = old.get(key);
            let action = match (new_info, old_info) {
                (Some(_), None) => Action::Append,
                (None, Some(_)) => Action::Delete,
                (Some(n), Some(o)) => {
                    if n.kind == o.kind && n.scheme == o.scheme && n.uid == o.uid {
                        Action::Ignore
                    } else {
                        Action::Update
                    }
                }
                (None, None) => unreachable!("key came from new or old"),
            };
            Change {
                action,
                key: key.clone(),
                old: old_info.cloned(),
                new: new_info.cloned(),
            }
        })
        .collect()
}

fn diff_dependencies(
    new: &std::collections::BTreeMap<String, PackageInfo>,
    old: &std::collections::BTreeMap<String, PackageInfo>,
) -> Vec<Change<PackageInfo>> {
    let keys: BTreeSet<&String> = new.keys().chain(old.keys()).collect();
    keys.into_iter()
        .map(|key| {
            let new_info = new.get(key);
            let old_info = old.get(key);
            let action = match (new_info, old_info) {
                (Some(_), None) => Action::Append,
                (None, Some(_)) => Action::Delete,
                (Some(n), Some(o)) => {
                    if n.id == o.id {
                        Action::Ignore
                    } else {
                        Action::Update
                    }
                }
                (None, None) => unreachable!("key came from new or old"),
            };
            Change {
                action,
                key: key.clone(),
                old: old_info.cloned(),
                new: new_info.cloned(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use depsland_manifest::{init_manifest, AssetKind, LauncherInfo};

    fn asset(scheme: Scheme, uid: &str) -> AssetInfo {
        AssetInfo {
            kind: AssetKind::File,
            scheme,
            updated_time: 0,
            hash: Some(uid.to_string()),
            uid: uid.to_string(),
        }
    }

    fn package(name: &str, version: &str) -> PackageInfo {
        PackageInfo {
            id: format!("{name}-{version}"),
            name: name.to_string(),
            version: version.to_string(),
            dependencies: vec![],
            appendix: None,
        }
    }

    #[test]
    fn every_key_appears_exactly_once() {
        let mut old = init_manifest("demo", "Demo");
        old.assets.insert("a.py".into(), asset(Scheme::All, "h1"));
        old.assets.insert("b.py".into(), asset(Scheme::All, "h2"));

        let mut new = init_manifest("demo", "Demo");
        new.version = "1.0.0".into();
        new.assets.insert("a.py".into(), asset(Scheme::All, "h1"));
        new.assets.insert("c.py".into(), asset(Scheme::All, "h3"));

        let result = diff(&new, &old);
        let keys: Vec<&str> = result.assets.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["a.py", "b.py", "c.py"]);

        let by_key = |k: &str| result.assets.iter().find(|c| c.key == k).unwrap();
        assert_eq!(by_key("a.py").action, Action::Ignore);
        assert_eq!(by_key("b.py").action, Action::Delete);
        assert_eq!(by_key("c.py").action, Action::Append);
    }

    #[test]
    fn same_path_changed_uid_is_update() {
        let mut old = init_manifest("demo", "Demo");
        old.assets.insert("a.py".into(), asset(Scheme::All, "h1"));

        let mut new = init_manifest("demo", "Demo");
        new.assets.insert("a.py".into(), asset(Scheme::All, "h2"));

        let result = diff(&new, &old);
        assert_eq!(result.assets[0].action, Action::Update);
    }

    #[test]
    fn root_scheme_change_is_still_recorded() {
        let old = init_manifest("demo", "Demo");
        let mut new = init_manifest("demo", "Demo");
        new.assets.insert("cache".into(), asset(Scheme::Root, "123"));

        let result = diff(&new, &old);
        assert_eq!(result.assets.len(), 1);
        assert_eq!(result.assets[0].action, Action::Append);
        assert_eq!(result.assets[0].new.as_ref().unwrap().scheme, Scheme::Root);
    }

    #[test]
    fn dependency_version_bump_is_update() {
        let mut old = init_manifest("demo", "Demo");
        old.dependencies
            .insert("requests".into(), package("requests", "2.30.0"));

        let mut new = init_manifest("demo", "Demo");
        new.dependencies
            .insert("requests".into(), package("requests", "2.31.0"));

        let result = diff(&new, &old);
        assert_eq!(result.dependencies[0].action, Action::Update);
    }

    #[test]
    fn unrelated_launcher_fields_dont_affect_asset_diff() {
        let mut old = init_manifest("demo", "Demo");
        old.launcher = LauncherInfo {
            command: "py a.py".into(),
            ..Default::default()
        };
        let new = old.clone();
        let result = diff(&new, &old);
        assert!(result.assets.is_empty());
        assert!(result.dependencies.is_empty());
    }
}
