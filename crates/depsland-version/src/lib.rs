// Copyright 2023-2023 CrabNebula Ltd.
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! # depsland-version
//!
//! Package name normalization and a PEP 440-ish version specifier algebra:
//! parsing comparator fragments, expanding asterisk forms, and selecting
//! the best matching version out of a sorted candidate list.

use std::cmp::Ordering;

use regex::Regex;
use thiserror::Error;

/// Errors produced while parsing a version specifier or a version string.
#[derive(Debug, Error)]
pub enum VersionError {
    /// A version specifier fragment didn't match the expected grammar.
    #[error("invalid version specifier: {0}")]
    InvalidSpec(String),
    /// The version string itself failed semver parsing (after the minor-form fix).
    #[error("invalid version {0:?}: {1}")]
    InvalidVersion(String, semver::Error),
}

/// A comparator in a version specifier fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==` or no comparator at all.
    Eq,
    /// `<=`
    Le,
    /// `<`
    Lt,
    /// `!=`
    Ne,
    /// `~=`
    Compatible,
    /// `latest` / `any` / `*` / empty spec — matches anything.
    Any,
}

impl Comparator {
    fn from_glyphs(s: &str) -> Option<Self> {
        Some(match s {
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "==" => Self::Eq,
            "<=" => Self::Le,
            "<" => Self::Lt,
            "!=" => Self::Ne,
            "~=" => Self::Compatible,
            _ => return None,
        })
    }
}

/// A single `(comparator, version)` fragment of a version specifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpec {
    /// The comparator for this fragment.
    pub comparator: Comparator,
    /// The version operand; empty when `comparator` is [`Comparator::Any`].
    pub version: String,
}

impl VersionSpec {
    /// The spec that matches any version.
    pub fn any() -> Self {
        Self {
            comparator: Comparator::Any,
            version: String::new(),
        }
    }
}

/// Lowercase a package name and normalize hyphens to underscores.
///
/// e.g. `"lk-logger"` -> `"lk_logger"`, `"PySide6"` -> `"pyside6"`.
pub fn normalize_name(raw_name: &str) -> String {
    raw_name.trim().to_lowercase().replace('-', "_")
}

/// Rewrite a PEP 440-style pre-release suffix into semver pre-release form.
///
/// e.g. `"0.1.0b3"` -> `"0.1.0-b.3"`.
pub fn minor_form_fix(raw: &str) -> String {
    let pattern = Regex::new(r"(\d)([a-zA-Z]+)(\d+)").unwrap();
    pattern.replace_all(raw, "$1-$2.$3").into_owned()
}

fn pad_version(raw: &str) -> String {
    let mut parts: Vec<&str> = raw.split('.').collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    parts.join(".")
}

/// Parse a version string into a [`semver::Version`], applying the
/// minor-form fix and zero-padding missing components first.
pub fn parse_version(raw: &str) -> Result<semver::Version, VersionError> {
    let fixed = minor_form_fix(raw.trim());
    let padded = pad_version(&fixed);
    semver::Version::parse(&padded).map_err(|e| VersionError::InvalidVersion(raw.to_string(), e))
}

fn bump_major(v: &semver::Version) -> semver::Version {
    semver::Version::new(v.major + 1, 0, 0)
}

fn bump_minor(v: &semver::Version) -> semver::Version {
    semver::Version::new(v.major, v.minor + 1, 0)
}

/// Parse a comma-separated version specifier into its `(comparator,
/// version)` fragments, expanding `latest`/`any`/`*` to [`Comparator::Any`]
/// and asterisk forms (`4.*`, `4.3.*`) into a `>=X,<Y` conjunction.
pub fn parse_version_spec(raw: &str) -> Result<Vec<VersionSpec>, VersionError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(vec![VersionSpec::any()]);
    }

    let splitter = Regex::new(r"^([<>=!~]*)(.+)$").unwrap();
    let asterisk = Regex::new(r"((?:\d+\.)+)\*$").unwrap();

    let mut specs = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        let caps = splitter
            .captures(part)
            .ok_or_else(|| VersionError::InvalidSpec(part.to_string()))?;
        let comp_glyphs = &caps[1];
        let ver = caps[2].trim();

        let comparator = if comp_glyphs.is_empty() {
            Comparator::Eq
        } else {
            Comparator::from_glyphs(comp_glyphs)
                .ok_or_else(|| VersionError::InvalidSpec(part.to_string()))?
        };

        if matches!(ver, "latest" | "any" | "*") {
            if comparator != Comparator::Eq {
                return Err(VersionError::InvalidSpec(part.to_string()));
            }
            specs.push(VersionSpec::any());
            continue;
        }

        if !ver.contains('*') {
            specs.push(VersionSpec {
                comparator,
                version: ver.to_string(),
            });
            continue;
        }

        if !matches!(comparator, Comparator::Ge | Comparator::Eq) {
            return Err(VersionError::InvalidSpec(part.to_string()));
        }
        let m = asterisk
            .captures(ver)
            .ok_or_else(|| VersionError::InvalidSpec(part.to_string()))?;
        let fixed_prefix = &m[1]; // e.g. "4." or "4.3."
        let dot_count = fixed_prefix.matches('.').count();

        let bottom_raw = ver.trim_end_matches('*').trim_end_matches('.');
        let bottom = parse_version(bottom_raw)?;
        let bumped = if dot_count == 1 {
            bump_major(&bottom)
        } else {
            bump_minor(&bottom)
        };

        specs.push(VersionSpec {
            comparator: Comparator::Ge,
            version: bottom.to_string(),
        });
        specs.push(VersionSpec {
            comparator: Comparator::Lt,
            version: bumped.to_string(),
        });
    }

    Ok(specs)
}

/// Compare `candidate` against `comparator version`. A spec with
/// [`Comparator::Any`] matches every candidate.
pub fn compare(version: &str, comparator: Comparator, candidate: &str) -> Result<bool, VersionError> {
    if comparator == Comparator::Any {
        return Ok(true);
    }
    let lhs = parse_version(candidate)?;
    let rhs = parse_version(version)?;
    Ok(match comparator {
        Comparator::Gt => lhs > rhs,
        Comparator::Ge => lhs >= rhs,
        Comparator::Eq => lhs == rhs,
        Comparator::Le => lhs <= rhs,
        Comparator::Lt => lhs < rhs,
        Comparator::Ne => lhs != rhs,
        // pip's `~=X.Y` means `>=X.Y,<(X+1).0`; callers that need the full
        // range should expand it themselves, same as the asterisk forms.
        Comparator::Compatible => lhs >= rhs,
        Comparator::Any => true,
    })
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Finite(semver::Version),
    Infinite,
}

fn sort_key(v: &str) -> SortKey {
    let trimmed = v.trim();
    if matches!(trimmed, "" | "*" | "latest" | "any") {
        return SortKey::Infinite;
    }
    match parse_version(trimmed) {
        Ok(ver) => SortKey::Finite(ver),
        Err(_) => SortKey::Infinite,
    }
}

/// Sort `versions` by semantic version, descending by default
/// (`desc = false` sorts ascending). Empty/`latest`/`any`/`*` sort as `+∞`.
pub fn sort_versions(versions: &mut [String], desc: bool) {
    versions.sort_by(|a, b| {
        let ord = sort_key(a).cmp(&sort_key(b));
        if desc {
            ord.reverse()
        } else {
            ord
        }
    });
}

/// Given a list of specs and a list of candidate versions sorted newest to
/// oldest, intersect the candidates by applying each spec in turn and
/// return the newest survivor, or `None` if the intersection is empty.
pub fn find_best_match(specs: &[VersionSpec], candidates: &[String]) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }
    if specs.len() == 1 && specs[0].comparator == Comparator::Any {
        return candidates.first().cloned();
    }

    let mut pool: Vec<String> = candidates.to_vec();
    for spec in specs {
        let filtered: Vec<String> = pool
            .iter()
            .filter(|c| compare(&spec.version, spec.comparator, c).unwrap_or(false))
            .cloned()
            .collect();
        if filtered.is_empty() {
            tracing::debug!(version = %spec.version, comparator = ?spec.comparator, "no candidate satisfies spec");
            return None;
        }
        pool = filtered;
    }
    pool.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_name("lk-logger"), "lk_logger");
        assert_eq!(normalize_name("PySide6"), "pyside6");
    }

    #[test]
    fn minor_form_fix_rewrites_prerelease() {
        assert_eq!(minor_form_fix("0.1.0b3"), "0.1.0-b.3");
        assert_eq!(minor_form_fix("1.2.3"), "1.2.3");
    }

    #[test]
    fn minor_form_fix_is_idempotent() {
        let once = minor_form_fix("0.1.0b3");
        let twice = minor_form_fix(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn latest_any_star_normalize_to_any_spec() {
        for token in ["latest", "any", "*", ""] {
            let specs = parse_version_spec(token).unwrap();
            assert_eq!(specs, vec![VersionSpec::any()]);
        }
    }

    #[test]
    fn plain_version_is_eq() {
        let specs = parse_version_spec("4.5.3").unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].comparator, Comparator::Eq);
        assert_eq!(specs[0].version, "4.5.3");
    }

    #[test]
    fn comma_separated_range() {
        let specs = parse_version_spec(">=4.5,<5.0").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].comparator, Comparator::Ge);
        assert_eq!(specs[1].comparator, Comparator::Lt);
    }

    #[test]
    fn major_asterisk_expands_to_next_major() {
        let specs = parse_version_spec("==4.*").unwrap();
        assert_eq!(
            specs,
            vec![
                VersionSpec {
                    comparator: Comparator::Ge,
                    version: "4.0.0".into()
                },
                VersionSpec {
                    comparator: Comparator::Lt,
                    version: "5.0.0".into()
                },
            ]
        );
    }

    #[test]
    fn minor_asterisk_expands_to_next_minor() {
        let specs = parse_version_spec("==4.3.*").unwrap();
        assert_eq!(
            specs,
            vec![
                VersionSpec {
                    comparator: Comparator::Ge,
                    version: "4.3.0".into()
                },
                VersionSpec {
                    comparator: Comparator::Lt,
                    version: "4.4.0".into()
                },
            ]
        );
    }

    #[test]
    fn sort_versions_descending_puts_latest_first() {
        let mut versions = vec![
            "1.0.0".to_string(),
            "latest".to_string(),
            "2.0.0".to_string(),
            "1.5.0".to_string(),
        ];
        sort_versions(&mut versions, true);
        assert_eq!(versions, vec!["latest", "2.0.0", "1.5.0", "1.0.0"]);
    }

    #[test]
    fn best_match_over_multiple_specs() {
        let candidates = vec!["2.32.0".to_string(), "2.31.0".to_string(), "2.0.0".to_string()];
        let specs = parse_version_spec(">=2.1.0,<2.32.0").unwrap();
        assert_eq!(find_best_match(&specs, &candidates), Some("2.31.0".to_string()));
    }

    #[test]
    fn best_match_empty_intersection_is_none() {
        let candidates = vec!["1.0.0".to_string()];
        let specs = parse_version_spec(">=2.0.0").unwrap();
        assert_eq!(find_best_match(&specs, &candidates), None);
    }

    #[test]
    fn best_match_any_returns_newest() {
        let candidates = vec!["2.0.0".to_string(), "1.0.0".to_string()];
        let specs = parse_version_spec("*").unwrap();
        assert_eq!(find_best_match(&specs, &candidates), Some("2.0.0".to_string()));
    }
}
