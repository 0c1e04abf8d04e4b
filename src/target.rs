//! Distribution targets and target selection

use crate::error::{DistError, DistResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};

/// Selector literal expanding to every known target
pub const ALL_TARGETS: &str = "all";

/// One distribution to build for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Distro codename, unique within a run (e.g. "jammy")
    pub name: String,
    /// Container base image the final stage builds on
    pub base_image: String,
    /// Release version tag for the produced artifacts
    pub version_label: String,
}

impl Target {
    pub fn new(
        name: impl Into<String>,
        base_image: impl Into<String>,
        version_label: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_image: base_image.into(),
            version_label: version_label.into(),
        }
    }

    /// Check that the name is usable as a single directory component.
    ///
    /// Target names become staging directories under the output dir, which
    /// are removed on failure, so `..`, `/` or `a/b` must never get through.
    pub fn validate_name(name: &str) -> Result<(), String> {
        if name.is_empty() {
            return Err("target name must not be empty".to_string());
        }
        if name == ALL_TARGETS {
            return Err(format!("'{}' is reserved and cannot name a target", ALL_TARGETS));
        }
        let mut components = Path::new(name).components();
        let single_normal = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_normal || name.contains(['/', '\\']) {
            return Err(format!(
                "target name '{}' must be a plain directory name",
                name
            ));
        }
        Ok(())
    }

    /// Distributions the bundle is packaged for out of the box
    pub fn default_set() -> Vec<Self> {
        vec![
            Self::new("buster", "debian:buster", "10"),
            Self::new("bullseye", "debian:bullseye", "11"),
            Self::new("bionic", "ubuntu:bionic", "18.04"),
            Self::new("focal", "ubuntu:focal", "20.04"),
            Self::new("jammy", "ubuntu:jammy", "22.04"),
        ]
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.base_image)
    }
}

/// Requested target set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    /// Every known target
    All,
    /// A single target by name
    Named(String),
}

impl TargetSelector {
    pub fn parse(s: &str) -> Self {
        if s == ALL_TARGETS {
            Self::All
        } else {
            Self::Named(s.to_string())
        }
    }

    /// Expand the selector against the known set.
    ///
    /// The whole request is validated before anything is returned, so an
    /// unknown name never yields a partial target list.
    pub fn resolve(&self, known: &[Target]) -> DistResult<Vec<Target>> {
        match self {
            Self::All => Ok(known.to_vec()),
            Self::Named(name) => known
                .iter()
                .find(|t| &t.name == name)
                .map(|t| vec![t.clone()])
                .ok_or_else(|| DistError::UnknownTarget {
                    name: name.clone(),
                    known: known.iter().map(|t| t.name.clone()).collect(),
                }),
        }
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "{}", ALL_TARGETS),
            Self::Named(name) => write!(f, "{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parse() {
        assert_eq!(TargetSelector::parse("all"), TargetSelector::All);
        assert_eq!(
            TargetSelector::parse("focal"),
            TargetSelector::Named("focal".to_string())
        );
    }

    #[test]
    fn resolve_all_keeps_order() {
        let known = Target::default_set();
        let resolved = TargetSelector::All.resolve(&known).unwrap();
        let names: Vec<_> = resolved.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["buster", "bullseye", "bionic", "focal", "jammy"]);
    }

    #[test]
    fn resolve_named() {
        let known = Target::default_set();
        let resolved = TargetSelector::parse("bionic").resolve(&known).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].base_image, "ubuntu:bionic");
        assert_eq!(resolved[0].version_label, "18.04");
    }

    #[test]
    fn resolve_unknown_lists_known() {
        let known = Target::default_set();
        let err = TargetSelector::parse("warty").resolve(&known).unwrap_err();
        match err {
            DistError::UnknownTarget { name, known } => {
                assert_eq!(name, "warty");
                assert_eq!(known.len(), 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn target_display() {
        let target = Target::new("jammy", "ubuntu:jammy", "22.04");
        assert_eq!(target.to_string(), "jammy (ubuntu:jammy)");
    }
}
