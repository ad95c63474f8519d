//! Matrix resolution: axes, exclusion rules and build variants.
//!
//! Resolution is pure set subtraction over the axis cross-product. A rule is
//! a partial assignment; it matches a candidate when every axis it names
//! carries the same value in the candidate.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// A named matrix dimension with ordered values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Axis {
    pub name: String,
    pub values: Vec<String>,
}

impl Axis {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Partial assignment of axis values; matching variants are excluded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ExclusionRule {
    constraints: BTreeMap<String, String>,
}

impl ExclusionRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an `axis = value` constraint.
    pub fn with(mut self, axis: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints.insert(axis.into(), value.into());
        self
    }

    pub fn constraints(&self) -> &BTreeMap<String, String> {
        &self.constraints
    }

    /// Axes not named by the rule match any value.
    pub fn matches(&self, variant: &BuildVariant) -> bool {
        self.constraints
            .iter()
            .all(|(axis, value)| variant.get(axis) == Some(value.as_str()))
    }
}

/// One surviving point of the matrix cross-product.
///
/// Variants are only produced by [`resolve`]; the assignment order follows
/// the axis declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BuildVariant {
    assignments: Vec<(String, String)>,
}

impl BuildVariant {
    /// Value assigned to `axis`, if the axis exists.
    pub fn get(&self, axis: &str) -> Option<&str> {
        self.assignments
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    pub fn assignments(&self) -> &[(String, String)] {
        &self.assignments
    }

    /// Canonical `axis=value,...` signature.
    pub fn signature(&self) -> String {
        self.assignments
            .iter()
            .map(|(axis, value)| format!("{}={}", axis, value))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Short stable identifier: first 12 hex chars of the signature digest.
    pub fn id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.signature().as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..12].to_string()
    }
}

impl std::fmt::Display for BuildVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.signature())
    }
}

/// Axes plus exclusion rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matrix {
    pub axes: Vec<Axis>,
    pub rules: Vec<ExclusionRule>,
}

impl Matrix {
    pub fn new(axes: Vec<Axis>, rules: Vec<ExclusionRule>) -> Self {
        Self { axes, rules }
    }

    pub fn resolve(&self) -> Result<Vec<BuildVariant>, ConfigurationError> {
        resolve(&self.axes, &self.rules)
    }
}

/// Check axis names are unique and every axis declares at least one value.
pub fn validate_axes(axes: &[Axis]) -> Result<(), ConfigurationError> {
    let mut seen = BTreeSet::new();
    for axis in axes {
        if !seen.insert(axis.name.as_str()) {
            return Err(ConfigurationError::DuplicateAxis(axis.name.clone()));
        }
        if axis.values.is_empty() {
            return Err(ConfigurationError::EmptyAxis(axis.name.clone()));
        }
    }
    Ok(())
}

/// Check every rule constrains at least one axis and only known axes.
pub fn validate_rules(axes: &[Axis], rules: &[ExclusionRule]) -> Result<(), ConfigurationError> {
    for (index, rule) in rules.iter().enumerate() {
        if rule.constraints.is_empty() {
            return Err(ConfigurationError::EmptyRule(index));
        }
        for (name, value) in &rule.constraints {
            let axis = axes.iter().find(|a| &a.name == name).ok_or_else(|| {
                ConfigurationError::UnknownAxis {
                    context: format!("exclusion rule #{}", index),
                    axis: name.clone(),
                }
            })?;
            if !axis.values.contains(value) {
                warn!(rule = index, axis = %name, value = %value, "Exclusion rule value is never produced");
            }
        }
    }
    Ok(())
}

/// Resolve axes and rules into the deduplicated set of surviving variants.
///
/// The first axis varies slowest. Fails if a rule names an unknown axis or
/// if nothing survives.
pub fn resolve(axes: &[Axis], rules: &[ExclusionRule]) -> Result<Vec<BuildVariant>, ConfigurationError> {
    validate_axes(axes)?;
    validate_rules(axes, rules)?;

    let axes: Vec<Axis> = axes
        .iter()
        .map(|axis| {
            let mut seen = BTreeSet::new();
            let values = axis
                .values
                .iter()
                .filter(|v| seen.insert(v.as_str()))
                .cloned()
                .collect();
            Axis {
                name: axis.name.clone(),
                values,
            }
        })
        .collect();

    let mut candidates: Vec<Vec<(String, String)>> = vec![Vec::new()];
    for axis in &axes {
        let mut next = Vec::with_capacity(candidates.len() * axis.values.len());
        for partial in &candidates {
            for value in &axis.values {
                let mut assignment = partial.clone();
                assignment.push((axis.name.clone(), value.clone()));
                next.push(assignment);
            }
        }
        candidates = next;
    }

    let total = candidates.len();
    let mut seen = BTreeSet::new();
    let variants: Vec<BuildVariant> = candidates
        .into_iter()
        .map(|assignments| BuildVariant { assignments })
        .filter(|variant| !rules.iter().any(|rule| rule.matches(variant)))
        .filter(|variant| seen.insert(variant.signature()))
        .collect();

    debug!(candidates = total, surviving = variants.len(), "Resolved matrix");
    if variants.is_empty() {
        return Err(ConfigurationError::EmptyMatrix);
    }
    Ok(variants)
}

/// Narrow axes to a schedule's value subsets, keeping declaration order.
pub fn restrict_axes(
    axes: &[Axis],
    overrides: &BTreeMap<String, Vec<String>>,
    context: &str,
) -> Result<Vec<Axis>, ConfigurationError> {
    for (name, values) in overrides {
        let axis = axes.iter().find(|a| &a.name == name).ok_or_else(|| {
            ConfigurationError::UnknownAxis {
                context: context.to_string(),
                axis: name.clone(),
            }
        })?;
        if let Some(value) = values.iter().find(|v| !axis.values.contains(v)) {
            return Err(ConfigurationError::UnknownAxisValue {
                context: context.to_string(),
                axis: name.clone(),
                value: value.clone(),
            });
        }
    }

    Ok(axes
        .iter()
        .map(|axis| match overrides.get(&axis.name) {
            Some(keep) => Axis {
                name: axis.name.clone(),
                values: axis.values.iter().filter(|v| keep.contains(v)).cloned().collect(),
            },
            None => axis.clone(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_axes() -> Vec<Axis> {
        vec![
            Axis::new("runtime", ["A", "B"]),
            Axis::new("server", ["X", "Y"]),
            Axis::new("accel", ["on", "off"]),
        ]
    }

    #[test]
    fn test_example_scenario_six_of_eight() {
        let rules = vec![ExclusionRule::new().with("runtime", "B").with("accel", "on")];
        let variants = resolve(&example_axes(), &rules).unwrap();

        assert_eq!(variants.len(), 6);
        assert!(!variants
            .iter()
            .any(|v| v.get("runtime") == Some("B") && v.get("accel") == Some("on")));
    }

    #[test]
    fn test_cross_product_order_first_axis_slowest() {
        let variants = resolve(&example_axes(), &[]).unwrap();
        assert_eq!(variants.len(), 8);
        assert_eq!(variants[0].signature(), "runtime=A,server=X,accel=on");
        assert_eq!(variants[1].signature(), "runtime=A,server=X,accel=off");
        assert_eq!(variants[7].signature(), "runtime=B,server=Y,accel=off");
    }

    #[test]
    fn test_unknown_axis_in_rule_is_configuration_error() {
        let rules = vec![ExclusionRule::new().with("platform", "win")];
        let err = resolve(&example_axes(), &rules).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownAxis { ref axis, .. } if axis == "platform"));
    }

    #[test]
    fn test_everything_excluded_is_configuration_error() {
        let rules = vec![
            ExclusionRule::new().with("accel", "on"),
            ExclusionRule::new().with("accel", "off"),
        ];
        let err = resolve(&example_axes(), &rules).unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyMatrix));
    }

    #[test]
    fn test_empty_rule_rejected() {
        let err = resolve(&example_axes(), &[ExclusionRule::new()]).unwrap_err();
        assert!(matches!(err, ConfigurationError::EmptyRule(0)));
    }

    #[test]
    fn test_duplicate_values_deduplicated() {
        let axes = vec![Axis::new("runtime", ["A", "A", "B"]), Axis::new("accel", ["on"])];
        let variants = resolve(&axes, &[]).unwrap();
        assert_eq!(variants.len(), 2);
    }

    #[test]
    fn test_duplicate_and_empty_axes_rejected() {
        let axes = vec![Axis::new("runtime", ["A"]), Axis::new("runtime", ["B"])];
        assert!(matches!(
            resolve(&axes, &[]).unwrap_err(),
            ConfigurationError::DuplicateAxis(_)
        ));

        let axes = vec![Axis::new("runtime", Vec::<String>::new())];
        assert!(matches!(
            resolve(&axes, &[]).unwrap_err(),
            ConfigurationError::EmptyAxis(_)
        ));
    }

    #[test]
    fn test_rule_order_does_not_matter() {
        let a = ExclusionRule::new().with("runtime", "A").with("server", "Y");
        let b = ExclusionRule::new().with("accel", "off");
        let forward = resolve(&example_axes(), &[a.clone(), b.clone()]).unwrap();
        let backward = resolve(&example_axes(), &[b, a]).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_variant_ids_are_distinct() {
        let variants = resolve(&example_axes(), &[]).unwrap();
        let ids: BTreeSet<String> = variants.iter().map(|v| v.id()).collect();
        assert_eq!(ids.len(), variants.len());
        assert!(variants.iter().all(|v| v.id().len() == 12));
    }

    #[test]
    fn test_restrict_axes_keeps_declared_order() {
        let mut overrides = BTreeMap::new();
        overrides.insert("server".to_string(), vec!["Y".to_string()]);
        let axes = restrict_axes(&example_axes(), &overrides, "schedule `nightly`").unwrap();
        assert_eq!(axes[1].values, vec!["Y".to_string()]);
        assert_eq!(axes[0].values.len(), 2);
    }

    #[test]
    fn test_restrict_axes_rejects_unknown_value() {
        let mut overrides = BTreeMap::new();
        overrides.insert("server".to_string(), vec!["Z".to_string()]);
        let err = restrict_axes(&example_axes(), &overrides, "schedule `nightly`").unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownAxisValue { .. }));
    }
}
