//! # Versioning
//!
//! Content hashes that decide whether a step would produce the same output
//! again. A step version combines the step's code version, its config, the
//! versions of the resources it uses and the versions of its upstream inputs;
//! an output version combines the output name with the step version.
//!
//! `None` means "no stable version": the step is never memoized. It only
//! arises at the top of [`join_and_hash`]; intermediate hashes are always
//! concrete strings.

pub mod logical;

use serde_json::Value;
use sha2::{Digest, Sha256};

pub use logical::{compute_logical_version, topological_asset_order};

/// Hex-encoded SHA-256 of `value`
pub fn hash_str(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Order-independent combination of already-concrete parts.
///
/// Each part is hashed on its own before sorting, so moving characters across
/// part boundaries changes the result.
pub fn hash_sorted<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hashes: Vec<String> = parts.into_iter().map(|p| hash_str(p.as_ref())).collect();
    hashes.sort_unstable();
    hash_str(&hashes.concat())
}

/// Combine parts into one version; any missing part makes the whole version missing.
pub fn join_and_hash(parts: &[Option<&str>]) -> Option<String> {
    let concrete: Option<Vec<&str>> = parts.iter().copied().collect();
    concrete.map(hash_sorted)
}

/// Version of a config value, independent of object key order.
///
/// Array positions are significant, object key order is not, and scalars are
/// hashed through their JSON form so `1` and `"1"` differ.
pub fn resolve_config_version(value: &Value) -> String {
    match value {
        Value::Object(map) => hash_sorted(
            map.iter()
                .map(|(key, nested)| format!("{key}{}", resolve_config_version(nested))),
        ),
        Value::Array(items) => hash_sorted(
            items
                .iter()
                .enumerate()
                .map(|(index, nested)| format!("{index}{}", resolve_config_version(nested))),
        ),
        scalar => hash_str(&scalar.to_string()),
    }
}

/// Version of a resource: its config version joined with its declared version.
/// A resource without a declared version is versioned by its config alone.
pub fn resolve_resource_version(config: &Value, definition_version: Option<&str>) -> String {
    let config_version = resolve_config_version(config);
    match definition_version {
        Some(version) => hash_sorted([config_version.as_str(), version]),
        None => config_version,
    }
}

/// Everything that determines a step's version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepVersionInputs {
    pub code_version: Option<String>,
    pub config_version: String,
    /// `(resource name, version)` for every required resource
    pub resource_versions: Vec<(String, Option<String>)>,
    /// `(input name, version)` for every input that carries a value
    pub input_versions: Vec<(String, Option<String>)>,
}

/// Combine a step's code, config, resource and input versions.
///
/// Names prefix the resource and input versions, so swapping the upstreams
/// of two inputs changes the version while reordering the declarations does not.
pub fn resolve_step_version(inputs: &StepVersionInputs) -> Option<String> {
    let resources: Option<Vec<String>> = inputs
        .resource_versions
        .iter()
        .map(|(name, version)| version.as_ref().map(|v| format!("resource:{name}:{v}")))
        .collect();
    let upstream: Option<Vec<String>> = inputs
        .input_versions
        .iter()
        .map(|(name, version)| version.as_ref().map(|v| format!("input:{name}:{v}")))
        .collect();

    let code_version = inputs.code_version.as_deref()?;
    let (resources, upstream) = (resources?, upstream?);

    let mut parts: Vec<Option<&str>> = vec![Some(code_version), Some(inputs.config_version.as_str())];
    parts.extend(resources.iter().map(|p| Some(p.as_str())));
    parts.extend(upstream.iter().map(|p| Some(p.as_str())));
    join_and_hash(&parts)
}

/// Version of one output of a versioned step
pub fn resolve_output_version(output_name: &str, step_version: Option<&str>) -> Option<String> {
    join_and_hash(&[Some(output_name), step_version])
}

/// Version of a fan-in input: positions matter, so each branch is indexed
pub fn resolve_fan_in_version<'a, I>(versions: I) -> Option<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let indexed: Option<Vec<String>> = versions
        .into_iter()
        .enumerate()
        .map(|(index, version)| version.map(|v| format!("{index}{v}")))
        .collect();
    indexed.map(hash_sorted)
}
