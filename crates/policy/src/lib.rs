//! Managed-policy attacher: merges configured `managedPolicyArns` into every
//! IAM role of a compiled template before deploy.

use cfnroll_cfn::CfnResource;
use regex::Regex;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use thiserror::Error;

pub const ROLE_TYPE: &str = "AWS::IAM::Role";
pub const POLICY_ATTR: &str = "ManagedPolicyArns";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("managedPolicyArns must be an array")]
    NotAnArray,
    #[error("\"{0}\" is not a valid policy ARN.")]
    InvalidArn(String),
}

/// The raw `managedPolicyArns` configuration value, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedPolicies {
    Single(String),
    List(Vec<String>),
}

impl ManagedPolicies {
    /// Normalize the raw config value. A bare string becomes a one-element
    /// list; an array is taken in order, duplicates kept. Anything else is a
    /// configuration error.
    pub fn from_value(value: &Json) -> Result<Self, ConfigError> {
        match value {
            Json::String(s) => Ok(Self::Single(s.clone())),
            Json::Array(items) => {
                let mut arns = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Json::String(s) => arns.push(s.clone()),
                        other => return Err(ConfigError::InvalidArn(other.to_string())),
                    }
                }
                Ok(Self::List(arns))
            }
            _ => Err(ConfigError::NotAnArray),
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::Single(arn) => vec![arn],
            Self::List(arns) => arns,
        }
    }
}

fn arn_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^arn:aws:iam::\d+:policy/.+").unwrap())
}

/// Check every ARN against `arn:aws:iam::<account>:policy/<name>`.
/// The first offender fails, in sequence order.
pub fn validate(arns: &[String]) -> Result<(), ConfigError> {
    for arn in arns {
        if !arn_pattern().is_match(arn) {
            return Err(ConfigError::InvalidArn(arn.clone()));
        }
    }
    Ok(())
}

/// What happened to one configured ARN during a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeEvent {
    /// No list existed; the ARN is being set fresh.
    Set(String),
    /// Appended to an existing list.
    Add(String),
    /// Already present, left alone.
    Skip(String),
}

/// Merge configured ARNs into an existing list, append-after: pre-existing
/// entries keep their order, new ARNs go to the back in configured order,
/// exact-string duplicates are skipped.
pub fn merge_policies(
    configured: &[String],
    existing: Option<&[String]>,
) -> (Vec<String>, Vec<MergeEvent>) {
    match existing {
        None => {
            let events = configured.iter().cloned().map(MergeEvent::Set).collect();
            (configured.to_vec(), events)
        }
        Some(current) => {
            let mut merged = current.to_vec();
            let mut events = Vec::with_capacity(configured.len());
            for arn in configured {
                if merged.iter().any(|have| have == arn) {
                    events.push(MergeEvent::Skip(arn.clone()));
                } else {
                    merged.push(arn.clone());
                    events.push(MergeEvent::Add(arn.clone()));
                }
            }
            (merged, events)
        }
    }
}

fn string_entries(list: &[Json]) -> Vec<String> {
    list.iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Apply the configured managed policies to every IAM role in `resources`.
///
/// Absent config or an absent/empty resource map is a silent no-op. The
/// config is validated in full before any resource is touched; a
/// `ConfigError` therefore means nothing was mutated. Log lines go to the
/// injected sink in a deterministic order (resources iterate in logical-id
/// order).
pub fn attach(
    config: Option<&Json>,
    resources: Option<&mut BTreeMap<String, CfnResource>>,
    log: &mut dyn FnMut(&str),
) -> Result<(), ConfigError> {
    let (Some(config), Some(resources)) = (config, resources) else { return Ok(()) };
    if resources.is_empty() {
        return Ok(());
    }

    log("Adding managed policies...");
    let configured = ManagedPolicies::from_value(config)?.into_vec();
    validate(&configured)?;

    log("Searching for roles...");
    for (logical_id, resource) in resources.iter_mut() {
        if resource.type_name != ROLE_TYPE {
            continue;
        }
        let role_name = resource
            .properties
            .get("RoleName")
            .and_then(Json::as_str)
            .unwrap_or(logical_id)
            .to_string();

        let existing = resource
            .properties
            .get(POLICY_ATTR)
            .and_then(Json::as_array)
            .map(|list| string_entries(list));

        match existing {
            None => {
                let (merged, events) = merge_policies(&configured, None);
                for event in &events {
                    if let MergeEvent::Set(arn) = event {
                        log(&format!("Setting {arn} as ManagedPolicyArn for {role_name}."));
                    }
                }
                resource.properties.insert(
                    POLICY_ATTR.to_string(),
                    Json::Array(merged.into_iter().map(Json::String).collect()),
                );
            }
            Some(existing) => {
                let (_, events) = merge_policies(&configured, Some(&existing));
                for event in &events {
                    match event {
                        MergeEvent::Set(_) => {}
                        MergeEvent::Add(arn) => log(&format!(
                            "Adding {arn} to existing ManagedPolicyArns policies for {role_name}."
                        )),
                        MergeEvent::Skip(arn) => log(&format!(
                            "{role_name} role already has policy {arn} applied, skipping."
                        )),
                    }
                }
                // Append only; non-string entries (intrinsics) stay in place.
                if let Some(list) = resource
                    .properties
                    .get_mut(POLICY_ATTR)
                    .and_then(Json::as_array_mut)
                {
                    for event in events {
                        if let MergeEvent::Add(arn) = event {
                            list.push(Json::String(arn));
                        }
                    }
                }
            }
        }
    }
    log("Managed policy done.");
    Ok(())
}
