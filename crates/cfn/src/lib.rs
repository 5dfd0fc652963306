
use anyhow::{Context, Result};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// One entry of the compiled template's `Resources` map.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CfnResource {
    #[serde(rename="Type")]
    pub type_name: String,
    #[serde(rename="Properties", default)]
    pub properties: serde_json::Map<String, Json>,
}

/// Compiled CloudFormation template. Resources are keyed by logical id;
/// BTreeMap keeps iteration (and therefore hook log output) deterministic.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CfnTemplate {
    #[serde(rename="AWSTemplateFormatVersion")] pub version: Option<String>,
    #[serde(rename="Description")] pub description: Option<String>,
    #[serde(rename="Resources")] pub resources: BTreeMap<String, CfnResource>,
}

impl CfnTemplate {
    pub fn new(description: Option<String>) -> Self {
        Self {
            version: Some("2010-09-09".to_string()),
            description,
            resources: BTreeMap::new(),
        }
    }
}

/// Write the template as `template.json` under `out`, returning the path.
pub fn write_template(tpl: &CfnTemplate, out: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(out)?;
    let path = out.join("template.json");
    std::fs::write(&path, serde_json::to_string_pretty(tpl)?)?;
    Ok(path)
}

fn aws() -> Result<PathBuf> {
    which::which("aws").context("aws cli not found in PATH")
}

pub fn deploy_stack(stack_name: &str, template_path: &Path, region: Option<&str>) -> Result<()> {
    let mut cmd = Command::new(aws()?);
    cmd.arg("cloudformation").arg("deploy")
        .arg("--stack-name").arg(stack_name)
        .arg("--template-file").arg(template_path)
        .arg("--no-fail-on-empty-changeset")
        .arg("--capabilities").arg("CAPABILITY_NAMED_IAM");
    if let Some(r) = region { cmd.arg("--region").arg(r); }
    let st = cmd.status().context("spawn aws cloudformation deploy")?;
    if !st.success() { anyhow::bail!("cloudformation deploy failed") }
    Ok(())
}

pub fn delete_stack(stack_name: &str, region: Option<&str>) -> Result<()> {
    let mut cmd = Command::new(aws()?);
    cmd.arg("cloudformation").arg("delete-stack")
        .arg("--stack-name").arg(stack_name);
    if let Some(r) = region { cmd.arg("--region").arg(r); }
    let st = cmd.status().context("aws cloudformation delete-stack")?;
    if !st.success() { anyhow::bail!("cloudformation delete-stack failed") }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_serializes_with_cfn_casing() {
        let mut tpl = CfnTemplate::new(Some("test".into()));
        tpl.resources.insert("AppRole".into(), CfnResource {
            type_name: "AWS::IAM::Role".into(),
            properties: json!({"RoleName": "app-role"}).as_object().unwrap().clone(),
        });
        let v = serde_json::to_value(&tpl).unwrap();
        assert_eq!(v["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(v["Resources"]["AppRole"]["Type"], "AWS::IAM::Role");
        assert_eq!(v["Resources"]["AppRole"]["Properties"]["RoleName"], "app-role");
    }

    #[test]
    fn resource_deserializes_without_properties() {
        let r: CfnResource = serde_json::from_value(json!({"Type": "AWS::SNS::Topic"})).unwrap();
        assert_eq!(r.type_name, "AWS::SNS::Topic");
        assert!(r.properties.is_empty());
    }

    #[test]
    fn write_template_creates_out_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("out");
        let tpl = CfnTemplate::new(None);
        let path = write_template(&tpl, &out).unwrap();
        assert_eq!(path, out.join("template.json"));
        let body: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(body["Resources"].as_object().unwrap().is_empty());
    }
}
