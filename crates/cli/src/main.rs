use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value as Json;
use std::path::PathBuf;
use tracing::info;

use cfnroll_cfn as cfn;
use cfnroll_cfn::{CfnResource, CfnTemplate};
use cfnroll_core::Lifecycle;

#[derive(Parser, Debug)]
#[command(author, version, about="cfnroll — CloudFormation deploy CLI with lifecycle hooks")]
struct Cli {
    /// Stack config file (YAML)
    #[arg(short, long, global = true, default_value="stack.yml")]
    file: PathBuf,

    /// Output directory
    #[arg(short, long, default_value="out", global = true)]
    out: PathBuf,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)] enum Cmd {
    /// Write the compiled template without deploying
    Package,
    /// Package and deploy the stack
    Deploy,
    /// Delete the stack
    Delete,
}

#[derive(Deserialize)]
struct Stack {
    project: Option<String>,
    provider: Providers,
    #[serde(default)]
    resources: Vec<StackResource>,
}
#[derive(Deserialize)] struct Providers {
    #[serde(default)] aws: Option<AwsProvider>,
}
#[derive(Deserialize)]
struct AwsProvider {
    #[serde(default)]
    region: Option<String>,
    // Kept as raw JSON; cfnroll-policy does its own normalization/validation.
    #[serde(rename="managedPolicyArns", default)]
    managed_policy_arns: Option<Json>,
}
#[derive(Deserialize)]
struct StackResource {
    name: String,
    #[serde(rename="type")]
    type_name: String,
    #[serde(default)]
    properties: serde_json::Map<String, Json>,
}

struct DeployContext {
    stack_name: String,
    region: Option<String>,
    managed_policy_arns: Option<Json>,
    template: CfnTemplate,
    out: PathBuf,
}

fn ensure_cfn_type(type_name: &str) -> Result<()> {
    let segments: Vec<&str> = type_name.split("::").collect();
    if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) {
        anyhow::bail!("resource type '{}' is not a valid CloudFormation type", type_name);
    }
    Ok(())
}

fn compile_template(cfg: &Stack) -> Result<CfnTemplate> {
    let mut tpl = CfnTemplate::new(Some("cfnroll generated template".to_string()));
    for r in &cfg.resources {
        ensure_cfn_type(&r.type_name)?;
        let prev = tpl.resources.insert(r.name.clone(), CfnResource {
            type_name: r.type_name.clone(),
            properties: r.properties.clone(),
        });
        if prev.is_some() {
            anyhow::bail!("duplicate resource name '{}'", r.name);
        }
    }
    Ok(tpl)
}

fn build_lifecycle() -> Result<Lifecycle<DeployContext>> {
    let mut lc = Lifecycle::new(["package", "deploy"]);
    lc.register("package", |ctx: &mut DeployContext| {
        let path = cfn::write_template(&ctx.template, &ctx.out)?;
        info!("wrote {}", path.display());
        Ok(())
    })?;
    lc.register("before:deploy", |ctx: &mut DeployContext| {
        let mut log = |line: &str| info!("{line}");
        cfnroll_policy::attach(
            ctx.managed_policy_arns.as_ref(),
            Some(&mut ctx.template.resources),
            &mut log,
        )?;
        Ok(())
    })?;
    lc.register("deploy", |ctx: &mut DeployContext| {
        // Rewrite so the deployed body includes before:deploy mutations.
        let path = cfn::write_template(&ctx.template, &ctx.out)?;
        cfn::deploy_stack(&ctx.stack_name, &path, ctx.region.as_deref())
    })?;
    Ok(lc)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().json().init();
    let cli = Cli::parse();

    let cfg: Stack = serde_yaml::from_slice(
        &std::fs::read(&cli.file).with_context(|| format!("read {}", cli.file.display()))?,
    )?;
    let stack_name = cfg.project.clone().unwrap_or_else(|| "cfnroll-stack".to_string());
    let region = cfg.provider.aws.as_ref().and_then(|p| p.region.clone());

    match cli.cmd {
        Cmd::Delete => cfn::delete_stack(&stack_name, region.as_deref()),
        cmd => {
            let template = compile_template(&cfg)?;
            let mut ctx = DeployContext {
                stack_name,
                region,
                managed_policy_arns: cfg
                    .provider
                    .aws
                    .as_ref()
                    .and_then(|p| p.managed_policy_arns.clone()),
                template,
                out: cli.out,
            };
            let mut lc = build_lifecycle()?;
            match cmd {
                Cmd::Package => lc.run("package", &mut ctx),
                Cmd::Deploy => lc.run_all(&mut ctx),
                Cmd::Delete => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STACK_YML: &str = r#"
project: demo
provider:
  aws:
    region: us-east-1
    managedPolicyArns:
      - arn:aws:iam::123456789012:policy/TeamBoundary
resources:
  - name: AppRole
    type: AWS::IAM::Role
    properties:
      RoleName: app-role
"#;

    #[test]
    fn stack_config_parses_arn_list() {
        let cfg: Stack = serde_yaml::from_str(STACK_YML).unwrap();
        let aws = cfg.provider.aws.unwrap();
        assert_eq!(aws.region.as_deref(), Some("us-east-1"));
        assert_eq!(
            aws.managed_policy_arns.unwrap(),
            json!(["arn:aws:iam::123456789012:policy/TeamBoundary"])
        );
    }

    #[test]
    fn stack_config_parses_single_arn_string() {
        let cfg: Stack = serde_yaml::from_str(
            "provider:\n  aws:\n    managedPolicyArns: arn:aws:iam::1:policy/P\n",
        )
        .unwrap();
        assert_eq!(
            cfg.provider.aws.unwrap().managed_policy_arns.unwrap(),
            json!("arn:aws:iam::1:policy/P")
        );
    }

    #[test]
    fn compile_template_maps_resources_by_name() {
        let cfg: Stack = serde_yaml::from_str(STACK_YML).unwrap();
        let tpl = compile_template(&cfg).unwrap();
        let role = &tpl.resources["AppRole"];
        assert_eq!(role.type_name, "AWS::IAM::Role");
        assert_eq!(role.properties["RoleName"], json!("app-role"));
    }

    #[test]
    fn compile_template_rejects_duplicate_names() {
        let cfg: Stack = serde_yaml::from_str(
            "provider: {}\nresources:\n  - name: A\n    type: AWS::SNS::Topic\n  - name: A\n    type: AWS::SNS::Topic\n",
        )
        .unwrap();
        assert!(compile_template(&cfg).is_err());
    }

    #[test]
    fn ensure_cfn_type_rejects_malformed_types() {
        assert!(ensure_cfn_type("AWS::IAM::Role").is_ok());
        assert!(ensure_cfn_type("Custom::Thing").is_ok());
        assert!(ensure_cfn_type("aws_iam_role").is_err());
        assert!(ensure_cfn_type("AWS::").is_err());
    }

    #[test]
    fn deploy_lifecycle_attaches_policies_before_deploy_spot() {
        let cfg: Stack = serde_yaml::from_str(STACK_YML).unwrap();
        let mut ctx = DeployContext {
            stack_name: "demo".into(),
            region: None,
            managed_policy_arns: cfg.provider.aws.as_ref().and_then(|p| p.managed_policy_arns.clone()),
            template: compile_template(&cfg).unwrap(),
            out: PathBuf::from("out"),
        };
        // Drive only the hook under test; package/deploy spots shell out.
        let mut lc = build_lifecycle().unwrap();
        lc.run_spot("before:deploy", &mut ctx).unwrap();
        let arns = ctx.template.resources["AppRole"].properties["ManagedPolicyArns"].clone();
        assert_eq!(arns, json!(["arn:aws:iam::123456789012:policy/TeamBoundary"]));
    }
}
