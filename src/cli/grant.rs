use chrono::{DateTime, Utc};

use crate::types::{
    ChildPermissionMap, InheritanceMode, InstanceRef, Permission, PermissionGrant, Subject, Target,
};

use super::commands::{GrantTargetArgs, StoreArgs};
use super::{open_gate, parse_subject_kind};

fn subject_and_target(args: GrantTargetArgs) -> anyhow::Result<(Subject, Target)> {
    let subject = Subject {
        kind: parse_subject_kind(&args.subject_kind)?,
        id: args.subject_id,
    };
    let target = Target {
        entity_type: args.entity_type,
        instance: InstanceRef::from(args.instance_id),
    };
    Ok((subject, target))
}

fn parse_permission(value: &str) -> anyhow::Result<Permission> {
    Permission::parse(value).ok_or_else(|| anyhow::anyhow!("Invalid permission: {value}"))
}

/// Parses "task=edit,_default=0" into a child permission map.
fn parse_child_map(entries: &str) -> anyhow::Result<ChildPermissionMap> {
    entries
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| -> anyhow::Result<(String, Permission)> {
            let (child_type, level) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Invalid map entry '{entry}', expected type=level"))?;
            Ok((child_type.trim().to_string(), parse_permission(level)?))
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
pub fn run_grant_add(
    store: StoreArgs,
    target: GrantTargetArgs,
    permission: String,
    deny: bool,
    mode: String,
    map: Option<String>,
    expires_at: Option<String>,
) -> anyhow::Result<()> {
    let gate = open_gate(&store)?;
    let (subject, target) = subject_and_target(target)?;

    let mut grant = PermissionGrant::new(&subject, &target, parse_permission(&permission)?);
    grant.is_deny = deny;
    grant.inheritance_mode = InheritanceMode::parse(&mode)
        .ok_or_else(|| anyhow::anyhow!("Invalid inheritance mode: {mode}"))?;
    grant.child_permission_map = map.as_deref().map(parse_child_map).transpose()?;
    grant.expires_at = expires_at
        .as_deref()
        .map(|s| DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid --expires-at: {e}"))?;

    let grant = gate.grant(grant)?;

    println!(
        "Granted {}{} on {} to {}",
        if grant.is_deny { "deny " } else { "" },
        grant.permission,
        grant.target(),
        grant.subject()
    );

    Ok(())
}

pub fn run_revoke(store: StoreArgs, target: GrantTargetArgs) -> anyhow::Result<()> {
    let gate = open_gate(&store)?;
    let (subject, target) = subject_and_target(target)?;

    if !gate.revoke(&subject, &target)? {
        anyhow::bail!("No grant on {target} for {subject}");
    }

    println!("Revoked grant on {target} from {subject}");
    Ok(())
}

pub fn run_grant_list(
    store: StoreArgs,
    subject_kind: String,
    subject_id: String,
    entity_type: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let gate = open_gate(&store)?;
    let subject = Subject {
        kind: parse_subject_kind(&subject_kind)?,
        id: subject_id,
    };

    let grants = gate.list_grants(&subject, entity_type.as_deref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&grants)?);
        return Ok(());
    }

    if grants.is_empty() {
        println!("No grants for {subject}");
        return Ok(());
    }

    for grant in &grants {
        let mut line = format!(
            "{:<24} {:<5} {:<10} {}",
            grant.target().to_string(),
            if grant.is_deny { "deny" } else { "allow" },
            grant.permission.name(),
            grant.inheritance_mode.as_str()
        );
        if let Some(expires_at) = grant.expires_at {
            line.push_str(&format!("  expires {}", expires_at.to_rfc3339()));
        }
        println!("{line}");
    }

    Ok(())
}
