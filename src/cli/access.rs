use serde::Serialize;

use crate::types::Permission;

use super::commands::StoreArgs;
use super::open_gate;

#[derive(Serialize)]
struct CheckOutput<'a> {
    principal_id: &'a str,
    entity_type: &'a str,
    instance_id: &'a str,
    permission: Permission,
    allowed: bool,
    level: i8,
}

/// Prints `allowed` or `denied`. A denial is an answer, not a failure.
pub fn run_check(
    store: StoreArgs,
    principal_id: String,
    entity_type: String,
    instance_id: String,
    permission: String,
    json: bool,
) -> anyhow::Result<()> {
    let required = Permission::parse(&permission)
        .ok_or_else(|| anyhow::anyhow!("Invalid permission: {permission}"))?;
    let gate = open_gate(&store)?;

    let decision = gate.resolve(&principal_id, &entity_type, &instance_id)?;
    let allowed = decision.allows(required);

    if json {
        let output = CheckOutput {
            principal_id: &principal_id,
            entity_type: &entity_type,
            instance_id: &instance_id,
            permission: required,
            allowed,
            level: decision.as_level(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", if allowed { "allowed" } else { "denied" });
    }

    Ok(())
}

pub fn run_accessible(
    store: StoreArgs,
    principal_id: String,
    entity_type: String,
    permission: String,
    json: bool,
) -> anyhow::Result<()> {
    let required = Permission::parse(&permission)
        .ok_or_else(|| anyhow::anyhow!("Invalid permission: {permission}"))?;
    let gate = open_gate(&store)?;

    let accessible = gate.accessible_ids(&principal_id, &entity_type, required)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&accessible)?);
        return Ok(());
    }

    if accessible.type_level {
        println!("all {entity_type} instances");
        for id in &accessible.denied_ids {
            println!("except {id}");
        }
    } else {
        for id in &accessible.ids {
            println!("{id}");
        }
    }

    Ok(())
}
