use super::commands::StoreArgs;
use super::open_gate;

pub fn run_role_create(store: StoreArgs, name: String, id: Option<String>) -> anyhow::Result<()> {
    let gate = open_gate(&store)?;
    let role = gate.create_role(&name, id.as_deref())?;

    println!("Created role \"{}\" ({})", role.name, role.id);
    Ok(())
}

pub fn run_role_add_member(
    store: StoreArgs,
    role_id: String,
    principal_id: String,
) -> anyhow::Result<()> {
    let gate = open_gate(&store)?;
    gate.add_member(&role_id, &principal_id)
        .map_err(|e| anyhow::anyhow!("Failed to add {principal_id} to role {role_id}: {e}"))?;

    println!("Added {principal_id} to role {role_id}");
    Ok(())
}

pub fn run_role_remove_member(
    store: StoreArgs,
    role_id: String,
    principal_id: String,
) -> anyhow::Result<()> {
    let gate = open_gate(&store)?;

    if !gate.remove_member(&role_id, &principal_id)? {
        anyhow::bail!("{principal_id} is not a member of role {role_id}");
    }

    println!("Removed {principal_id} from role {role_id}");
    Ok(())
}
