use crate::types::EntityRef;

use super::commands::{LinkArgs, StoreArgs};
use super::open_gate;

fn endpoints(args: &LinkArgs) -> (EntityRef, EntityRef) {
    (
        EntityRef::new(&args.parent_type, &args.parent_id),
        EntityRef::new(&args.child_type, &args.child_id),
    )
}

pub fn run_link(
    store: StoreArgs,
    link: LinkArgs,
    ownership_flag: Option<bool>,
) -> anyhow::Result<()> {
    let gate = open_gate(&store)?;
    let (parent, child) = endpoints(&link);

    let link = gate.link(&parent, &child, ownership_flag)?;

    println!(
        "Linked {} under {} ({})",
        link.child(),
        link.parent(),
        if link.ownership_flag { "owned" } else { "lookup" }
    );
    Ok(())
}

pub fn run_unlink(store: StoreArgs, link: LinkArgs) -> anyhow::Result<()> {
    let gate = open_gate(&store)?;
    let (parent, child) = endpoints(&link);

    if !gate.unlink(&parent, &child)? {
        anyhow::bail!("No link from {parent} to {child}");
    }

    println!("Unlinked {child} from {parent}");
    Ok(())
}

pub fn run_unlink_entity(
    store: StoreArgs,
    entity_type: String,
    instance_id: String,
) -> anyhow::Result<()> {
    let gate = open_gate(&store)?;
    let entity = EntityRef::new(entity_type, instance_id);

    let removed = gate.unlink_entity(&entity)?;

    println!("Removed {removed} links touching {entity}");
    Ok(())
}
