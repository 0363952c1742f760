use std::sync::Arc;

use anyhow::Error;

use plakar_store::Namespace;

use crate::context::AppContext;

/// Byte-exact copy of a repository into a fresh store.
///
/// Objects are copied verbatim (configuration included), so the clone
/// shares the source's repository id, keys and packfile layout; no
/// unlock is required.
pub fn run(ctx: &Arc<AppContext>, source: &str, target: &str) -> Result<i32, Error> {
    let (source_store, config) = ctx.registry.open(source)?;
    let target_store = ctx.registry.create(target, &config)?;

    let mut objects = 0u64;
    for ns in [Namespace::Packfiles, Namespace::States] {
        for mac in source_store.list(ns)? {
            ctx.cancel.check()?;
            let data = source_store.get(ns, &mac)?;
            target_store.put(ns, &mac, &mut &data[..])?;
            objects += 1;
        }
    }

    target_store.close()?;
    source_store.close()?;
    ctx.println(&format!("cloned {} objects to {}", objects, target));
    Ok(0)
}
