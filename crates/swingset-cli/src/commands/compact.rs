//! `swingset compact` command.

use anyhow::Result;
use serde_json::json;

use crate::opts::StoreOpts;
use crate::output::print_success;

pub fn cmd_compact(opts: &StoreOpts) -> Result<()> {
    let store = opts.open_store()?;
    let records = store.log_records();
    store.compact()?;
    print_success(
        opts,
        json!({ "compacted_records": records, "root": store.root().display().to_string() }),
    )
}
