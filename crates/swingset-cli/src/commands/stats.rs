//! `swingset stats` command.

use anyhow::Result;
use serde_json::json;

use crate::opts::StoreOpts;
use crate::output::print_success;

pub fn cmd_stats(opts: &StoreOpts) -> Result<()> {
    let state = opts.open_state()?;
    let mut vats = Vec::new();
    for vat in state.live_vats()? {
        let info = state.vat_info(vat)?;
        let span = state.current_span(vat)?;
        vats.push(json!({
            "id": vat.to_string(),
            "name": info.as_ref().map(|info| info.name.clone()),
            "critical": info.as_ref().is_some_and(|info| info.options.critical),
            "incarnation": span.incarnation,
            "transcript_len": span.end_pos,
            "snapshot": span.snapshot.map(|hash| hash.to_hex()),
        }));
    }
    let terminated: Vec<String> = state
        .terminated_vats()?
        .into_iter()
        .map(|vat| vat.to_string())
        .collect();
    let gc_actions: Vec<String> = state
        .gc_actions()?
        .iter()
        .map(ToString::to_string)
        .collect();
    print_success(
        opts,
        json!({
            "crank_number": state.crank_number()?,
            "activity_hash": state.activity_hash()?.to_hex(),
            "run_queue_len": state.run_queue_len()?,
            "gc_actions": gc_actions,
            "vats": vats,
            "terminated_vats": terminated,
        }),
    )
}
