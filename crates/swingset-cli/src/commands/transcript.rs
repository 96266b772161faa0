//! `swingset transcript` command.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use swingset_kernel::VatId;

use crate::opts::StoreOpts;
use crate::output::print_success;

#[derive(Args, Debug)]
pub struct TranscriptArgs {
    /// Vat id (e.g. `v1`) or vat name
    pub vat: String,
}

pub fn cmd_transcript(opts: &StoreOpts, args: &TranscriptArgs) -> Result<()> {
    let state = opts.open_state()?;
    let vat = match args.vat.parse::<VatId>() {
        Ok(vat) => vat,
        Err(_) => state
            .vat_id_for_name(&args.vat)?
            .with_context(|| format!("no vat named '{}'", args.vat))?,
    };
    if !state.vat_is_alive(vat)? {
        anyhow::bail!("{vat} is not a live vat");
    }
    let span = state.current_span(vat)?;
    let entries = state.transcript_entries(vat)?;
    if !(opts.json || opts.pretty) {
        println!(
            "{vat} span {} (incarnation {}), entries {}..{}",
            span.span_id, span.incarnation, span.start_pos, span.end_pos
        );
        for (pos, entry) in (span.start_pos..).zip(&entries) {
            println!(
                "{pos}: {} ({} syscalls)",
                entry.delivery.kind(),
                entry.syscalls.len()
            );
        }
        return Ok(());
    }
    print_success(
        opts,
        json!({
            "vat": vat.to_string(),
            "span": span,
            "entries": entries,
        }),
    )
}
