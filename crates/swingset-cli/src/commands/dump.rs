//! `swingset dump` command.

use anyhow::Result;
use clap::Args;
use serde_json::{Map, Value, json};
use swingset_cbor::from_cbor;
use swingset_store::{KvStore, prefix_end};

use crate::opts::StoreOpts;
use crate::output::{cbor_to_json, print_success};

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Only keys starting with this prefix
    #[arg(long, default_value = "")]
    pub prefix: String,
}

pub fn cmd_dump(opts: &StoreOpts, args: &DumpArgs) -> Result<()> {
    let store = opts.open_store()?;
    let entries = if args.prefix.is_empty() {
        store.range("", None)?
    } else {
        store.range(&args.prefix, prefix_end(&args.prefix).as_deref())?
    };
    let mut rows = Map::new();
    for (key, bytes) in entries {
        // Values are canonical CBOR; anything else is shown raw.
        let value = match from_cbor::<serde_cbor::Value>(&bytes) {
            Ok(value) => cbor_to_json(&value),
            Err(_) => json!({ "raw": hex::encode(&bytes) }),
        };
        rows.insert(key, value);
    }
    if opts.json || opts.pretty {
        return print_success(opts, Value::Object(rows));
    }
    for (key, value) in rows {
        println!("{key} = {value}");
    }
    Ok(())
}
