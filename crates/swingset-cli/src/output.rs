//! Shared output helpers for human and JSON modes.
//!
//! JSON mode wraps results in `{ "data": ... }`; human mode prints strings as-is and
//! anything else as pretty JSON.

use anyhow::Result;
use serde_cbor::Value as Cbor;
use serde_json::{Map, Number, Value, json};

use crate::opts::StoreOpts;

pub fn print_success(opts: &StoreOpts, data: Value) -> Result<()> {
    if opts.pretty {
        println!("{}", serde_json::to_string_pretty(&json!({ "data": data }))?);
    } else if opts.json {
        println!("{}", serde_json::to_string(&json!({ "data": data }))?);
    } else {
        match data {
            Value::String(s) => println!("{s}"),
            other => println!("{}", serde_json::to_string_pretty(&other)?),
        }
    }
    Ok(())
}

/// Render a decoded CBOR value as JSON. Byte strings become `{"bytes": <hex>}`.
pub fn cbor_to_json(value: &Cbor) -> Value {
    match value {
        Cbor::Null => Value::Null,
        Cbor::Bool(b) => Value::Bool(*b),
        Cbor::Integer(i) => match i64::try_from(*i) {
            Ok(small) => Value::Number(small.into()),
            Err(_) => Value::String(i.to_string()),
        },
        Cbor::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Cbor::Bytes(bytes) => json!({ "bytes": hex::encode(bytes) }),
        Cbor::Text(text) => Value::String(text.clone()),
        Cbor::Array(items) => Value::Array(items.iter().map(cbor_to_json).collect()),
        Cbor::Map(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                let key = match key {
                    Cbor::Text(text) => text.clone(),
                    other => cbor_to_json(other).to_string(),
                };
                map.insert(key, cbor_to_json(value));
            }
            Value::Object(map)
        }
        Cbor::Tag(_, inner) => cbor_to_json(inner),
        _ => Value::Null,
    }
}
