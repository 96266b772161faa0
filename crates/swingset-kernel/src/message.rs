use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::refs::{KernelRef, VatRef};

/// Serialized data plus the references it carries. `body` is a smallcaps string
/// (`#` followed by JSON) whose `$N` markers index into `slots`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData<R> {
    pub body: String,
    pub slots: Vec<R>,
}

pub type KernelCapData = CapData<KernelRef>;
pub type VatCapData = CapData<VatRef>;

impl<R> CapData<R> {
    pub fn new(body: impl Into<String>, slots: Vec<R>) -> Self {
        Self {
            body: body.into(),
            slots,
        }
    }

    /// Plain data with no slots.
    pub fn data(value: &Value) -> Self {
        Self::new(format!("#{value}"), Vec::new())
    }

    /// Method name and argument list for a message, e.g. `#["foo",[1]]`.
    pub fn methargs(method: &str, args: Vec<Value>, slots: Vec<R>) -> Self {
        Self::new(format!("#{}", json!([method, args])), slots)
    }

    /// A bare reference to `slot`, as used to fulfill a promise to an object.
    pub fn reference(slot: R, iface: &str) -> Self {
        Self::new(format!("#{}", json!(format!("$0.Alleged: {iface}"))), vec![slot])
    }

    /// An error record, which is how the kernel phrases rejections it originates.
    pub fn error(message: &str) -> Self {
        Self::data(&json!({"#error": message, "name": "Error"}))
    }

    pub fn map_slots<T, E>(&self, f: impl FnMut(&R) -> Result<T, E>) -> Result<CapData<T>, E> {
        Ok(CapData {
            body: self.body.clone(),
            slots: self.slots.iter().map(f).collect::<Result<_, _>>()?,
        })
    }

    fn json_body(&self) -> Option<Value> {
        serde_json::from_str(self.body.strip_prefix('#')?).ok()
    }

    /// The method name of a methargs body.
    pub fn method(&self) -> Option<String> {
        match self.json_body()? {
            Value::Array(items) => items.first()?.as_str().map(str::to_string),
            _ => None,
        }
    }

    /// If this data is exactly one reference, that reference.
    pub fn as_reference(&self) -> Option<&R> {
        let [slot] = self.slots.as_slice() else {
            return None;
        };
        match self.json_body()? {
            Value::String(text) if text == "$0" || text.starts_with("$0.") => Some(slot),
            _ => None,
        }
    }
}

/// A message: method arguments plus an optional result promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<R> {
    pub methargs: CapData<R>,
    pub result: Option<R>,
}

pub type KernelMessage = Message<KernelRef>;
pub type VatMessage = Message<VatRef>;

impl<R> Message<R> {
    pub fn new(methargs: CapData<R>, result: Option<R>) -> Self {
        Self { methargs, result }
    }
}

impl KernelMessage {
    /// Every kref this message holds: result first, then argument slots.
    pub fn krefs(&self) -> impl Iterator<Item = KernelRef> + '_ {
        self.result.iter().chain(self.methargs.slots.iter()).copied()
    }
}
