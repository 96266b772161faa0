use std::env;
use std::str::FromStr;

/// Kernel tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Deliveries in a vat's first span before its first heap snapshot.
    pub snapshot_initial: u64,
    /// Deliveries per span after that.
    pub snapshot_interval: u64,
    /// Deliveries between `bringOutYourDead` reaps; `None` never reaps.
    pub reap_interval: Option<u64>,
    /// Keep superseded transcript spans and their snapshots instead of deleting them.
    pub keep_retired_spans: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            snapshot_initial: 3,
            snapshot_interval: 200,
            reap_interval: None,
            keep_retired_spans: false,
        }
    }
}

impl KernelConfig {
    /// Defaults overridden by `SWINGSET_SNAPSHOT_INITIAL`, `SWINGSET_SNAPSHOT_INTERVAL`,
    /// `SWINGSET_REAP_INTERVAL` and `SWINGSET_KEEP_RETIRED_SPANS`. Unparseable values are
    /// ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("SWINGSET_SNAPSHOT_INITIAL") {
            config.snapshot_initial = v;
        }
        if let Some(v) = env_parse("SWINGSET_SNAPSHOT_INTERVAL") {
            config.snapshot_interval = v;
        }
        if let Some(v) = env_parse::<u64>("SWINGSET_REAP_INTERVAL") {
            config.reap_interval = (v > 0).then_some(v);
        }
        if let Some(v) = env_parse("SWINGSET_KEEP_RETIRED_SPANS") {
            config.keep_retired_spans = v;
        }
        config
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}
