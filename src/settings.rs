//! src/settings.rs
//!
//! The on-chain settings cache Gossip consults for the default message TTL.
//! The real validator resolves settings against a particular state root;
//! that resolution is the caller's concern, so this trait only asks for a
//! key/default pair (§6: "get_setting(key, state_root_fn, default)").

/// Key under which the gossip message TTL default is published.
pub const GOSSIP_TIME_TO_LIVE_KEY: &str = "sawtooth.gossip.time_to_live";

/// Default TTL used when the setting is absent or unparseable.
pub const DEFAULT_TIME_TO_LIVE: u32 = 3;

pub trait SettingsCache: Send + Sync {
    /// Look up `key`, falling back to `default` if unset.
    fn get_setting(&self, key: &str, default: &str) -> String;

    /// Convenience wrapper used by `Gossip` for the TTL default, coercing the
    /// stored value to an integer and falling back to [`DEFAULT_TIME_TO_LIVE`]
    /// if it isn't one.
    fn gossip_time_to_live(&self) -> u32 {
        self.get_setting(GOSSIP_TIME_TO_LIVE_KEY, &DEFAULT_TIME_TO_LIVE.to_string())
            .parse()
            .unwrap_or(DEFAULT_TIME_TO_LIVE)
    }
}

/// An in-memory `SettingsCache` backed by a static default, for nodes that
/// don't yet have a settings view wired in, and for tests.
#[derive(Debug, Default)]
pub struct StaticSettingsCache {
    time_to_live: Option<u32>,
}

impl StaticSettingsCache {
    pub fn new(time_to_live: u32) -> Self {
        Self {
            time_to_live: Some(time_to_live),
        }
    }
}

impl SettingsCache for StaticSettingsCache {
    fn get_setting(&self, key: &str, default: &str) -> String {
        if key == GOSSIP_TIME_TO_LIVE_KEY {
            if let Some(ttl) = self.time_to_live {
                return ttl.to_string();
            }
        }
        default.to_string()
    }
}
