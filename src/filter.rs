//! Forward/drop decision for inbound events.
//!
//! The checks run in a fixed order: mute state first, then the whitelist,
//! then the blacklist. A non-empty whitelist is authoritative and the
//! blacklist is ignored even when both are configured.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::event::NormalizedEvent;

/// Filtering configuration, fixed at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterPolicy {
    /// Drop events from muted origins.
    #[serde(default = "default_filter_muted")]
    pub filter_muted: bool,

    /// Origins allowed through. Empty disables the whitelist.
    #[serde(default)]
    pub whitelist: BTreeSet<i64>,

    /// Origins never allowed through. Empty disables the blacklist.
    #[serde(default)]
    pub blacklist: BTreeSet<i64>,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            filter_muted: default_filter_muted(),
            whitelist: BTreeSet::new(),
            blacklist: BTreeSet::new(),
        }
    }
}

fn default_filter_muted() -> bool {
    true
}

impl FilterPolicy {
    /// One-line description for startup logs.
    pub fn summary(&self) -> String {
        let list = if !self.whitelist.is_empty() {
            format!("whitelist={:?}", self.whitelist)
        } else if !self.blacklist.is_empty() {
            format!("blacklist={:?}", self.blacklist)
        } else {
            "all origins".to_owned()
        };
        format!("filter_muted={} {list}", self.filter_muted)
    }
}

/// Decide whether an event passes the policy.
pub fn should_forward(event: &NormalizedEvent, policy: &FilterPolicy) -> bool {
    if policy.filter_muted && event.is_muted {
        return false;
    }
    if !policy.whitelist.is_empty() {
        return policy.whitelist.contains(&event.origin_id);
    }
    if !policy.blacklist.is_empty() {
        return !policy.blacklist.contains(&event.origin_id);
    }
    true
}
