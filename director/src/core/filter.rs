use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::RwLock;
use tracing::debug;

/// Why a server is (or is not) excluded from routing. Variants are declared
/// strongest-first; `combine` walks them in this order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterState {
    PermFiltered,
    ShutdownFiltered,
    ServerFiltered,
    TopoFiltered,
    TempFiltered,
    /// Positive override: suppresses topology and temporary filtering, loses
    /// to the permanent states above it.
    TempAllowed,
}

impl Display for FilterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FilterState::PermFiltered => "perm_filtered",
            FilterState::ShutdownFiltered => "shutdown_filtered",
            FilterState::ServerFiltered => "server_filtered",
            FilterState::TopoFiltered => "topo_filtered",
            FilterState::TempFiltered => "temp_filtered",
            FilterState::TempAllowed => "temp_allowed",
        };
        write!(f, "{s}")
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterSource {
    Config,
    Topology,
    Downtime,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterDecision {
    pub excluded: bool,
    pub reason: Option<FilterState>,
}

impl FilterDecision {
    fn clear() -> Self {
        FilterDecision {
            excluded: false,
            reason: None,
        }
    }
}

/// Per-server allow/deny state. A server may carry entries from several
/// sources at once; removing a strong entry re-exposes whatever weaker entry
/// remains underneath it.
pub struct FilterRegistry {
    entries: RwLock<HashMap<String, BTreeMap<FilterState, FilterSource>>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        FilterRegistry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Seed permanent filters from static configuration.
    pub fn seed_permanent(&self, names: &[String]) {
        for name in names {
            self.set(name, FilterState::PermFiltered, FilterSource::Config);
        }
    }

    pub fn set(&self, name: &str, state: FilterState, source: FilterSource) {
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(name.to_string())
            .or_default()
            .insert(state, source);
    }

    /// Remove entries for a server. With `only_if_source`, entries recorded
    /// by other sources survive.
    pub fn unset(&self, name: &str, only_if_source: Option<FilterSource>) {
        let mut entries = self.entries.write().unwrap();
        let now_empty = match entries.get_mut(name) {
            Some(states) => {
                match only_if_source {
                    Some(source) => states.retain(|_, s| *s != source),
                    None => states.clear(),
                }
                states.is_empty()
            }
            None => false,
        };
        if now_empty {
            entries.remove(name);
        }
    }

    /// Wholesale purge of one source's entries. The topology importer calls
    /// this before re-applying each snapshot, making the feed the single
    /// source of truth for its own entries.
    pub fn clear_source(&self, source: FilterSource) {
        let mut entries = self.entries.write().unwrap();
        entries.retain(|_, states| {
            states.retain(|_, s| *s != source);
            !states.is_empty()
        });
    }

    /// Combine all entries for a server into a single routing decision using
    /// the fixed precedence. Depends only on the current entry set.
    pub fn combine(&self, name: &str) -> FilterDecision {
        let entries = self.entries.read().unwrap();
        let Some(states) = entries.get(name) else {
            return FilterDecision::clear();
        };

        for state in [
            FilterState::PermFiltered,
            FilterState::ShutdownFiltered,
            FilterState::ServerFiltered,
        ] {
            if states.contains_key(&state) {
                return FilterDecision {
                    excluded: true,
                    reason: Some(state),
                };
            }
        }

        if states.contains_key(&FilterState::TempAllowed) {
            debug!(server = name, "temp_allowed override suppresses filtering");
            return FilterDecision {
                excluded: false,
                reason: Some(FilterState::TempAllowed),
            };
        }

        for state in [FilterState::TopoFiltered, FilterState::TempFiltered] {
            if states.contains_key(&state) {
                return FilterDecision {
                    excluded: true,
                    reason: Some(state),
                };
            }
        }

        FilterDecision::clear()
    }

    /// Snapshot for metrics and the servers endpoint.
    pub fn list(&self) -> Vec<(String, Vec<(FilterState, FilterSource)>)> {
        let entries = self.entries.read().unwrap();
        let mut out: Vec<_> = entries
            .iter()
            .map(|(name, states)| {
                (
                    name.clone(),
                    states.iter().map(|(st, src)| (*st, *src)).collect(),
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_entry_means_included() {
        let reg = FilterRegistry::new();
        assert_eq!(reg.combine("srv"), FilterDecision::clear());
    }

    #[test]
    fn precedence_strongest_wins() {
        let reg = FilterRegistry::new();
        reg.set("srv", FilterState::TempFiltered, FilterSource::Downtime);
        reg.set("srv", FilterState::TopoFiltered, FilterSource::Topology);
        reg.set("srv", FilterState::PermFiltered, FilterSource::Config);

        let d = reg.combine("srv");
        assert!(d.excluded);
        assert_eq!(d.reason, Some(FilterState::PermFiltered));
    }

    #[test]
    fn temp_allowed_suppresses_topology_but_not_permanent() {
        let reg = FilterRegistry::new();
        reg.set("srv", FilterState::TopoFiltered, FilterSource::Topology);
        reg.set("srv", FilterState::TempAllowed, FilterSource::Config);

        let d = reg.combine("srv");
        assert!(!d.excluded);
        assert_eq!(d.reason, Some(FilterState::TempAllowed));

        reg.set("srv", FilterState::PermFiltered, FilterSource::Config);
        let d = reg.combine("srv");
        assert!(d.excluded);
        assert_eq!(d.reason, Some(FilterState::PermFiltered));
    }

    #[test]
    fn clearing_permanent_reexposes_topology_entry() {
        let reg = FilterRegistry::new();
        reg.set("server-A", FilterState::PermFiltered, FilterSource::Config);
        reg.set("server-A", FilterState::TopoFiltered, FilterSource::Topology);

        let d = reg.combine("server-A");
        assert_eq!(d.reason, Some(FilterState::PermFiltered));

        reg.unset("server-A", Some(FilterSource::Config));
        let d = reg.combine("server-A");
        assert!(d.excluded);
        assert_eq!(d.reason, Some(FilterState::TopoFiltered));
    }

    #[test]
    fn clear_source_preserves_other_sources() {
        let reg = FilterRegistry::new();
        reg.set("a", FilterState::TopoFiltered, FilterSource::Topology);
        reg.set("b", FilterState::TopoFiltered, FilterSource::Topology);
        reg.set("b", FilterState::TempFiltered, FilterSource::Downtime);

        reg.clear_source(FilterSource::Topology);
        assert!(!reg.combine("a").excluded);
        let d = reg.combine("b");
        assert!(d.excluded);
        assert_eq!(d.reason, Some(FilterState::TempFiltered));
        assert_eq!(reg.len(), 1);
    }
}
