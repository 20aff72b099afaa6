//! On-disk launch configuration for a `meshkv` node plus the interactive
//! shell's own display preferences. Loaded via `confy` from the path given
//! with `--config`, falling back to its `Default` when the file is absent.

use std::collections::BTreeMap;

use meshkv::config::CacheConfig;
use meshkv::topology::NodeId;
use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_PROMPT: &str = "meshkv";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    /// This node's id within the cluster.
    pub node_id: NodeId,

    /// Address this node listens for peer traffic on.
    pub listen_addr: String,

    /// Known peers to dial, keyed by node id. Does not need to list every
    /// cluster member up front — `rebalance` only needs reachability for
    /// whichever nodes are actually suppliers for the current exchange.
    pub peers: BTreeMap<NodeId, String>,

    /// Cache tuning: partitions, backups, timeouts, eviction budgets, etc.
    pub cache: CacheConfig,

    pub prompt: Option<String>,

    /// Show elapsed time after executing a command. Only meaningful in an
    /// interactive session.
    pub show_stats: Option<bool>,

    /// Multi-line input mode, default true.
    pub multi_line: Option<bool>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            node_id: 1,
            listen_addr: "127.0.0.1:7070".to_string(),
            peers: BTreeMap::new(),
            cache: CacheConfig::default(),
            prompt: Some(DEFAULT_PROMPT.to_string()),
            show_stats: Some(false),
            multi_line: Some(true),
        }
    }
}

impl ConfigLoad {
    pub fn terminal_update(&mut self) {
        self.show_stats = Some(true);
    }

    pub fn is_show_stats(&self) -> bool {
        self.show_stats.unwrap_or(false)
    }
}
