use crate::config::json::TopologyJson;
use anyhow::Context;
use emulated_network::network::event::NetworkEvent;
use emulated_network::network::spec::{LinkClass, NetworkSpec};
use std::path::Path;

pub mod cli;
pub mod json;

/// Everything the topology file declares, resolved
pub struct TopologyFile {
    pub spec: NetworkSpec,
    pub events: Vec<NetworkEvent>,
    pub link_class: Option<LinkClass>,
}

pub fn load_topology(path: &Path) -> anyhow::Result<TopologyFile> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read topology file `{}`", path.display()))?;
    let json: TopologyJson = serde_json::from_str(&json)
        .with_context(|| format!("invalid topology file `{}`", path.display()))?;

    let spec = json
        .topology()?
        .build(&json.topology_config())
        .context("failed to resolve the topology")?;

    Ok(TopologyFile {
        spec,
        events: json.events()?,
        link_class: json.link_class,
    })
}
