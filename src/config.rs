use std::{collections::HashSet, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Result;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data_model::{Flow, Library, ProcessingNode};

fn default_max_flow_parts() -> u32 {
    25
}

fn default_node_stale_after_secs() -> u64 {
    600
}

fn default_runner_timeout_secs() -> u64 {
    180
}

fn default_runner_failure_pause_secs() -> u64 {
    60
}

fn default_listen_addr() -> String {
    "0.0.0.0:8900".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub structured_logging: bool,
    /// Counted flow parts a single execution may run.
    #[serde(default = "default_max_flow_parts")]
    pub max_flow_parts: u32,
    #[serde(default = "default_node_stale_after_secs")]
    pub node_stale_after_secs: u64,
    #[serde(default = "default_runner_timeout_secs")]
    pub runner_timeout_secs: u64,
    #[serde(default = "default_runner_failure_pause_secs")]
    pub runner_failure_pause_secs: u64,
    #[serde(default)]
    pub libraries: Vec<Library>,
    #[serde(default)]
    pub nodes: Vec<ProcessingNode>,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: default_listen_addr(),
            structured_logging: false,
            max_flow_parts: default_max_flow_parts(),
            node_stale_after_secs: default_node_stale_after_secs(),
            runner_timeout_secs: default_runner_timeout_secs(),
            runner_failure_pause_secs: default_runner_failure_pause_secs(),
            libraries: vec![],
            nodes: vec![],
            flows: vec![],
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new()
            .merge(Yaml::string(config_str))
            .merge(Env::prefixed("FILEFLOWS_").only(&[
                "listen_addr",
                "structured_logging",
                "max_flow_parts",
                "node_stale_after_secs",
                "runner_timeout_secs",
                "runner_failure_pause_secs",
            ]))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.max_flow_parts == 0 {
            return Err(anyhow::anyhow!("max_flow_parts must be at least 1"));
        }

        let mut library_uids = HashSet::new();
        for library in &self.libraries {
            if !library_uids.insert(&library.uid) {
                return Err(anyhow::anyhow!("duplicate library uid: {}", library.uid));
            }
        }
        let mut node_uids = HashSet::new();
        for node in &self.nodes {
            if !node_uids.insert(&node.uid) {
                return Err(anyhow::anyhow!("duplicate node uid: {}", node.uid));
            }
        }
        let mut flow_uids = HashSet::new();
        for flow in &self.flows {
            if !flow_uids.insert(&flow.uid) {
                return Err(anyhow::anyhow!("duplicate flow uid: {}", flow.uid));
            }
        }

        for library in &self.libraries {
            if let Some(flow_uid) = &library.flow_uid {
                if !flow_uids.contains(flow_uid) {
                    return Err(anyhow::anyhow!(
                        "library {} refers to unknown flow {}",
                        library.uid,
                        flow_uid
                    ));
                }
            }
            if !library.schedule.is_well_formed() {
                warn!(
                    library_uid = %library.uid,
                    "library schedule is malformed, it will never be in schedule"
                );
            }
        }
        for node in &self.nodes {
            if !node.schedule.is_well_formed() {
                warn!(
                    node_uid = %node.uid,
                    "node schedule is malformed, it will never be in schedule"
                );
            }
        }
        Ok(())
    }

    pub fn runner_timeout(&self) -> Duration {
        Duration::from_secs(self.runner_timeout_secs)
    }

    pub fn runner_failure_pause(&self) -> Duration {
        Duration::from_secs(self.runner_failure_pause_secs)
    }

    pub fn node_stale_after(&self) -> Duration {
        Duration::from_secs(self.node_stale_after_secs)
    }
}

fn default_poll_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_uid: String,
    pub server_addr: String,
    pub temp_path: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Binary launched for each runner, the current executable when unset.
    #[serde(default)]
    pub runner_executable: Option<PathBuf>,
    #[serde(default)]
    pub structured_logging: bool,
}

impl NodeConfig {
    pub fn from_path(path: &str) -> Result<NodeConfig> {
        let config_str = std::fs::read_to_string(path)?;
        let config: NodeConfig = Figment::new()
            .merge(Yaml::string(&config_str))
            .merge(Env::prefixed("FILEFLOWS_NODE_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_uid.trim().is_empty() {
            return Err(anyhow::anyhow!("node_uid must not be empty"));
        }
        if self.server_addr.trim().is_empty() {
            return Err(anyhow::anyhow!("server_addr must not be empty"));
        }
        if self.poll_interval_secs == 0 {
            return Err(anyhow::anyhow!("poll_interval_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn runner_executable(&self) -> Result<PathBuf> {
        match &self.runner_executable {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}
