//! In-memory cluster harness.
#![allow(dead_code)]
//!
//! Wires several container nodes together with a transport that dispatches
//! directly into the peer's command handler, with per-link fault injection:
//! links can be made to fail a fixed number of times and whole nodes can be
//! taken down.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use caravan_id::{AgentName, ContainerName};
use caravan_node::{AgentInstance, Config, ContainerNode, Transport};
use caravan_wire::{AgentMessage, Command, MobilityError, RelocateMode, RelocateOutcome, Reply};

pub fn agent(s: &str) -> AgentName {
    s.parse().unwrap()
}

pub fn container(s: &str) -> ContainerName {
    s.parse().unwrap()
}

type Tap = Box<dyn Fn(&ContainerName, &Command) + Send + Sync>;

/// Shared state of the in-memory network.
#[derive(Default)]
pub struct MemoryNet {
    nodes: Mutex<HashMap<ContainerName, Arc<ContainerNode>>>,
    down: Mutex<HashSet<ContainerName>>,
    /// Remaining forced failures per (from, to) link.
    failures: Mutex<HashMap<(ContainerName, ContainerName), usize>>,
    /// Remaining replies to lose per (from, to) link: the call executes on
    /// the target, but the caller sees a link failure.
    reply_drops: Mutex<HashMap<(ContainerName, ContainerName), usize>>,
    /// Observer invoked for every call, before fault injection.
    tap: Mutex<Option<Tap>>,
}

impl MemoryNet {
    pub fn node(&self, name: &ContainerName) -> Option<Arc<ContainerNode>> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Makes the next `times` calls over `from -> to` fail with a link
    /// failure.
    pub fn fail_link(&self, from: &str, to: &str, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert((container(from), container(to)), times);
    }

    /// Makes the next `times` calls over `from -> to` execute on the target
    /// but lose the reply on the way back.
    pub fn drop_reply(&self, from: &str, to: &str, times: usize) {
        self.reply_drops
            .lock()
            .unwrap()
            .insert((container(from), container(to)), times);
    }

    pub fn take_down(&self, name: &str) {
        self.down.lock().unwrap().insert(container(name));
    }

    pub fn restore(&self, name: &str) {
        self.down.lock().unwrap().remove(&container(name));
    }

    pub fn set_tap(&self, tap: Tap) {
        *self.tap.lock().unwrap() = Some(tap);
    }

    fn should_fail(&self, from: &ContainerName, to: &ContainerName) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&(from.clone(), to.clone())) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn should_drop_reply(&self, from: &ContainerName, to: &ContainerName) -> bool {
        let mut drops = self.reply_drops.lock().unwrap();
        match drops.get_mut(&(from.clone(), to.clone())) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Transport that dispatches directly into the target node.
pub struct MemoryTransport {
    local: ContainerName,
    net: Arc<MemoryNet>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, to: &ContainerName, command: Command) -> Result<Reply, MobilityError> {
        if let Some(tap) = self.net.tap.lock().unwrap().as_ref() {
            tap(to, &command);
        }
        if self.net.down.lock().unwrap().contains(to) {
            return Err(MobilityError::link(to, "node down"));
        }
        if self.net.should_fail(&self.local, to) {
            return Err(MobilityError::link(to, "connection reset"));
        }
        let node = self
            .net
            .node(to)
            .ok_or_else(|| MobilityError::link(to, "unknown container"))?;
        let result = node.handle(&self.local, command).await;
        if self.net.should_drop_reply(&self.local, to) {
            return Err(MobilityError::link(to, "reply lost"));
        }
        result
    }

    async fn refresh(&self, _to: &ContainerName) {}
}

/// A small platform: the first node is the main container.
pub struct Cluster {
    pub net: Arc<MemoryNet>,
    main: ContainerName,
    registries: HashMap<ContainerName, PathBuf>,
    _dirs: Vec<tempfile::TempDir>,
}

impl Cluster {
    pub fn new(names: &[&str]) -> Self {
        let net = Arc::new(MemoryNet::default());
        let main = container(names[0]);
        let mut dirs = Vec::new();
        let mut registries = HashMap::new();

        for name in names {
            let dir = tempfile::tempdir().unwrap();
            let config = Config {
                node_name: container(name),
                listen_addr: "127.0.0.1:0".parse().unwrap(),
                main_container: main.clone(),
                peers: Vec::new(),
                code_registry_dir: dir.path().to_path_buf(),
                code_paths: Vec::new(),
                probe_timeout_ms: 200,
                call_timeout_ms: 1000,
                log_level: "info".to_string(),
            };
            let transport: Arc<dyn Transport> = Arc::new(MemoryTransport {
                local: container(name),
                net: Arc::clone(&net),
            });
            let node = Arc::new(ContainerNode::new(&config, transport));
            net.nodes.lock().unwrap().insert(container(name), node);
            registries.insert(container(name), dir.path().to_path_buf());
            dirs.push(dir);
        }

        Self {
            net,
            main,
            registries,
            _dirs: dirs,
        }
    }

    pub fn node(&self, name: &str) -> Arc<ContainerNode> {
        self.net.node(&container(name)).unwrap()
    }

    pub fn main_node(&self) -> Arc<ContainerNode> {
        self.net.node(&self.main).unwrap()
    }

    /// Registry directory of a node, for planting code modules.
    pub fn registry_dir(&self, name: &str) -> PathBuf {
        self.registries[&container(name)].clone()
    }

    /// Registers an instance through the node's birth path, which records
    /// the identity with the main container over the wire.
    pub async fn spawn_instance(&self, container_name: &str, instance: AgentInstance) {
        self.node(container_name)
            .register_agent(instance)
            .await
            .unwrap();
    }

    pub async fn spawn(&self, container_name: &str, agent_name: &str) {
        self.spawn_instance(container_name, AgentInstance::new(agent(agent_name), None))
            .await;
    }

    pub async fn move_agent(&self, agent_name: &str, from: &str, to: &str) -> RelocateOutcome {
        self.node(from)
            .relocate(&agent(agent_name), &container(to), RelocateMode::Move, None)
            .await
    }

    pub async fn clone_agent(
        &self,
        agent_name: &str,
        from: &str,
        to: &str,
        new_name: &str,
    ) -> RelocateOutcome {
        self.node(from)
            .relocate(
                &agent(agent_name),
                &container(to),
                RelocateMode::Clone,
                Some(agent(new_name)),
            )
            .await
    }

    /// Where the global directory currently places an agent.
    pub async fn whereis(&self, agent_name: &str) -> Option<ContainerName> {
        self.main_node()
            .gadt()
            .unwrap()
            .lookup(&agent(agent_name))
            .await
            .map(|e| e.container)
    }

    /// Routes a message to wherever the global directory says the agent is.
    pub async fn send(&self, to_agent: &str, body: serde_json::Value) -> Result<(), MobilityError> {
        let holder = self
            .whereis(to_agent)
            .await
            .ok_or_else(|| MobilityError::NotFound {
                agent: agent(to_agent),
            })?;
        let node = self
            .net
            .node(&holder)
            .ok_or_else(|| MobilityError::link(&holder, "unknown container"))?;
        node.deliver_local(&agent(to_agent), AgentMessage::new(agent("tester"), body))
    }

    /// Message bodies queued for an agent on a given node, oldest first.
    pub fn queued(&self, container_name: &str, agent_name: &str) -> Vec<serde_json::Value> {
        self.node(container_name)
            .directory()
            .inbox(&agent(agent_name))
            .map(|inbox| inbox.peek_all().into_iter().map(|m| m.body).collect())
            .unwrap_or_default()
    }

    pub fn hosts(&self, container_name: &str, agent_name: &str) -> bool {
        self.node(container_name)
            .directory()
            .contains(&agent(agent_name))
    }
}
