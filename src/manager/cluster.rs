//! In-process cluster manager: launches every replica of every group as a
//! tokio task on one shared network, and drives them through control
//! messages for testing and fault injection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use crate::client::{ClientContext, RoutingTable};
use crate::protocols::{Envelope, PaxosReplica};
use crate::server::{
    AcceptAll, ApiEndpoints, ClientId, ClientRegistry, CtrlHandle, CtrlMsg,
    CtrlReply, Epoch, GenericReplica, GroupId, IdentityVerifier, Network,
    RecordStore, ReplicaId, ReplicaInfo, ReplicaSetup, ReplicaTag, ReqBatch,
    INITIAL_EPOCH,
};
use crate::utils::GuidStoreError;

use futures::future::join_all;

use serde::Deserialize;

use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// Client ID reserved for the manager's own reconfiguration requests.
const ADMIN_CLIENT: ClientId = ClientId::MAX;

/// Initial membership of one group.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GroupSpec {
    pub id: GroupId,
    pub members: Vec<ReplicaId>,
}

/// Cluster layout plus the configs handed to replicas and clients.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClusterConfig {
    pub groups: Vec<GroupSpec>,

    /// Directory holding every replica's WAL and snapshot files. Overrides
    /// any `data_dir` given in the replica table.
    pub data_dir: String,

    /// Replica config table, passed to every replica.
    #[serde(default)]
    pub replica: Option<toml::Table>,

    /// Client config table, passed to every client context.
    #[serde(default)]
    pub client: Option<toml::Table>,
}

impl ClusterConfig {
    /// Parses a layout from TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self, GuidStoreError> {
        let config: ClusterConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GuidStoreError> {
        if self.groups.is_empty() {
            return logged_err!("m"; "cluster config has no groups");
        }
        let mut ids = BTreeSet::new();
        for group in &self.groups {
            if !ids.insert(group.id) {
                return logged_err!("m"; "duplicate group ID {}", group.id);
            }
            if group.members.is_empty() {
                return logged_err!("m"; "group {} has no members", group.id);
            }
            let distinct: BTreeSet<_> = group.members.iter().collect();
            if distinct.len() != group.members.len() {
                return logged_err!("m"; "group {} lists a member twice",
                                        group.id);
            }
        }
        if self.data_dir.is_empty() {
            return logged_err!("m"; "cluster config has empty data_dir");
        }
        Ok(())
    }

    /// Config string of every replica.
    fn replica_config_str(&self) -> String {
        let mut table = self.replica.clone().unwrap_or_default();
        table.insert(
            "data_dir".into(),
            toml::Value::String(self.data_dir.clone()),
        );
        table.to_string()
    }

    /// Config string of every client context, if any.
    fn client_config_str(&self) -> Option<String> {
        self.client.as_ref().map(|t| t.to_string())
    }
}

/// A running replica task and how it was launched.
struct ReplicaHandle {
    ctrl: CtrlHandle,
    task: JoinHandle<Result<bool, GuidStoreError>>,

    /// Membership handed at launch; empty for joiners.
    launch_members: Vec<ReplicaId>,
}

/// Local cluster of replica tasks sharing one in-process network.
pub struct LocalCluster {
    config: ClusterConfig,

    /// Peer-peer network shared by all replicas.
    network: Network<Envelope>,

    /// Client-facing request inboxes of all replicas.
    endpoints: ApiEndpoints,

    /// Client reply channels.
    registry: ClientRegistry,

    /// Shared group routing table.
    routing: Arc<RwLock<RoutingTable>>,

    /// Requester identity checker handed to every replica.
    verifier: Arc<dyn IdentityVerifier>,

    /// Currently running replicas.
    replicas: BTreeMap<ReplicaTag, ReplicaHandle>,

    /// Crashed replicas -> the membership to relaunch them with.
    crashed: BTreeMap<ReplicaTag, Vec<ReplicaId>>,

    /// Context used for reconfiguration requests, created on first use.
    admin: Option<ClientContext>,

    next_client: ClientId,
}

impl LocalCluster {
    /// Launches every replica of the given layout, trusting every requester.
    pub async fn launch(config: ClusterConfig) -> Result<Self, GuidStoreError> {
        Self::launch_with_verifier(config, Arc::new(AcceptAll)).await
    }

    /// Launches every replica of the given layout.
    pub async fn launch_with_verifier(
        config: ClusterConfig,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Result<Self, GuidStoreError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir).await?;

        let layout: Vec<(GroupId, Vec<ReplicaId>)> = config
            .groups
            .iter()
            .map(|g| (g.id, g.members.clone()))
            .collect();
        let routing =
            Arc::new(RwLock::new(RoutingTable::new(&layout, INITIAL_EPOCH)?));

        let network = Network::new();
        let endpoints = ApiEndpoints::new(network.faults());
        let mut cluster = LocalCluster {
            config,
            network,
            endpoints,
            registry: ClientRegistry::new(),
            routing,
            verifier,
            replicas: BTreeMap::new(),
            crashed: BTreeMap::new(),
            admin: None,
            next_client: 0,
        };

        for (group, members) in layout {
            for &node in &members {
                let tag = ReplicaTag::new(group, node);
                cluster.spawn_replica(tag, members.clone()).await?;
            }
        }
        pf_info!("m"; "launched {} replicas in {} groups",
                      cluster.replicas.len(), cluster.config.groups.len());
        Ok(cluster)
    }

    /// Sets up a replica and spawns its event loop.
    async fn spawn_replica(
        &mut self,
        tag: ReplicaTag,
        members: Vec<ReplicaId>,
    ) -> Result<(), GuidStoreError> {
        if self.replicas.contains_key(&tag) {
            return logged_err!("m"; "replica {} already running", tag);
        }

        let (ctrl, rx_ctrl) = CtrlHandle::new();
        let setup = ReplicaSetup {
            tag,
            members: members.clone(),
            config_str: Some(self.config.replica_config_str()),
            network: self.network.clone(),
            endpoints: self.endpoints.clone(),
            registry: self.registry.clone(),
            rx_ctrl,
            verifier: self.verifier.clone(),
            routing: self.routing.clone(),
        };
        let mut replica = PaxosReplica::new_and_setup(setup).await?;
        let task = tokio::spawn(async move { replica.run().await });

        pf_debug!("m"; "spawned replica {} with members {:?}", tag, members);
        self.replicas.insert(
            tag,
            ReplicaHandle {
                ctrl,
                task,
                launch_members: members,
            },
        );
        Ok(())
    }

    /// Shared group routing table.
    pub fn routing(&self) -> Arc<RwLock<RoutingTable>> {
        self.routing.clone()
    }

    /// Tags of all running replicas.
    pub fn running(&self) -> Vec<ReplicaTag> {
        self.replicas.keys().copied().collect()
    }

    /// Creates a new client context on this cluster.
    pub fn client(&mut self) -> Result<ClientContext, GuidStoreError> {
        let id = self.next_client;
        self.next_client += 1;
        ClientContext::new_and_setup(
            id,
            self.routing.clone(),
            self.endpoints.clone(),
            &self.registry,
            self.config.client_config_str().as_deref(),
        )
    }

    /// Makes `node` unreachable for peers and clients alike.
    pub fn isolate(&self, node: ReplicaId) -> Result<(), GuidStoreError> {
        pf_warn!("m"; "isolating node {}", node);
        self.network.isolate(node)
    }

    /// Makes `node` reachable again.
    pub fn heal(&self, node: ReplicaId) -> Result<(), GuidStoreError> {
        pf_warn!("m"; "healing node {}", node);
        self.network.heal(node)
    }

    /// Drops messages on the directed link `from -> to`.
    pub fn cut(
        &self,
        from: ReplicaId,
        to: ReplicaId,
    ) -> Result<(), GuidStoreError> {
        self.network.cut(from, to)
    }

    /// Restores the directed link `from -> to`.
    pub fn mend(
        &self,
        from: ReplicaId,
        to: ReplicaId,
    ) -> Result<(), GuidStoreError> {
        self.network.mend(from, to)
    }

    fn ctrl(&self, tag: ReplicaTag) -> Result<&CtrlHandle, GuidStoreError> {
        match self.replicas.get(&tag) {
            Some(handle) => Ok(&handle.ctrl),
            None => logged_err!("m"; "replica {} is not running", tag),
        }
    }

    /// Sends a control message to replica `tag` and waits for its reply.
    pub async fn control(
        &self,
        tag: ReplicaTag,
        msg: CtrlMsg,
    ) -> Result<CtrlReply, GuidStoreError> {
        self.ctrl(tag)?.request(msg).await
    }

    pub async fn query_info(
        &self,
        tag: ReplicaTag,
    ) -> Result<ReplicaInfo, GuidStoreError> {
        match self.control(tag, CtrlMsg::QueryInfo).await? {
            CtrlReply::Info(info) => Ok(info),
            reply => logged_err!("m"; "unexpected ctrl reply {:?}", reply),
        }
    }

    /// Copy of the record store replica `tag` has applied.
    pub async fn dump_state(
        &self,
        tag: ReplicaTag,
    ) -> Result<Box<RecordStore>, GuidStoreError> {
        match self.control(tag, CtrlMsg::DumpState).await? {
            CtrlReply::State(state) => Ok(state),
            reply => logged_err!("m"; "unexpected ctrl reply {:?}", reply),
        }
    }

    /// Decided `(slot, batch)` pairs replica `tag` still holds in its log.
    pub async fn decided_log(
        &self,
        tag: ReplicaTag,
    ) -> Result<Vec<(usize, ReqBatch)>, GuidStoreError> {
        match self.control(tag, CtrlMsg::DumpLog).await? {
            CtrlReply::Decided(decided) => Ok(decided),
            reply => logged_err!("m"; "unexpected ctrl reply {:?}", reply),
        }
    }

    /// Tells replica `tag` to run for leadership now.
    pub async fn step_up(&self, tag: ReplicaTag) -> Result<(), GuidStoreError> {
        match self.control(tag, CtrlMsg::StepUp).await? {
            CtrlReply::SteppedUp => Ok(()),
            reply => logged_err!("m"; "unexpected ctrl reply {:?}", reply),
        }
    }

    /// Makes replica `tag` snapshot and compact its log. Returns its new log
    /// start slot.
    pub async fn take_snapshot(
        &self,
        tag: ReplicaTag,
    ) -> Result<usize, GuidStoreError> {
        match self.control(tag, CtrlMsg::TakeSnapshot).await? {
            CtrlReply::SnapshotUpTo { new_start } => Ok(new_start),
            reply => logged_err!("m"; "unexpected ctrl reply {:?}", reply),
        }
    }

    /// Pauses replica `tag`'s event loop until `resume()`.
    pub async fn pause(&self, tag: ReplicaTag) -> Result<(), GuidStoreError> {
        match self.control(tag, CtrlMsg::Pause).await? {
            CtrlReply::Paused => Ok(()),
            reply => logged_err!("m"; "unexpected ctrl reply {:?}", reply),
        }
    }

    pub async fn resume(&self, tag: ReplicaTag) -> Result<(), GuidStoreError> {
        match self.control(tag, CtrlMsg::Resume).await? {
            CtrlReply::Resumed => Ok(()),
            reply => logged_err!("m"; "unexpected ctrl reply {:?}", reply),
        }
    }

    /// Polls the running replicas of `group` until one reports a completed
    /// Prepare phase. Returns its node ID.
    pub async fn wait_for_leader(
        &self,
        group: GroupId,
        timeout: Duration,
    ) -> Result<ReplicaId, GuidStoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            for tag in self.replicas.keys().filter(|t| t.group == group) {
                if self.network.is_down(tag.node)? {
                    continue;
                }
                let info = self.query_info(*tag).await?;
                if info.is_leader {
                    return Ok(tag.node);
                }
            }
            if Instant::now() >= deadline {
                return Err(GuidStoreError::GroupUnavailable(group));
            }
            time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Polls the given replicas of `group` until they are all started in the
    /// same epoch and have executed everything up to the same slot.
    pub async fn wait_caught_up(
        &self,
        group: GroupId,
        nodes: &[ReplicaId],
        timeout: Duration,
    ) -> Result<(), GuidStoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut infos = Vec::with_capacity(nodes.len());
            for &node in nodes {
                let tag = ReplicaTag::new(group, node);
                infos.push(self.query_info(tag).await?);
            }
            let settled = infos.iter().all(|info| {
                !info.awaiting_start
                    && !info.retired
                    && info.commit_bar == info.exec_bar
                    && info.epoch == infos[0].epoch
                    && info.exec_bar == infos[0].exec_bar
            });
            if settled {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return logged_err!("m"; "group {} not caught up: {:?}",
                                        group, infos);
            }
            time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Crashes every replica hosted on `node`: its tasks are aborted and the
    /// node is cut off the network. Durable files are kept.
    pub async fn crash(
        &mut self,
        node: ReplicaId,
    ) -> Result<(), GuidStoreError> {
        self.network.isolate(node)?;
        let tags: Vec<ReplicaTag> = self
            .replicas
            .keys()
            .filter(|t| t.node == node)
            .copied()
            .collect();
        for tag in tags {
            if let Some(handle) = self.replicas.remove(&tag) {
                handle.task.abort();
                if let Err(e) = handle.task.await {
                    if !e.is_cancelled() {
                        pf_error!("m"; "replica {} task failed: {}", tag, e);
                    }
                }
                self.crashed.insert(tag, handle.launch_members);
                pf_warn!("m"; "crashed replica {}", tag);
            }
        }
        Ok(())
    }

    /// Restarts every crashed replica of `node` from its durable files.
    pub async fn restart(
        &mut self,
        node: ReplicaId,
    ) -> Result<(), GuidStoreError> {
        // let loggers of the crashed replicas finish before reopening files
        time::sleep(Duration::from_millis(50)).await;

        let tags: Vec<ReplicaTag> = self
            .crashed
            .keys()
            .filter(|t| t.node == node)
            .copied()
            .collect();
        for tag in tags {
            if let Some(members) = self.crashed.remove(&tag) {
                self.spawn_replica(tag, members).await?;
                pf_warn!("m"; "restarted replica {}", tag);
            }
        }
        self.network.heal(node)
    }

    /// Launches a replica of `group` on `node` that waits to be started by
    /// a reconfiguration naming it.
    pub async fn add_replica(
        &mut self,
        group: GroupId,
        node: ReplicaId,
    ) -> Result<(), GuidStoreError> {
        if self.routing.read()?.members(group).is_none() {
            return logged_err!("m"; "unknown group {}", group);
        }
        self.spawn_replica(ReplicaTag::new(group, node), vec![])
            .await
    }

    /// Replaces the membership of `group`, returning its new epoch.
    pub async fn reconfigure(
        &mut self,
        group: GroupId,
        members: Vec<ReplicaId>,
    ) -> Result<Epoch, GuidStoreError> {
        if self.admin.is_none() {
            self.admin = Some(ClientContext::new_and_setup(
                ADMIN_CLIENT,
                self.routing.clone(),
                self.endpoints.clone(),
                &self.registry,
                self.config.client_config_str().as_deref(),
            )?);
        }
        match self.admin.as_mut() {
            Some(admin) => admin.reconfigure(group, members).await,
            None => logged_err!("m"; "admin client missing"),
        }
    }

    /// Terminates every running replica and waits for their tasks.
    pub async fn shutdown(mut self) -> Result<(), GuidStoreError> {
        let replicas = std::mem::take(&mut self.replicas);
        let mut tasks = Vec::with_capacity(replicas.len());
        for (tag, handle) in replicas {
            if let Err(e) = handle.ctrl.request(CtrlMsg::Terminate).await {
                pf_warn!("m"; "replica {} gone before terminate: {}", tag, e);
                handle.task.abort();
            }
            tasks.push(async move { (tag, handle.task.await) });
        }

        for (tag, result) in join_all(tasks).await {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => pf_error!("m"; "replica {} exited: {}", tag, e),
                Err(e) if e.is_cancelled() => {}
                Err(e) => pf_error!("m"; "replica {} task failed: {}", tag, e),
            }
        }
        pf_info!("m"; "cluster shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_layout() -> Result<(), GuidStoreError> {
        let config = ClusterConfig::from_toml_str(
            r#"
            data_dir = "/tmp/guidstore-test"

            [[groups]]
            id = 0
            members = [0, 1, 2]

            [[groups]]
            id = 1
            members = [2, 3, 4]

            [replica]
            hb_send_interval_ms = 20
            data_dir = "/ignored"

            [client]
            max_retries = 5
            "#,
        )?;
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.groups[1].members, vec![2, 3, 4]);

        let replica: toml::Table = config.replica_config_str().parse()?;
        assert_eq!(
            replica.get("data_dir"),
            Some(&toml::Value::String("/tmp/guidstore-test".into()))
        );
        assert_eq!(
            replica.get("hb_send_interval_ms"),
            Some(&toml::Value::Integer(20))
        );
        assert_eq!(
            config.client_config_str().as_deref().map(str::trim),
            Some("max_retries = 5")
        );
        Ok(())
    }

    #[test]
    fn bad_layouts() {
        let base = |groups: &str| {
            format!("data_dir = \"/tmp/x\"\n{}", groups)
        };
        assert!(ClusterConfig::from_toml_str(&base("groups = []")).is_err());
        assert!(ClusterConfig::from_toml_str(&base(
            "[[groups]]\nid = 0\nmembers = []"
        ))
        .is_err());
        assert!(ClusterConfig::from_toml_str(&base(
            "[[groups]]\nid = 0\nmembers = [1, 1]"
        ))
        .is_err());
        assert!(ClusterConfig::from_toml_str(&base(
            "[[groups]]\nid = 0\nmembers = [1]\n\
             [[groups]]\nid = 0\nmembers = [2]"
        ))
        .is_err());
        assert!(ClusterConfig::from_toml_str(
            "data_dir = \"\"\n[[groups]]\nid = 0\nmembers = [1]"
        )
        .is_err());
    }
}
