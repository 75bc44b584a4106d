// Copyright 2022 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Multi-node DKG lifecycles over an in-process mesh: every node is a real
//! `DkgProcess` with its own store and keys, and the mesh routes each RPC to
//! the addressed peer directly.

use beacon_dkg::{
    AbortDkg, AcceptProposal, DkgPacket, DkgProcess, DkgRpc, DkgState, DkgStore, Error,
    FirstProposalOptions, Identity, IdentityProvider, Keypair, ProcessConfig, ProposalOptions,
    ProposalTerms, RejectProposal, Result, Scheme, StartExecution, Status,
};

use async_trait::async_trait;
use eyre::{eyre, Result as TestResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const BEACON_ID: &str = "default";

// Routes every RPC to the process registered under the recipient's address.
// Unregistered addresses behave like unreachable hosts.
#[derive(Default)]
struct MeshRpc {
    peers: RwLock<HashMap<String, Arc<DkgProcess>>>,
}

impl MeshRpc {
    fn register(&self, address: &str, process: Arc<DkgProcess>) {
        if let Ok(mut peers) = self.peers.write() {
            let _previous = peers.insert(address.to_string(), process);
        }
    }

    fn disconnect(&self, address: &str) -> Option<Arc<DkgProcess>> {
        self.peers
            .write()
            .ok()
            .and_then(|mut peers| peers.remove(address))
    }

    fn peer(&self, to: &Identity) -> Result<Arc<DkgProcess>> {
        self.peers
            .read()
            .ok()
            .and_then(|peers| peers.get(to.address()).cloned())
            .ok_or_else(|| Error::FailedSend(to.address().to_string()))
    }
}

#[async_trait]
impl DkgRpc for MeshRpc {
    async fn propose(&self, to: &Identity, terms: ProposalTerms) -> Result<()> {
        self.peer(to)?.on_propose(terms).await
    }
    async fn accept(&self, to: &Identity, acceptance: AcceptProposal) -> Result<()> {
        self.peer(to)?.on_accept(acceptance).await
    }
    async fn reject(&self, to: &Identity, rejection: RejectProposal) -> Result<()> {
        self.peer(to)?.on_reject(rejection).await
    }
    async fn abort(&self, to: &Identity, abort: AbortDkg) -> Result<()> {
        self.peer(to)?.on_abort(abort).await
    }
    async fn execute(&self, to: &Identity, kickoff: StartExecution) -> Result<()> {
        self.peer(to)?.on_execute(kickoff).await
    }
    async fn broadcast_dkg(&self, to: &Identity, packet: DkgPacket) -> Result<()> {
        self.peer(to)?.on_broadcast(packet).await
    }
}

struct StaticKeys {
    keypair: Keypair,
}

impl IdentityProvider for StaticKeys {
    fn keypair_for(&self, _beacon_id: &str) -> Result<Keypair> {
        Ok(self.keypair.clone())
    }
}

struct TestNode {
    keypair: Keypair,
    process: Arc<DkgProcess>,
    _store_dir: TempDir,
}

impl TestNode {
    fn identity(&self) -> &Identity {
        self.keypair.public()
    }

    async fn state(&self) -> TestResult<DkgState> {
        Ok(self.process.status(BEACON_ID).await?)
    }
}

fn fast_config() -> ProcessConfig {
    ProcessConfig {
        time_between_phases: Duration::from_millis(500),
        kickoff_grace_period: Duration::from_millis(300),
    }
}

fn spawn_node(mesh: &Arc<MeshRpc>, port: u16) -> TestResult<TestNode> {
    let keypair = Keypair::new(format!("127.0.0.1:{}", port), Scheme::PedersenBlsChained);
    let store_dir = TempDir::new()?;
    let store = DkgStore::open(store_dir.path())?;
    let process = DkgProcess::new(
        store,
        Arc::new(StaticKeys {
            keypair: keypair.clone(),
        }),
        mesh.clone(),
        fast_config(),
    );
    mesh.register(keypair.public().address(), process.clone());
    Ok(TestNode {
        keypair,
        process,
        _store_dir: store_dir,
    })
}

fn spawn_committee(mesh: &Arc<MeshRpc>, count: usize, base_port: u16) -> TestResult<Vec<TestNode>> {
    (0..count)
        .map(|index| spawn_node(mesh, base_port + index as u16))
        .collect()
}

async fn wait_for_status(node: &TestNode, want: Status, patience: Duration) -> TestResult<DkgState> {
    let deadline = SystemTime::now() + patience;
    loop {
        let state = node.state().await?;
        if state.status() == want {
            return Ok(state);
        }
        if SystemTime::now() >= deadline {
            return Err(eyre!(
                "node {} stuck in {} while waiting for {}",
                node.identity(),
                state.status(),
                want
            ));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn first_options(joining: Vec<Identity>, threshold: u32) -> FirstProposalOptions {
    FirstProposalOptions {
        timeout: SystemTime::now() + Duration::from_secs(30),
        threshold,
        period: Duration::from_secs(10),
        scheme_id: "pedersen-bls-chained".to_string(),
        catchup_period: Duration::from_secs(5),
        genesis_time: SystemTime::now() + Duration::from_secs(30),
        joining,
    }
}

// Drives a committee from nothing to a completed first epoch: the first node
// leads, the others join, the leader kicks off.
async fn run_first_epoch(nodes: &[TestNode], threshold: u32) -> TestResult<()> {
    let leader = &nodes[0];
    let joining: Vec<Identity> = nodes.iter().map(|node| node.identity().clone()).collect();

    leader
        .process
        .initial(BEACON_ID, first_options(joining, threshold))
        .await?;
    for node in &nodes[1..] {
        node.process.join(BEACON_ID, None).await?;
    }
    leader.process.clone().execute(BEACON_ID).await?;

    for node in nodes {
        let _state = wait_for_status(node, Status::Complete, Duration::from_secs(20)).await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn four_node_fresh_dkg_completes_consistently() -> TestResult<()> {
    let mesh = Arc::new(MeshRpc::default());
    let nodes = spawn_committee(&mesh, 4, 9100)?;

    let mut completions = nodes[0].process.subscribe_completions();
    run_first_epoch(&nodes, 3).await?;

    let reference = nodes[0].state().await?;
    let reference_group = reference.final_group()?.clone();
    assert_eq!(reference.epoch(), 1);
    assert_eq!(reference_group.nodes().len(), 4);
    assert_eq!(reference_group.public_key().coefficients().len(), 3);

    for node in &nodes {
        let state = node.state().await?;
        let group = state.final_group()?;
        assert_eq!(state.epoch(), 1);
        assert_eq!(group.hash(), reference_group.hash());
        assert_eq!(group.public_key(), reference_group.public_key());
        // Each node's share carries a copy of the group's public polynomial.
        assert_eq!(state.key_share()?.commitments(), group.public_key());
    }

    let completion = completions.recv().await?;
    assert_eq!(completion.beacon_id, BEACON_ID);
    assert!(completion.old.is_none());
    assert_eq!(completion.new.epoch(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reshare_drops_two_nodes_and_adds_one() -> TestResult<()> {
    let mesh = Arc::new(MeshRpc::default());
    let nodes = spawn_committee(&mesh, 10, 9200)?;
    run_first_epoch(&nodes, 7).await?;

    let first_epoch = nodes[0].state().await?;
    let first_group = first_epoch.final_group()?.clone();
    let first_public_key = first_group.public_key().coefficients()[0];

    // Node 0 leads again: the last two members leave, one newcomer joins,
    // and the threshold drops to 6-of-8.
    let newcomer = spawn_node(&mesh, 9290)?;
    let mut completions = nodes[0].process.subscribe_completions();

    let remaining: Vec<Identity> = nodes[..8].iter().map(|node| node.identity().clone()).collect();
    let leaving: Vec<Identity> = nodes[8..].iter().map(|node| node.identity().clone()).collect();
    nodes[0]
        .process
        .resharing(
            BEACON_ID,
            ProposalOptions {
                timeout: SystemTime::now() + Duration::from_secs(30),
                threshold: 6,
                catchup_period: Duration::from_secs(5),
                joining: vec![newcomer.identity().clone()],
                remaining,
                leaving,
            },
        )
        .await?;

    for node in &nodes[1..8] {
        node.process.accept(BEACON_ID).await?;
    }
    newcomer
        .process
        .join(BEACON_ID, Some(first_group.to_bytes()?))
        .await?;
    nodes[0].process.clone().execute(BEACON_ID).await?;

    let mut survivors: Vec<&TestNode> = nodes[..8].iter().collect();
    survivors.push(&newcomer);
    let mut group_hashes = Vec::new();
    for node in &survivors {
        let state = wait_for_status(node, Status::Complete, Duration::from_secs(20)).await?;
        let group = state.final_group()?;
        assert_eq!(state.epoch(), 2);
        assert_eq!(group.nodes().len(), 8);
        assert_eq!(group.threshold(), 6);
        // The genesis data survives the membership change, and so does the
        // distributed public key.
        assert_eq!(group.genesis_time(), first_group.genesis_time());
        assert_eq!(state.genesis_seed(), first_epoch.genesis_seed());
        assert_eq!(group.public_key().coefficients()[0], first_public_key);
        assert_eq!(group.public_key().coefficients().len(), 6);
        group_hashes.push(group.hash());
    }
    group_hashes.dedup();
    assert_eq!(group_hashes.len(), 1);

    // The leavers dropped out silently at kick-off.
    for node in &nodes[8..] {
        let state = node.state().await?;
        assert_eq!(state.status(), Status::Left);
    }

    let completion = completions.recv().await?;
    assert_eq!(
        completion.old.map(|old| old.epoch()),
        Some(1),
    );
    assert_eq!(completion.new.epoch(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_leader_times_followers_out_and_may_retry() -> TestResult<()> {
    let mesh = Arc::new(MeshRpc::default());
    let nodes = spawn_committee(&mesh, 3, 9300)?;
    let leader = &nodes[0];
    let joining: Vec<Identity> = nodes.iter().map(|node| node.identity().clone()).collect();

    let mut options = first_options(joining.clone(), 2);
    options.timeout = SystemTime::now() + Duration::from_millis(600);
    leader.process.initial(BEACON_ID, options).await?;

    // The leader drops off the network; joins are local, so the followers
    // only notice once the timeout has passed.
    let _leader_process = mesh
        .disconnect(leader.identity().address())
        .ok_or_else(|| eyre!("leader was not registered"))?;
    for node in &nodes[1..] {
        node.process.join(BEACON_ID, None).await?;
    }

    tokio::time::sleep(Duration::from_millis(800)).await;
    for node in &nodes[1..] {
        assert_eq!(node.state().await?.status(), Status::TimedOut);
    }

    // Back online, the leader retries the same epoch with a fresh timeout.
    mesh.register(leader.identity().address(), leader.process.clone());
    leader
        .process
        .initial(BEACON_ID, first_options(joining, 2))
        .await?;

    assert_eq!(leader.state().await?.status(), Status::Proposing);
    for node in &nodes[1..] {
        let state = node.state().await?;
        assert_eq!(state.status(), Status::Proposed);
        assert_eq!(state.epoch(), 1);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rejection_reaches_the_leader() -> TestResult<()> {
    let mesh = Arc::new(MeshRpc::default());
    let nodes = spawn_committee(&mesh, 4, 9400)?;
    run_first_epoch(&nodes, 3).await?;

    let remaining: Vec<Identity> = nodes.iter().map(|node| node.identity().clone()).collect();
    nodes[0]
        .process
        .resharing(
            BEACON_ID,
            ProposalOptions {
                timeout: SystemTime::now() + Duration::from_secs(30),
                threshold: 3,
                catchup_period: Duration::from_secs(5),
                joining: vec![],
                remaining,
                leaving: vec![],
            },
        )
        .await?;

    nodes[1].process.accept(BEACON_ID).await?;
    nodes[2].process.reject(BEACON_ID).await?;

    let leader_state = nodes[0].state().await?;
    assert_eq!(leader_state.acceptors().len(), 1);
    assert_eq!(leader_state.rejectors().len(), 1);
    assert_eq!(nodes[2].state().await?.status(), Status::Rejected);
    Ok(())
}
