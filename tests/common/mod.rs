#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quorum::network::LocalNetwork;
use quorum::raft::{ApplyMsg, Raft, RaftConfig, RaftError, ReplicaId};
use quorum::storage::{FileStorage, MemStorage, Storage};
use rand::Rng;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

/// Upper end of the default election timeout range.
pub const ELECTION_CEILING: Duration = Duration::from_millis(300);

pub enum Backend {
    Memory(Vec<MemStorage>),
    File(TempDir),
}

#[derive(Default)]
struct Applied {
    // Per replica: index -> command, across restarts.
    logs: Vec<HashMap<u64, Vec<u8>>>,
    errors: Vec<String>,
}

/// A cluster of replicas joined by a `LocalNetwork`, with every applied
/// stream checked for agreement as it arrives.
pub struct Cluster {
    pub net: Arc<LocalNetwork>,
    pub n: usize,
    rafts: Vec<Option<Raft>>,
    connected: Vec<bool>,
    backend: Backend,
    pre_vote: bool,
    applied: Arc<Mutex<Applied>>,
}

impl Cluster {
    pub async fn new(n: usize) -> Self {
        Self::build(n, fresh_memory(n), false).await
    }

    pub async fn with_pre_vote(n: usize) -> Self {
        Self::build(n, fresh_memory(n), true).await
    }

    pub async fn on_disk(n: usize) -> Self {
        let dir = TempDir::new().expect("tempdir");
        Self::build(n, Backend::File(dir), false).await
    }

    async fn build(n: usize, backend: Backend, pre_vote: bool) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut cluster = Self {
            net: LocalNetwork::new(),
            n,
            rafts: vec![None; n],
            connected: vec![true; n],
            backend,
            pre_vote,
            applied: Arc::new(Mutex::new(Applied {
                logs: vec![HashMap::new(); n],
                errors: Vec::new(),
            })),
        };
        for id in 0..n {
            cluster.start(id).await;
        }
        cluster
    }

    fn open_storage(&self, id: ReplicaId) -> Box<dyn Storage> {
        match &self.backend {
            // Clones share data, so this is the same state as before a crash.
            Backend::Memory(storages) => Box::new(storages[id].clone()),
            Backend::File(dir) => Box::new(
                FileStorage::open(dir.path().join(format!("replica-{id}"))).expect("open storage"),
            ),
        }
    }

    pub fn memory(&self, id: ReplicaId) -> &MemStorage {
        match &self.backend {
            Backend::Memory(storages) => &storages[id],
            Backend::File(_) => panic!("cluster is not memory-backed"),
        }
    }

    /// Starts replica `id` from whatever its storage holds.
    pub async fn start(&mut self, id: ReplicaId) {
        self.crash(id).await;

        let mut config = RaftConfig::new(id, self.n);
        config.pre_vote = self.pre_vote;
        let (raft, rx) =
            Raft::start(config, self.open_storage(id), self.net.transport(id)).expect("start");
        self.net.register(id, raft.clone()).await;
        spawn_collector(Arc::clone(&self.applied), id, rx);
        self.rafts[id] = Some(raft);
    }

    /// Stops replica `id`. Its storage survives for a later `start`.
    pub async fn crash(&mut self, id: ReplicaId) {
        if let Some(raft) = self.rafts[id].take() {
            raft.shutdown().await;
            self.net.unregister(id).await;
        }
    }

    pub async fn disconnect(&mut self, id: ReplicaId) {
        self.connected[id] = false;
        self.net.disconnect(id).await;
    }

    pub async fn connect(&mut self, id: ReplicaId) {
        self.connected[id] = true;
        self.net.connect(id).await;
    }

    pub fn raft(&self, id: ReplicaId) -> &Raft {
        self.rafts[id].as_ref().expect("replica is running")
    }

    fn live(&self) -> impl Iterator<Item = (ReplicaId, &Raft)> + '_ {
        self.rafts
            .iter()
            .enumerate()
            .filter(|(id, _)| self.connected[*id])
            .filter_map(|(id, raft)| raft.as_ref().map(|r| (id, r)))
    }

    /// Waits for exactly one leader among connected replicas and returns it.
    pub async fn check_one_leader(&self) -> ReplicaId {
        for _ in 0..10 {
            let pause = rand::rng().random_range(450..550);
            sleep(Duration::from_millis(pause)).await;

            let mut leaders: BTreeMap<u64, Vec<ReplicaId>> = BTreeMap::new();
            for (id, raft) in self.live() {
                let (term, is_leader) = raft.get_role().await;
                if is_leader {
                    leaders.entry(term).or_default().push(id);
                }
            }
            for (term, ids) in &leaders {
                assert!(ids.len() <= 1, "term {term} has {} leaders: {ids:?}", ids.len());
            }
            if let Some((_, ids)) = leaders.iter().next_back() {
                return ids[0];
            }
        }
        panic!("expected one leader, got none");
    }

    /// The leader with the highest term among connected replicas, if any,
    /// without waiting.
    pub async fn leader_now(&self) -> Option<ReplicaId> {
        let mut best: Option<(u64, ReplicaId)> = None;
        for (id, raft) in self.live() {
            let (term, is_leader) = raft.get_role().await;
            if is_leader && best.map_or(true, |(t, _)| term > t) {
                best = Some((term, id));
            }
        }
        best.map(|(_, id)| id)
    }

    /// All connected replicas agree on the current term.
    pub async fn check_terms(&self) -> u64 {
        let mut term = None;
        for (_, raft) in self.live() {
            let (t, _) = raft.get_role().await;
            match term {
                None => term = Some(t),
                Some(seen) => assert_eq!(seen, t, "replicas disagree on term"),
            }
        }
        term.expect("no live replicas")
    }

    pub async fn check_no_leader(&self) {
        for (id, raft) in self.live() {
            let (_, is_leader) = raft.get_role().await;
            assert!(!is_leader, "replica {id} is leader but should not be");
        }
    }

    /// How many replicas have applied `index`, and the command there.
    pub fn n_committed(&self, index: u64) -> (usize, Option<Vec<u8>>) {
        self.check_safety();
        let applied = self.applied.lock().unwrap();
        let mut count = 0;
        let mut command = None;
        for log in &applied.logs {
            if let Some(cmd) = log.get(&index) {
                count += 1;
                command = Some(cmd.clone());
            }
        }
        (count, command)
    }

    pub fn check_safety(&self) {
        let applied = self.applied.lock().unwrap();
        assert!(applied.errors.is_empty(), "apply errors: {:?}", applied.errors);
    }

    /// Submits `cmd` until some leader commits it on at least `expected`
    /// replicas, and returns its index.
    pub async fn one(&self, cmd: &[u8], expected: usize, retry: bool) -> u64 {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut starts = 0;
        while Instant::now() < deadline {
            let mut index = None;
            for offset in 0..self.n {
                let id = (starts + offset) % self.n;
                if !self.connected[id] {
                    continue;
                }
                let Some(raft) = &self.rafts[id] else {
                    continue;
                };
                if let Ok(proposal) = raft.submit(cmd.to_vec()).await {
                    starts = id;
                    index = Some(proposal.index);
                    break;
                }
            }
            starts = (starts + 1) % self.n;

            if let Some(index) = index {
                let wait_until = Instant::now() + Duration::from_secs(2);
                while Instant::now() < wait_until {
                    let (count, got) = self.n_committed(index);
                    if count >= expected && got.as_deref() == Some(cmd) {
                        return index;
                    }
                    sleep(Duration::from_millis(20)).await;
                }
                if !retry {
                    panic!("command {:?} failed to reach agreement", String::from_utf8_lossy(cmd));
                }
            } else {
                sleep(Duration::from_millis(50)).await;
            }
        }
        panic!("command {:?} failed to reach agreement", String::from_utf8_lossy(cmd));
    }

    /// Waits for at least `n` replicas to apply `index`.
    pub async fn wait(&self, index: u64, n: usize) -> Option<Vec<u8>> {
        let mut pause = Duration::from_millis(10);
        for _ in 0..30 {
            let (count, _) = self.n_committed(index);
            if count >= n {
                break;
            }
            sleep(pause).await;
            pause = (pause * 2).min(Duration::from_secs(1));
        }
        let (count, command) = self.n_committed(index);
        assert!(count >= n, "only {count} replicas applied index {index}, wanted {n}");
        command
    }

    pub async fn submit(&self, id: ReplicaId, cmd: &[u8]) -> Result<u64, RaftError> {
        self.raft(id).submit(cmd.to_vec()).await.map(|p| p.index)
    }

    pub async fn shutdown(mut self) {
        for id in 0..self.n {
            self.crash(id).await;
        }
        self.net.clear().await;
        self.check_safety();
    }
}

// One independent store per replica; `vec![x; n]` would share a single one.
fn fresh_memory(n: usize) -> Backend {
    Backend::Memory((0..n).map(|_| MemStorage::new()).collect())
}

fn spawn_collector(
    applied: Arc<Mutex<Applied>>,
    id: ReplicaId,
    mut rx: mpsc::UnboundedReceiver<ApplyMsg>,
) {
    tokio::spawn(async move {
        // Each run of a replica applies from index 1 again.
        let mut next = 1;
        while let Some(msg) = rx.recv().await {
            let mut applied = applied.lock().unwrap();
            if msg.index != next {
                applied.errors.push(format!(
                    "replica {id} applied {} out of order (expected {next})",
                    msg.index
                ));
            }
            next = msg.index + 1;

            let conflict = applied.logs.iter().enumerate().find_map(|(other, log)| {
                log.get(&msg.index)
                    .filter(|cmd| **cmd != msg.command)
                    .map(|_| other)
            });
            if let Some(other) = conflict {
                applied.errors.push(format!(
                    "replica {id} applied a different command at index {} than replica {other}",
                    msg.index
                ));
            }
            applied.logs[id].insert(msg.index, msg.command);
        }
    });
}
