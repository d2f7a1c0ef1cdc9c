//! Bounded, cancellable, deduplicated loading of geometry assets.
//!
//! Fetches run on a fixed set of worker threads fed over a channel. Their
//! results come back on a second channel and are only installed when the
//! render thread calls [`AssetLoadQueue::poll`], so the cache has a single
//! writer. Requests beyond the worker count wait in FIFO order.
//!
//! Every request for a name shares one [`AssetTicket`] slot. `cancel_all`
//! settles pending slots as cancelled and bumps a generation counter; late
//! results from an older generation are dropped.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::AssetError;
use crate::mesh_asset::{AgentGeometry, AtomicStructure, MeshAsset};

/// Resolves an asset name to geometry. Called from worker threads.
pub trait AssetProvider: Send + Sync + 'static {
    fn fetch(&self, name: &str) -> Result<AgentGeometry, AssetError>;
}

/// Loads `.obj` meshes and `.pdb` structures from a directory.
#[derive(Debug, Clone)]
pub struct FileAssetProvider {
    root: PathBuf,
}

impl FileAssetProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetProvider for FileAssetProvider {
    fn fetch(&self, name: &str) -> Result<AgentGeometry, AssetError> {
        let path = self.root.join(name);
        let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AssetError::NotFound(name.to_string()),
            _ => AssetError::Io {
                name: name.to_string(),
                reason: e.to_string(),
            },
        })?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("obj") => Ok(AgentGeometry::Mesh(Arc::new(MeshAsset::from_obj(
                name.to_string(),
                &text,
            )?))),
            Some("pdb") => Ok(AgentGeometry::Atoms(Arc::new(AtomicStructure::from_pdb(
                name.to_string(),
                &text,
            )?))),
            _ => Err(AssetError::UnsupportedFormat(name.to_string())),
        }
    }
}

/// Final state of a request.
#[derive(Debug, Clone)]
pub enum AssetOutcome {
    Ready(AgentGeometry),
    Failed(AssetError),
    Cancelled,
}

/// Handle held by every requester of one asset name.
#[derive(Debug, Clone)]
pub struct AssetTicket {
    name: String,
    slot: Arc<OnceLock<AssetOutcome>>,
}

impl AssetTicket {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The settled outcome, or `None` while the load is pending.
    pub fn outcome(&self) -> Option<&AssetOutcome> {
        self.slot.get()
    }

    pub fn is_settled(&self) -> bool {
        self.slot.get().is_some()
    }

    pub fn geometry(&self) -> Option<&AgentGeometry> {
        match self.slot.get() {
            Some(AssetOutcome::Ready(g)) => Some(g),
            _ => None,
        }
    }

    /// Whether two tickets resolve through the same shared slot.
    pub fn shares_slot(&self, other: &AssetTicket) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

/// Cache state of one name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Queued,
    InFlight,
    Ready,
    Failed,
}

struct Entry {
    state: EntryState,
    slot: Arc<OnceLock<AssetOutcome>>,
}

struct Job {
    name: String,
    generation: u64,
}

struct Completion {
    name: String,
    generation: u64,
    result: Result<AgentGeometry, AssetError>,
}

pub struct AssetLoadQueue {
    max_workers: usize,
    entries: HashMap<String, Entry>,
    queue: VecDeque<String>,
    in_flight: usize,
    generation: u64,
    job_tx: Sender<Job>,
    done_rx: Receiver<Completion>,
}

impl AssetLoadQueue {
    /// Spawn `max_workers` fetch threads over `provider`.
    pub fn new(provider: Arc<dyn AssetProvider>, max_workers: usize) -> std::io::Result<Self> {
        let max_workers = max_workers.max(1);
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<Completion>();

        for i in 0..max_workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let provider = Arc::clone(&provider);
            thread::Builder::new()
                .name(format!("asset-worker-{}", i))
                .spawn(move || {
                    for job in job_rx.iter() {
                        let result = provider.fetch(&job.name);
                        let completion = Completion {
                            name: job.name,
                            generation: job.generation,
                            result,
                        };
                        if done_tx.send(completion).is_err() {
                            break;
                        }
                    }
                })?;
        }
        log::info!("Asset queue started with {} workers", max_workers);

        Ok(Self {
            max_workers,
            entries: HashMap::new(),
            queue: VecDeque::new(),
            in_flight: 0,
            generation: 0,
            job_tx,
            done_rx,
        })
    }

    /// Request `name`. Repeated requests share one fetch and one outcome.
    pub fn request(&mut self, name: &str) -> AssetTicket {
        if let Some(entry) = self.entries.get(name) {
            return AssetTicket {
                name: name.to_string(),
                slot: Arc::clone(&entry.slot),
            };
        }

        let slot = Arc::new(OnceLock::new());
        self.entries.insert(
            name.to_string(),
            Entry {
                state: EntryState::Queued,
                slot: Arc::clone(&slot),
            },
        );
        self.queue.push_back(name.to_string());
        log::debug!("Queued asset '{}' ({} waiting)", name, self.queue.len());
        self.pump();

        AssetTicket {
            name: name.to_string(),
            slot,
        }
    }

    /// Seed the cache with geometry that needs no fetch.
    pub fn install_local(&mut self, name: &str, geometry: AgentGeometry) {
        let slot = Arc::new(OnceLock::new());
        let _ = slot.set(AssetOutcome::Ready(geometry));
        self.entries.insert(
            name.to_string(),
            Entry {
                state: EntryState::Ready,
                slot,
            },
        );
    }

    /// Install finished fetches and start queued ones. Returns the names that
    /// settled (ready or failed) during this call.
    pub fn poll(&mut self) -> Vec<String> {
        let mut settled = Vec::new();
        while let Ok(completion) = self.done_rx.try_recv() {
            if let Some(name) = self.install(completion) {
                settled.push(name);
            }
        }
        self.pump();
        settled
    }

    /// Block until nothing is queued or in flight, or `timeout` elapses.
    /// Installs results on the calling thread like [`poll`](Self::poll).
    pub fn wait_idle(&mut self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        let mut settled = self.poll();
        while self.in_flight > 0 || !self.queue.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(completion) => {
                    if let Some(name) = self.install(completion) {
                        settled.push(name);
                    }
                    self.pump();
                }
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "Timed out waiting for assets ({} in flight, {} queued)",
                        self.in_flight,
                        self.queue.len()
                    );
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        settled
    }

    /// Cancel every queued and in-flight request. Queued names never start;
    /// in-flight results that land later are discarded. Ready and failed
    /// entries are kept.
    pub fn cancel_all(&mut self) {
        self.generation += 1;
        let queued = self.queue.len();
        self.queue.clear();

        let mut cancelled = 0;
        self.entries.retain(|_, entry| match entry.state {
            EntryState::Queued | EntryState::InFlight => {
                let _ = entry.slot.set(AssetOutcome::Cancelled);
                cancelled += 1;
                false
            }
            EntryState::Ready | EntryState::Failed => true,
        });

        if cancelled > 0 {
            log::info!(
                "Cancelled {} asset loads ({} queued, {} in flight)",
                cancelled,
                queued,
                cancelled - queued
            );
        }
    }

    /// Cancel everything, then forget all cached results.
    pub fn clear(&mut self) {
        self.cancel_all();
        self.entries.clear();
    }

    pub fn get(&self, name: &str) -> Option<&AgentGeometry> {
        self.entries.get(name).and_then(|e| match e.slot.get() {
            Some(AssetOutcome::Ready(g)) => Some(g),
            _ => None,
        })
    }

    pub fn state(&self, name: &str) -> Option<EntryState> {
        self.entries.get(name).map(|e| e.state)
    }

    /// Fetches currently running on workers, including stale ones.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    fn pump(&mut self) {
        while self.in_flight < self.max_workers {
            let Some(name) = self.queue.pop_front() else {
                break;
            };
            let job = Job {
                name: name.clone(),
                generation: self.generation,
            };
            if self.job_tx.send(job).is_err() {
                log::warn!("Asset workers are gone, failing '{}'", name);
                self.settle(&name, Err(AssetError::WorkerGone(name.clone())));
                continue;
            }
            if let Some(entry) = self.entries.get_mut(&name) {
                entry.state = EntryState::InFlight;
            }
            self.in_flight += 1;
        }
    }

    fn install(&mut self, completion: Completion) -> Option<String> {
        self.in_flight = self.in_flight.saturating_sub(1);
        if completion.generation != self.generation {
            log::debug!("Discarding stale asset '{}'", completion.name);
            return None;
        }
        self.settle(&completion.name, completion.result)
    }

    fn settle(
        &mut self,
        name: &str,
        result: Result<AgentGeometry, AssetError>,
    ) -> Option<String> {
        let entry = self.entries.get_mut(name)?;
        let (state, outcome) = match result {
            Ok(geometry) => {
                log::info!("Loaded asset '{}'", name);
                (EntryState::Ready, AssetOutcome::Ready(geometry))
            }
            Err(e) => {
                log::warn!("Asset '{}' failed, using default geometry: {}", name, e);
                (EntryState::Failed, AssetOutcome::Failed(e))
            }
        };
        entry.state = state;
        let _ = entry.slot.set(outcome);
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::mesh::create_sphere_geometry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Provider that counts fetches and can hold workers until released.
    struct GatedProvider {
        fetches: AtomicUsize,
        gate: Mutex<bool>,
        fail: bool,
    }

    impl GatedProvider {
        fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                gate: Mutex::new(open),
                fail: false,
            })
        }

        fn open(&self) {
            *self.gate.lock().unwrap() = true;
        }
    }

    impl AssetProvider for GatedProvider {
        fn fetch(&self, name: &str) -> Result<AgentGeometry, AssetError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            while !*self.gate.lock().unwrap() {
                thread::sleep(Duration::from_millis(1));
            }
            if self.fail {
                return Err(AssetError::NotFound(name.to_string()));
            }
            let (vertices, indices) = create_sphere_geometry(2, 4);
            Ok(AgentGeometry::Mesh(Arc::new(MeshAsset::new(
                name.to_string(),
                vertices,
                indices,
            ))))
        }
    }

    #[test]
    fn test_dedup_shares_one_fetch() {
        let provider = GatedProvider::new(true);
        let mut queue = AssetLoadQueue::new(provider.clone(), 4).unwrap();

        let tickets: Vec<_> = (0..100).map(|_| queue.request("mesh_A")).collect();
        queue.wait_idle(Duration::from_secs(5));

        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
        assert!(tickets.iter().all(|t| t.shares_slot(&tickets[0])));
        assert!(tickets.iter().all(|t| t.geometry().is_some()));
        assert_eq!(queue.state("mesh_A"), Some(EntryState::Ready));
    }

    #[test]
    fn test_concurrency_cap_and_fifo() {
        let provider = GatedProvider::new(false);
        let mut queue = AssetLoadQueue::new(provider.clone(), 2).unwrap();

        for name in ["a", "b", "c", "d", "e"] {
            queue.request(name);
        }
        assert_eq!(queue.in_flight(), 2);
        assert_eq!(queue.queued(), 3);
        assert_eq!(queue.state("a"), Some(EntryState::InFlight));
        assert_eq!(queue.state("b"), Some(EntryState::InFlight));
        assert_eq!(queue.state("c"), Some(EntryState::Queued));

        provider.open();
        let settled = queue.wait_idle(Duration::from_secs(5));
        assert_eq!(settled.len(), 5);
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 5);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_cancel_all_settles_queued_as_cancelled() {
        let provider = GatedProvider::new(false);
        let mut queue = AssetLoadQueue::new(provider.clone(), 1).unwrap();

        let running = queue.request("running");
        let queued: Vec<_> = ["q1", "q2", "q3"].iter().map(|n| queue.request(n)).collect();

        queue.cancel_all();
        assert!(queued.iter().all(|t| matches!(t.outcome(), Some(AssetOutcome::Cancelled))));
        assert!(matches!(running.outcome(), Some(AssetOutcome::Cancelled)));

        provider.open();
        queue.wait_idle(Duration::from_secs(5));

        // Only the in-flight fetch ever ran, and its late result was dropped
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
        assert!(queue.get("running").is_none());
        assert!(queue.state("q1").is_none());
    }

    #[test]
    fn test_failed_asset_is_not_retried() {
        let provider = Arc::new(GatedProvider {
            fetches: AtomicUsize::new(0),
            gate: Mutex::new(true),
            fail: true,
        });
        let mut queue = AssetLoadQueue::new(provider.clone(), 2).unwrap();

        queue.request("missing.obj");
        queue.wait_idle(Duration::from_secs(5));
        let again = queue.request("missing.obj");
        queue.wait_idle(Duration::from_secs(5));

        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
        assert!(matches!(again.outcome(), Some(AssetOutcome::Failed(_))));
        assert_eq!(queue.state("missing.obj"), Some(EntryState::Failed));
    }

    #[test]
    fn test_install_local_needs_no_fetch() {
        let provider = GatedProvider::new(true);
        let mut queue = AssetLoadQueue::new(provider.clone(), 1).unwrap();
        let (vertices, indices) = create_sphere_geometry(2, 4);
        let sphere = AgentGeometry::Mesh(Arc::new(MeshAsset::new("SPHERE".into(), vertices, indices)));
        queue.install_local("SPHERE", sphere);

        let ticket = queue.request("SPHERE");
        assert!(ticket.geometry().is_some());
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_file_provider_missing_file() {
        let provider = FileAssetProvider::new(std::env::temp_dir());
        let err = provider.fetch("agentvis-definitely-missing.obj").unwrap_err();
        assert_eq!(err, AssetError::NotFound("agentvis-definitely-missing.obj".into()));
    }
}
