use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};
use ntuple_descriptor::DescriptorId;
use ntuple_error::{NTupleResult, ResultExt, ntuple_err};
use ntuple_metrics::{Counter, Histogram, NTupleMetrics, Timer, as_count, timed};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{Cluster, ClusterLoader};

type LoadResult = NTupleResult<Arc<Cluster>>;

/// State of a load request shared between the requester and the I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Loading,
    Done,
    /// Nobody waits for the cluster anymore; whatever the load puts into the page pool must go.
    Expired,
}

struct LoadRequest {
    cluster_id: DescriptorId,
    columns: Vec<DescriptorId>,
    progress: Arc<Mutex<Progress>>,
    reply: flume::Sender<LoadResult>,
}

struct InFlight {
    columns: FxHashSet<DescriptorId>,
    progress: Arc<Mutex<Progress>>,
    reply: flume::Receiver<LoadResult>,
}

struct PoolCounters {
    n_cluster_scheduled: Arc<Counter>,
    n_cluster_expired: Arc<Counter>,
    n_cluster_evicted: Arc<Counter>,
    n_in_flight: Arc<Histogram>,
    time_wall_wait: Arc<Timer>,
}

impl PoolCounters {
    fn new(metrics: &NTupleMetrics) -> Self {
        Self {
            n_cluster_scheduled: metrics.counter("n_cluster_scheduled"),
            n_cluster_expired: metrics.counter("n_cluster_expired"),
            n_cluster_evicted: metrics.counter("n_cluster_evicted"),
            n_in_flight: metrics.histogram("n_in_flight"),
            time_wall_wait: metrics.timer("time_wall_wait"),
        }
    }
}

/// Reads clusters ahead of their use on a dedicated I/O thread.
///
/// Requesting a cluster schedules it together with the clusters that follow it, up to the
/// window size, and blocks until the requested one is loaded (and unzipped, if the loader has a
/// task scheduler). The pool keeps the requested cluster and its predecessor; clusters falling
/// out of that window are evicted from the loader, including those still in flight.
///
/// The pool reports its counters in a child of the metrics it is created with.
pub struct ClusterPool {
    loader: Arc<dyn ClusterLoader>,
    window: usize,
    requests: Option<flume::Sender<LoadRequest>>,
    io_thread: Option<JoinHandle<()>>,
    in_flight: Mutex<FxHashMap<DescriptorId, InFlight>>,
    ready: Mutex<BTreeMap<DescriptorId, Arc<Cluster>>>,
    counters: PoolCounters,
}

impl ClusterPool {
    pub fn new(loader: Arc<dyn ClusterLoader>, window: usize, metrics: &NTupleMetrics) -> NTupleResult<Self> {
        let metrics = metrics.child_with_tags([("component", "cluster_pool")]);
        let counters = PoolCounters::new(&metrics);
        let n_expired = Arc::clone(&counters.n_cluster_expired);

        let (requests, rx) = flume::unbounded::<LoadRequest>();
        let io_loader = Arc::clone(&loader);
        let io_thread = std::thread::Builder::new()
            .name("ntuple-cluster-pool".to_string())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    let cluster_id = request.cluster_id;
                    if *request.progress.lock() == Progress::Expired {
                        debug!("skipping expired request for cluster {cluster_id}");
                        continue;
                    }
                    let result = io_loader
                        .load_cluster(cluster_id, &request.columns)
                        .and_then(|cluster| {
                            io_loader.unzip_cluster(&cluster)?;
                            Ok(cluster)
                        });

                    let mut progress = request.progress.lock();
                    if *progress == Progress::Expired {
                        drop(progress);
                        debug!("evicting cluster {cluster_id} that expired while loading");
                        n_expired.inc();
                        io_loader.evict_cluster(cluster_id);
                        continue;
                    }
                    *progress = Progress::Done;
                    drop(progress);
                    // the requester may have moved on
                    request.reply.send(result).ok();
                }
            })?;

        Ok(Self {
            loader,
            window: window.max(1),
            requests: Some(requests),
            io_thread: Some(io_thread),
            in_flight: Mutex::new(FxHashMap::default()),
            ready: Mutex::new(BTreeMap::new()),
            counters,
        })
    }

    /// Number of clusters loaded ahead, including the requested one.
    pub fn window(&self) -> usize {
        self.window
    }

    /// The cluster with at least the pages of `columns`.
    pub fn get_cluster(&self, cluster_id: DescriptorId, columns: &[DescriptorId]) -> NTupleResult<Arc<Cluster>> {
        let Some(descriptor) = self.loader.descriptor() else {
            return Err(ntuple_err!(InvalidState: "cluster pool used before its source is attached"));
        };

        let mut window = Vec::with_capacity(self.window);
        let mut next = Some(cluster_id);
        while let Some(id) = next {
            if window.len() == self.window {
                break;
            }
            self.schedule(id, columns)?;
            window.push(id);
            next = descriptor.find_next_cluster_id(id);
        }

        let pending = self.in_flight.lock().remove(&cluster_id);
        let cluster = match pending {
            Some(pending) => {
                let cluster = timed(&self.counters.time_wall_wait, || pending.reply.recv())
                    .map_err(|_| ntuple_err!(InvalidState: "cluster pool I/O thread is gone"))
                    .flatten()?;
                self.ready.lock().insert(cluster_id, Arc::clone(&cluster));
                cluster
            }
            None => self
                .ready
                .lock()
                .get(&cluster_id)
                .cloned()
                .ok_or_else(|| ntuple_err!(InvalidState: "cluster {cluster_id} was neither loaded nor requested"))?,
        };

        let previous = descriptor.find_prev_cluster_id(cluster_id);
        self.trim(&window, previous);
        Ok(cluster)
    }

    /// Request a cluster unless it is ready or in flight with all of `columns`.
    fn schedule(&self, cluster_id: DescriptorId, columns: &[DescriptorId]) -> NTupleResult<()> {
        if self
            .ready
            .lock()
            .get(&cluster_id)
            .is_some_and(|c| columns.iter().all(|&id| c.contains_column(id)))
        {
            return Ok(());
        }

        let mut in_flight = self.in_flight.lock();
        let mut wanted: FxHashSet<DescriptorId> = columns.iter().copied().collect();
        if let Some(pending) = in_flight.get(&cluster_id) {
            if wanted.is_subset(&pending.columns) {
                return Ok(());
            }
            wanted.extend(pending.columns.iter().copied());
        }

        let Some(requests) = &self.requests else {
            return Err(ntuple_err!(InvalidState: "cluster pool is shut down"));
        };
        let (reply, receiver) = flume::bounded(1);
        let progress = Arc::new(Mutex::new(Progress::Loading));
        requests
            .send(LoadRequest {
                cluster_id,
                columns: wanted.iter().copied().collect(),
                progress: Arc::clone(&progress),
                reply,
            })
            .map_err(|_| ntuple_err!(InvalidState: "cluster pool I/O thread is gone"))?;
        debug!("scheduled cluster {cluster_id} with {} columns", wanted.len());
        self.counters.n_cluster_scheduled.inc();
        in_flight.insert(
            cluster_id,
            InFlight {
                columns: wanted,
                progress,
                reply: receiver,
            },
        );
        self.counters.n_in_flight.update(as_count(in_flight.len()));
        Ok(())
    }

    fn trim(&self, window: &[DescriptorId], previous: Option<DescriptorId>) {
        let keep = |id: &DescriptorId| window.contains(id) || Some(*id) == previous;

        let mut evicted = Vec::new();
        self.ready.lock().retain(|id, _| {
            let kept = keep(id);
            if !kept {
                evicted.push(*id);
            }
            kept
        });
        let dropped = {
            let mut in_flight = self.in_flight.lock();
            let stale = in_flight.keys().copied().filter(|id| !keep(id)).collect::<Vec<_>>();
            stale
                .into_iter()
                .filter_map(|id| in_flight.remove(&id).map(|pending| (id, pending)))
                .collect::<Vec<_>>()
        };
        evicted.extend(Self::expire(dropped));
        self.evict(evicted);
    }

    /// Expire in-flight requests nobody waits for anymore. Returns the clusters that finished
    /// loading and must be evicted by the caller; the I/O thread evicts the others.
    fn expire(dropped: impl IntoIterator<Item = (DescriptorId, InFlight)>) -> Vec<DescriptorId> {
        let mut done = Vec::new();
        for (id, pending) in dropped {
            let mut progress = pending.progress.lock();
            match *progress {
                Progress::Done => done.push(id),
                Progress::Loading => {
                    debug!("expiring in-flight cluster {id}");
                    *progress = Progress::Expired;
                }
                Progress::Expired => {}
            }
        }
        done
    }

    fn evict(&self, clusters: Vec<DescriptorId>) {
        for id in clusters {
            debug!("evicting cluster {id}");
            self.counters.n_cluster_evicted.inc();
            self.loader.evict_cluster(id);
        }
    }
}

impl Drop for ClusterPool {
    fn drop(&mut self) {
        let dropped = std::mem::take(self.in_flight.get_mut());
        let done = Self::expire(dropped);
        self.evict(done);
        drop(self.requests.take());
        let Some(thread) = self.io_thread.take() else {
            return;
        };
        if thread.join().is_err() {
            warn!("cluster pool I/O thread exited with a panic");
        }
    }
}
