//! Size-classed pool of reusable byte buffers.
//!
//! Both audio pipelines acquire scratch buffers per frame; pooling keeps
//! the steady state allocation-free. Buffers are tracked per size class,
//! zeroed on release, and shed under memory pressure. The pool never
//! fails: a cold acquire allocates, a bad release is a warning.

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::BufferPoolConfig;
use crate::protocol_constants::{
    POOL_COMMON_SIZES, POOL_IDLE_CLASS_SECS, POOL_MAINTENANCE_INTERVAL_SECS,
};

/// Source of process memory pressure in the range 0.0 (idle) to 1.0 (full).
///
/// Injected so tests can drive the discard path deterministically.
pub trait MemoryPressure: Send + Sync {
    fn pressure(&self) -> f64;
}

/// Pressure source that always reports zero. Default for tests and
/// platforms without a meminfo surface.
pub struct NoPressure;

impl MemoryPressure for NoPressure {
    fn pressure(&self) -> f64 {
        0.0
    }
}

/// Linux pressure source backed by `/proc/meminfo`.
///
/// Reports `1 - MemAvailable/MemTotal`; any read or parse failure
/// reports zero rather than poisoning the release path.
pub struct ProcMeminfoPressure;

impl MemoryPressure for ProcMeminfoPressure {
    fn pressure(&self) -> f64 {
        let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else {
            return 0.0;
        };
        let field = |name: &str| -> Option<f64> {
            contents
                .lines()
                .find(|line| line.starts_with(name))?
                .split_whitespace()
                .nth(1)?
                .parse()
                .ok()
        };
        match (field("MemTotal:"), field("MemAvailable:")) {
            (Some(total), Some(available)) if total > 0.0 => {
                (1.0 - available / total).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }
}

/// A buffer checked out of the pool.
///
/// Owned by the acquirer until handed back via [`BufferPool::release`].
/// Dropping it without releasing simply abandons the allocation; the
/// pool logs the dangling tracking entry away on the next maintenance
/// pass for its class.
pub struct PooledBuffer {
    data: Vec<u8>,
    id: u64,
}

impl PooledBuffer {
    /// Stable identity of this checkout, used for in-use tracking.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// One size class: an available stack plus the set of checked-out ids.
struct SizeClass {
    available: Mutex<Vec<Vec<u8>>>,
    in_use: Mutex<HashSet<u64>>,
    last_access: Mutex<Instant>,
}

impl SizeClass {
    fn new() -> Self {
        Self {
            available: Mutex::new(Vec::new()),
            in_use: Mutex::new(HashSet::new()),
            last_access: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }
}

/// Pool statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub acquisitions: u64,
    pub releases: u64,
    pub hits: u64,
    pub misses: u64,
    pub classes: Vec<SizeClassStats>,
    pub total_bytes: usize,
}

/// Per-size-class statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeClassStats {
    pub size: usize,
    pub available: usize,
    pub in_use: usize,
}

/// Process-wide, size-classed buffer pool.
pub struct BufferPool {
    classes: DashMap<usize, SizeClass>,
    config: BufferPoolConfig,
    pressure: Arc<dyn MemoryPressure>,
    next_id: AtomicU64,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    /// Creates a pool with the given sizing and pressure source.
    pub fn new(config: BufferPoolConfig, pressure: Arc<dyn MemoryPressure>) -> Self {
        Self {
            classes: DashMap::new(),
            config,
            pressure,
            next_id: AtomicU64::new(1),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Acquires a buffer of exactly `len` bytes.
    ///
    /// Reused buffers are zero-filled (zeroing happens on release);
    /// fresh allocations are zero-filled by construction.
    pub fn acquire(&self, len: usize) -> PooledBuffer {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let class = self.classes.entry(len).or_insert_with(SizeClass::new);
        class.touch();

        let data = class.available.lock().pop();
        let data = match data {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![0u8; len]
            }
        };
        class.in_use.lock().insert(id);

        PooledBuffer { data, id }
    }

    /// Returns a buffer to the pool.
    ///
    /// Unknown buffers are logged and discarded. Pools at capacity and
    /// releases under memory pressure discard instead of retaining; high
    /// pressure additionally sheds half of every class's available stack.
    pub fn release(&self, buffer: PooledBuffer) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        let PooledBuffer { mut data, id } = buffer;

        let Some(class) = self.classes.get(&data.len()) else {
            log::warn!(
                "[Pool] Release of untracked buffer: len={}, id={}",
                data.len(),
                id
            );
            return;
        };

        if !class.in_use.lock().remove(&id) {
            log::warn!(
                "[Pool] Release of buffer not checked out: len={}, id={}",
                data.len(),
                id
            );
            return;
        }
        class.touch();

        if self.pressure.pressure() >= self.config.memory_pressure_threshold {
            drop(class);
            self.shed_half();
            return;
        }

        let mut available = class.available.lock();
        if available.len() >= self.config.max_size {
            return;
        }
        data.fill(0);
        available.push(data);
    }

    /// Drops half of every class's available buffers.
    fn shed_half(&self) {
        for class in self.classes.iter() {
            let mut available = class.available.lock();
            let keep = available.len() / 2;
            available.truncate(keep);
        }
    }

    /// Maintenance pass: trims each class down to the configured initial
    /// size and removes uncommon classes idle for five minutes.
    pub fn maintain(&self) {
        let idle_cutoff = Duration::from_secs(POOL_IDLE_CLASS_SECS);

        for class in self.classes.iter() {
            let mut available = class.available.lock();
            if available.len() > self.config.initial_size {
                available.truncate(self.config.initial_size);
            }
        }

        self.classes.retain(|size, class| {
            if POOL_COMMON_SIZES.contains(size) {
                return true;
            }
            let idle = class.last_access.lock().elapsed() >= idle_cutoff;
            if idle {
                let abandoned = class.in_use.lock().len();
                if abandoned > 0 {
                    log::warn!(
                        "[Pool] Dropping idle class {} with {} unreleased buffers",
                        size,
                        abandoned
                    );
                }
                log::debug!("[Pool] Dropping idle size class {}", size);
            }
            !idle
        });
    }

    /// Spawns the periodic maintenance task. Not started under `cfg(test)`;
    /// tests call [`BufferPool::maintain`] directly.
    pub fn start_maintenance(self: &Arc<Self>) {
        if cfg!(test) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(POOL_MAINTENANCE_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.maintain();
            }
        });
    }

    /// Snapshot of pool counters and per-class occupancy.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut classes = Vec::with_capacity(self.classes.len());
        let mut total_bytes = 0usize;
        for entry in self.classes.iter() {
            let size = *entry.key();
            let available = entry.available.lock().len();
            let in_use = entry.in_use.lock().len();
            total_bytes += size * (available + in_use);
            classes.push(SizeClassStats {
                size,
                available,
                in_use,
            });
        }
        classes.sort_by_key(|c| c.size);
        PoolStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            classes,
            total_bytes,
        }
    }

    /// Total buffers currently checked out across all classes.
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.classes
            .iter()
            .map(|class| class.in_use.lock().len())
            .sum()
    }
}
