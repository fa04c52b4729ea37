// Key-Sharded Driver
//
// Parallelises the engine across keys while keeping every key on a single
// logical task. Elements route to a worker by key hash; clock advances
// broadcast to every worker. Cancellation is cooperative: the in-flight
// event completes, state persists, and the remaining queue is abandoned.

use super::{WindowingEngine, WindowingStrategy};
use crate::error::{Result, StreamError};
use crate::reduce::ReduceFn;
use crate::state::StateBackend;
use crate::time::Timestamp;
use crate::value::{StreamKey, StreamValue};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for the sharded driver.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Number of worker threads, each owning a disjoint set of keys.
    pub workers: usize,

    /// Log a warning when a single event runs longer than this. The driver
    /// itself imposes no deadline.
    pub soft_timeout: Duration,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            soft_timeout: Duration::from_secs(10),
        }
    }
}

impl ShardConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(StreamError::Configuration(
                "shard worker count must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Command {
    Element { key: StreamKey, value: StreamValue, ts: Timestamp },
    AdvanceWatermark(Timestamp),
    AdvanceProcessingTime(Timestamp),
    Persist,
    Shutdown,
}

/// Hash-partitioned pool of engine workers.
pub struct ShardedDriver {
    senders: Vec<Sender<Command>>,
    handles: Vec<JoinHandle<Result<()>>>,
    cancelled: Arc<AtomicBool>,
}

impl ShardedDriver {
    /// Spawn one engine per worker via the factory.
    pub fn start<B, F>(config: ShardConfig, mut engine_factory: F) -> Result<Self>
    where
        B: StateBackend + 'static,
        F: FnMut(usize) -> Result<WindowingEngine<B>>,
    {
        config.validate()?;
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut senders = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);
        for shard in 0..config.workers {
            let engine = engine_factory(shard)?;
            let (sender, receiver) = unbounded();
            let worker_cancelled = cancelled.clone();
            let soft_timeout = config.soft_timeout;
            handles.push(std::thread::spawn(move || {
                run_worker(shard, engine, receiver, worker_cancelled, soft_timeout)
            }));
            senders.push(sender);
        }

        Ok(Self { senders, handles, cancelled })
    }

    /// Convenience constructor building identical engines from a strategy.
    pub fn with_strategy<B, FB>(
        config: ShardConfig,
        strategy: WindowingStrategy,
        reduce_fn: ReduceFn,
        mut parts: FB,
    ) -> Result<Self>
    where
        B: StateBackend + 'static,
        FB: FnMut(usize) -> (B, Box<dyn crate::sink::OutputSink>),
    {
        Self::start(config, |shard| {
            let (backend, sink) = parts(shard);
            WindowingEngine::new(strategy.clone(), reduce_fn.clone(), backend, sink)
        })
    }

    fn shard_for(&self, key: &StreamKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.as_str().hash(&mut hasher);
        (hasher.finish() as usize) % self.senders.len()
    }

    /// Route one element to its key's worker.
    pub fn submit(&self, key: StreamKey, value: StreamValue, ts: Timestamp) -> Result<()> {
        let shard = self.shard_for(&key);
        self.senders[shard]
            .send(Command::Element { key, value, ts })
            .map_err(|_| StreamError::InvalidOperation("driver is shut down".to_string()))
    }

    /// Broadcast a watermark advance to every worker.
    pub fn advance_input_watermark(&self, to: Timestamp) -> Result<()> {
        self.broadcast(|| Command::AdvanceWatermark(to))
    }

    pub fn advance_processing_time(&self, to: Timestamp) -> Result<()> {
        self.broadcast(|| Command::AdvanceProcessingTime(to))
    }

    /// Ask every worker to flush pending state.
    pub fn persist(&self) -> Result<()> {
        self.broadcast(|| Command::Persist)
    }

    fn broadcast<F: Fn() -> Command>(&self, command: F) -> Result<()> {
        for sender in &self.senders {
            sender
                .send(command())
                .map_err(|_| StreamError::InvalidOperation("driver is shut down".to_string()))?;
        }
        Ok(())
    }

    /// Cooperative cancellation: each worker finishes its current event,
    /// persists, and abandons whatever is still queued.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Drain every queued command, then stop the workers.
    pub fn shutdown(self) -> Result<()> {
        for sender in &self.senders {
            // A send failure means the worker already stopped.
            let _ = sender.send(Command::Shutdown);
        }
        drop(self.senders);
        for handle in self.handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(StreamError::Internal("shard worker panicked".to_string()))
                }
            }
        }
        Ok(())
    }
}

fn run_worker<B: StateBackend>(
    shard: usize,
    mut engine: WindowingEngine<B>,
    receiver: Receiver<Command>,
    cancelled: Arc<AtomicBool>,
    soft_timeout: Duration,
) -> Result<()> {
    let mut keys: HashSet<StreamKey> = HashSet::new();

    for command in receiver.iter() {
        if cancelled.load(Ordering::SeqCst) {
            debug!(shard, "cancelled; persisting and abandoning queue");
            for key in &keys {
                engine.persist(key)?;
            }
            return Ok(());
        }

        let started = Instant::now();
        let label = match &command {
            Command::Element { .. } => "element",
            Command::AdvanceWatermark(_) => "watermark",
            Command::AdvanceProcessingTime(_) => "processing-time",
            Command::Persist => "persist",
            Command::Shutdown => "shutdown",
        };

        let outcome = match command {
            Command::Element { key, value, ts } => {
                keys.insert(key.clone());
                engine.process_element(&key, value, ts)
            }
            Command::AdvanceWatermark(to) => engine.advance_input_watermark(to),
            Command::AdvanceProcessingTime(to) => engine.advance_processing_time(to),
            Command::Persist => keys.iter().try_for_each(|key| engine.persist(key)),
            Command::Shutdown => {
                debug!(shard, "shutting down");
                for key in &keys {
                    engine.persist(key)?;
                }
                return Ok(());
            }
        };
        if let Err(error) = outcome {
            // Abandon the event but keep whatever state it completed.
            warn!(shard, event = label, error = %error, "event failed; persisting and stopping");
            for key in &keys {
                let _ = engine.persist(key);
            }
            return Err(error);
        }

        let elapsed = started.elapsed();
        if elapsed > soft_timeout {
            warn!(shard, event = label, elapsed_ms = elapsed.as_millis() as u64, "event exceeded soft timeout");
        }
    }
    Ok(())
}
