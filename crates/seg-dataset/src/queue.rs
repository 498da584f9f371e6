//! Multi-threaded shuffling queue feeding training batches.
//!
//! Worker threads pull samples from their own [`SampleSource`] and push them
//! into a bounded channel. The consumer keeps a shuffle buffer and only
//! draws a batch once `min_after_dequeue + batch_size` samples are
//! available, so consecutive batches mix samples from all workers.

use crossbeam_channel::{bounded, Receiver, Sender};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use seg_core::{Batch, Error, ExperimentConfig, Result, Sample};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::augmentation::{FlipConfig, PairedAugmenter};
use crate::loader::{ImagePairLoader, SampleSource};

/// Anything that can hand the trainer a stream of batches.
pub trait BatchSource {
    /// Blocks until the next batch is ready.
    fn next_batch(&mut self) -> Result<Batch>;

    /// Stops producers and waits for them to exit.
    fn shutdown(&mut self) -> Result<()>;
}

/// Sizing of the shuffle queue, in samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub batch_size: usize,
    pub capacity: usize,
    pub min_after_dequeue: usize,
    pub num_threads: usize,
    pub augment: Option<FlipConfig>,
}

impl QueueOptions {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        let batch = config.training.batch_size;
        let queue = &config.data.queue;
        Self {
            batch_size: batch,
            capacity: queue.capacity_batches * batch,
            min_after_dequeue: queue.min_after_dequeue_batches * batch,
            num_threads: queue.num_threads,
            augment: config.data.distort.then(FlipConfig::default),
        }
    }
}

/// Stop flag plus the worker handles.
pub struct Coordinator {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl Coordinator {
    fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Joins every worker and returns the first error any of them hit.
    pub fn join(&mut self) -> Result<()> {
        let mut first_error = None;
        for (idx, handle) in self.handles.drain(..).enumerate() {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(Error::Dataset(format!("data worker {} panicked", idx))),
            };
            if let Err(e) = outcome {
                warn!("Data worker {} stopped with error: {}", idx, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn spawn(&mut self, idx: usize, mut source: Box<dyn SampleSource>, tx: Sender<Result<Sample>>) -> Result<()> {
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name(format!("data-worker-{}", idx))
            .spawn(move || -> Result<()> {
                while !stop.load(Ordering::SeqCst) {
                    match source.next_sample() {
                        Ok(sample) => {
                            if tx.send(Ok(sample)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(Error::Dataset(format!("data worker {} failed: {}", idx, e))));
                            return Err(e);
                        }
                    }
                }
                debug!("Data worker {} exiting", idx);
                Ok(())
            })?;
        self.handles.push(handle);
        Ok(())
    }
}

/// Random-shuffle batch queue backed by worker threads.
pub struct ShuffleQueue {
    rx: Option<Receiver<Result<Sample>>>,
    buffer: Vec<Sample>,
    options: QueueOptions,
    rng: ChaCha8Rng,
    augmenter: Option<PairedAugmenter>,
    coordinator: Coordinator,
}

impl ShuffleQueue {
    /// Starts one worker per source.
    pub fn start(sources: Vec<Box<dyn SampleSource>>, options: QueueOptions, seed: u64) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::InvalidArgument("queue needs at least one sample source".to_string()));
        }
        if options.batch_size == 0 {
            return Err(Error::InvalidArgument("batch size must be positive".to_string()));
        }

        let (tx, rx) = bounded(options.capacity.max(options.batch_size));
        let mut coordinator = Coordinator::new();
        let num_sources = sources.len();
        for (idx, source) in sources.into_iter().enumerate() {
            coordinator.spawn(idx, source, tx.clone())?;
        }
        info!(
            "Started {} data workers (capacity {}, min after dequeue {})",
            num_sources, options.capacity, options.min_after_dequeue
        );

        Ok(Self {
            rx: Some(rx),
            buffer: Vec::with_capacity(options.min_after_dequeue + options.batch_size),
            options,
            rng: ChaCha8Rng::seed_from_u64(seed),
            augmenter: options
                .augment
                .map(|flips| PairedAugmenter::new(flips, seed.wrapping_add(1))),
            coordinator,
        })
    }

    /// Starts `num_threads` workers over the training split.
    pub fn from_loader(loader: &ImagePairLoader, config: &ExperimentConfig) -> Result<Self> {
        let options = QueueOptions::from_config(config);
        let workers = options.num_threads.max(1);
        let sources = (0..workers)
            .map(|w| loader.training_source(config, w, workers))
            .collect::<Result<Vec<_>>>()?;
        Self::start(sources, options, config.seed)
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn fill(&mut self, rx: &Receiver<Result<Sample>>) -> Result<()> {
        let target = self.options.min_after_dequeue + self.options.batch_size;
        while self.buffer.len() < target {
            match rx.recv() {
                Ok(Ok(sample)) => self.buffer.push(sample),
                Ok(Err(e)) => return Err(e),
                // every worker has exited
                Err(_) => break,
            }
        }
        Ok(())
    }
}

impl BatchSource for ShuffleQueue {
    fn next_batch(&mut self) -> Result<Batch> {
        let rx = match self.rx.take() {
            Some(rx) => rx,
            None => return Err(Error::Dataset("batch queue has been shut down".to_string())),
        };
        let filled = self.fill(&rx);
        self.rx = Some(rx);
        filled?;

        if self.buffer.len() < self.options.batch_size {
            return Err(Error::Dataset(format!(
                "batch queue ran dry with {} buffered samples",
                self.buffer.len()
            )));
        }

        let mut samples = Vec::with_capacity(self.options.batch_size);
        for _ in 0..self.options.batch_size {
            let idx = self.rng.gen_range(0..self.buffer.len());
            samples.push(self.buffer.swap_remove(idx));
        }
        let mut batch = Batch::from_samples(samples)?;
        if let Some(augmenter) = self.augmenter.as_mut() {
            augmenter.augment_batch(&mut batch);
        }
        Ok(batch)
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.rx.is_none() && self.coordinator.handles.is_empty() {
            return Ok(());
        }
        self.coordinator.request_stop();
        // dropping the receiver unblocks workers waiting on a full channel
        self.rx = None;
        self.buffer.clear();
        let result = self.coordinator.join();
        info!("Batch queue shut down");
        result
    }
}

impl Drop for ShuffleQueue {
    fn drop(&mut self) {
        if !self.coordinator.should_stop() {
            let _ = self.shutdown();
        }
    }
}

/// Serves a fixed list of batches in order, cycling when exhausted.
pub struct FixedBatches {
    batches: Vec<Batch>,
    cursor: usize,
    closed: bool,
}

impl FixedBatches {
    pub fn new(batches: Vec<Batch>) -> Result<Self> {
        if batches.is_empty() {
            return Err(Error::InvalidArgument("need at least one batch".to_string()));
        }
        Ok(Self {
            batches,
            cursor: 0,
            closed: false,
        })
    }
}

impl BatchSource for FixedBatches {
    fn next_batch(&mut self) -> Result<Batch> {
        if self.closed {
            return Err(Error::Dataset("batch source has been shut down".to_string()));
        }
        let batch = self.batches[self.cursor % self.batches.len()].clone();
        self.cursor += 1;
        Ok(batch)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::InMemorySource;

    struct FailingSource {
        remaining: usize,
    }

    impl SampleSource for FailingSource {
        fn next_sample(&mut self) -> Result<Sample> {
            if self.remaining == 0 {
                return Err(Error::Image("corrupt record".to_string()));
            }
            self.remaining -= 1;
            Sample::new(vec![0.0; 4], vec![0; 4], 2)
        }
    }

    fn tagged_samples(tag: f32, count: usize) -> Vec<Sample> {
        (0..count)
            .map(|i| Sample::new(vec![tag + i as f32; 4], vec![1, 0, 0, 1], 2).unwrap())
            .collect()
    }

    fn options(batch_size: usize, min_after_dequeue: usize) -> QueueOptions {
        QueueOptions {
            batch_size,
            capacity: 16,
            min_after_dequeue,
            num_threads: 2,
            augment: None,
        }
    }

    #[test]
    fn test_options_from_config() {
        let mut config = ExperimentConfig::default();
        config.training.batch_size = 4;
        config.data.distort = true;
        let opts = QueueOptions::from_config(&config);
        assert_eq!(opts.capacity, 300);
        assert_eq!(opts.min_after_dequeue, 120);
        assert_eq!(opts.num_threads, 6);
        assert!(opts.augment.is_some());
    }

    #[test]
    fn test_queue_produces_batches() {
        let sources: Vec<Box<dyn SampleSource>> = vec![
            Box::new(InMemorySource::new(tagged_samples(0.0, 3)).unwrap()),
            Box::new(InMemorySource::new(tagged_samples(100.0, 3)).unwrap()),
        ];
        let mut queue = ShuffleQueue::start(sources, options(4, 4), 7).unwrap();
        for _ in 0..5 {
            let batch = queue.next_batch().unwrap();
            assert_eq!(batch.len, 4);
            assert_eq!(batch.shape(), [4, 1, 2, 2]);
        }
        queue.shutdown().unwrap();
        assert!(queue.next_batch().is_err());
    }

    #[test]
    fn test_worker_error_is_fatal() {
        let sources: Vec<Box<dyn SampleSource>> = vec![Box::new(FailingSource { remaining: 2 })];
        let mut queue = ShuffleQueue::start(sources, options(2, 4), 1).unwrap();
        assert!(matches!(queue.next_batch(), Err(Error::Dataset(_))));
        assert!(matches!(queue.shutdown(), Err(Error::Image(_))));
    }

    #[test]
    fn test_shutdown_unblocks_full_channel() {
        let sources: Vec<Box<dyn SampleSource>> = vec![Box::new(InMemorySource::new(tagged_samples(0.0, 2)).unwrap())];
        let mut queue = ShuffleQueue::start(sources, options(1, 0), 3).unwrap();
        queue.next_batch().unwrap();
        queue.shutdown().unwrap();
        queue.shutdown().unwrap();
    }

    #[test]
    fn test_fixed_batches_cycle() {
        let a = Batch::from_samples(tagged_samples(0.0, 1)).unwrap();
        let b = Batch::from_samples(tagged_samples(5.0, 1)).unwrap();
        let mut source = FixedBatches::new(vec![a.clone(), b]).unwrap();
        source.next_batch().unwrap();
        source.next_batch().unwrap();
        assert_eq!(source.next_batch().unwrap(), a);
        source.shutdown().unwrap();
        assert!(source.next_batch().is_err());
    }
}
