//! Training and evaluation loops.
//!
//! Sequential training runs one graph at a time: build, forward, backward,
//! update, renew. Parallel training splits a shuffled epoch into mini-batches;
//! each rayon worker evaluates its samples on a private [`Graph`] against a
//! shared read-only [`Model`] and writes into private [`GradientBuffers`].
//! The buffers are summed, averaged and loaded into the model once every
//! worker of the batch has finished, followed by a single trainer step.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::config::TrainingConfig;
use crate::data::{DataSource, Sample};
use crate::error::{GraphError, Result};
use crate::graph::Graph;
use crate::model::{GradientBuffers, Model};
use crate::network::FeedForward;
use crate::trainer::{GradientDescentTrainer, Trainer};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub mean_loss: f32,
    pub accuracy: f32,
    pub samples: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct Tally {
    total_loss: f32,
    correct: usize,
    samples: usize,
    skipped: usize,
}

impl Tally {
    fn record(&mut self, predicted: usize, loss: f32, sample: &Sample) {
        self.total_loss += loss;
        self.samples += 1;
        if predicted == sample.class() {
            self.correct += 1;
        }
    }

    fn absorb(&mut self, other: &Tally) {
        self.total_loss += other.total_loss;
        self.correct += other.correct;
        self.samples += other.samples;
        self.skipped += other.skipped;
    }

    fn stats(&self) -> EpochStats {
        let n = self.samples.max(1) as f32;
        EpochStats {
            mean_loss: self.total_loss / n,
            accuracy: self.correct as f32 / n,
            samples: self.samples,
            skipped: self.skipped,
        }
    }
}

/// Gradients and tallies of one mini-batch.
struct BatchOutcome {
    buffers: GradientBuffers,
    tally: Tally,
}

impl BatchOutcome {
    fn empty(model: &Model) -> Self {
        BatchOutcome {
            buffers: GradientBuffers::for_model(model),
            tally: Tally::default(),
        }
    }

    fn merge(mut self, other: BatchOutcome) -> Result<Self> {
        self.buffers = self.buffers.merge(&other.buffers)?;
        self.tally.absorb(&other.tally);
        Ok(self)
    }
}

fn worker_sample(model: &Model, network: &FeedForward, data: &(dyn DataSource + Sync), index: usize) -> Result<BatchOutcome> {
    let mut outcome = BatchOutcome::empty(model);
    let sample = data.sample(index)?;
    let mut graph = Graph::new();
    match network.build(&mut graph, model, &sample) {
        Ok(_) => {}
        Err(e) if e.is_construction_error() => {
            warn!("skipping sample {}: {}", index, e);
            outcome.tally.skipped += 1;
            return Ok(outcome);
        }
        Err(e) => return Err(e),
    }
    let (predicted, loss) = graph.forward_pass(model)?;
    graph.backward_pass(&mut outcome.buffers)?;
    outcome.tally.record(predicted, loss, &sample);
    Ok(outcome)
}

fn compute_batch(model: &Model, network: &FeedForward, data: &(dyn DataSource + Sync), batch: &[usize]) -> Result<BatchOutcome> {
    batch
        .par_iter()
        .map(|&index| worker_sample(model, network, data, index))
        .try_reduce(|| BatchOutcome::empty(model), BatchOutcome::merge)
}

pub struct Session<T: Trainer> {
    model: Model,
    network: FeedForward,
    trainer: T,
    graph: Graph,
    rng: StdRng,
    pool: Option<rayon::ThreadPool>,
    log_interval: usize,
    epoch: usize,
}

impl Session<GradientDescentTrainer> {
    /// Builds model, network and trainer from a validated configuration.
    pub fn from_config(config: &TrainingConfig, input_dim: usize, classes: usize) -> Result<Self> {
        config.validate()?;
        let mut model = Model::with_init(config.seed, 0.0, config.init_std)?;
        let network = FeedForward::register(&mut model, input_dim, &config.hidden, classes, config.activation)?;
        let trainer = GradientDescentTrainer::new(config.optimizer.clone())?;
        info!(
            "network {} with {} trainable values, optimizer {:?}",
            network,
            model.parameter_count(),
            config.optimizer.optimizer_type
        );
        let mut session = Session::new(model, network, trainer, config.seed).with_workers(config.workers)?;
        session.log_interval = config.log_interval;
        Ok(session)
    }
}

impl<T: Trainer> Session<T> {
    pub fn new(model: Model, network: FeedForward, trainer: T, seed: u64) -> Self {
        Session {
            model,
            network,
            trainer,
            graph: Graph::new(),
            rng: StdRng::seed_from_u64(seed),
            pool: None,
            log_interval: 0,
            epoch: 0,
        }
    }

    /// Runs parallel batches on a dedicated pool of `workers` threads; 0 keeps
    /// rayon's global pool.
    pub fn with_workers(mut self, workers: usize) -> Result<Self> {
        if workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| GraphError::Config(format!("cannot start {} workers: {}", workers, e)))?;
            self.pool = Some(pool);
        }
        Ok(self)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn network(&self) -> &FeedForward {
        &self.network
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    fn shuffled(&mut self, len: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        order.shuffle(&mut self.rng);
        order
    }

    /// Builds, evaluates and differentiates one sample, then applies one
    /// trainer step. Returns `(predicted_label, loss)`.
    pub fn train_sample(&mut self, sample: &Sample) -> Result<(usize, f32)> {
        self.graph.renew();
        self.network.build(&mut self.graph, &self.model, sample)?;
        let result = self.graph.forward_pass(&self.model)?;
        self.trainer.zero_gradients(&mut self.model);
        self.graph.backward_pass(&mut self.model)?;
        self.trainer.apply_update(&mut self.model)?;
        self.graph.renew();
        Ok(result)
    }

    /// One pass over `data` in shuffled order, updating after every sample.
    pub fn train_epoch(&mut self, data: &dyn DataSource) -> Result<EpochStats> {
        let mut tally = Tally::default();
        for (step, index) in self.shuffled(data.len()).into_iter().enumerate() {
            let sample = data.sample(index)?;
            match self.train_sample(&sample) {
                Ok((predicted, loss)) => tally.record(predicted, loss, &sample),
                Err(e) if e.is_construction_error() => {
                    warn!("skipping sample {}: {}", index, e);
                    tally.skipped += 1;
                    self.graph.renew();
                }
                Err(e) => return Err(e),
            }
            if self.log_interval > 0 && (step + 1) % self.log_interval == 0 {
                debug!("epoch {}: {} samples, mean loss {:.4}", self.epoch + 1, step + 1, tally.stats().mean_loss);
            }
        }
        Ok(self.finish_epoch(&tally))
    }

    /// One pass over `data` in mini-batches whose gradients are computed in
    /// parallel and averaged before each update.
    pub fn train_epoch_parallel(&mut self, data: &(dyn DataSource + Sync), batch_size: usize) -> Result<EpochStats> {
        if batch_size == 0 {
            return Err(GraphError::Config("batch size must be at least 1".to_string()));
        }
        let mut tally = Tally::default();
        let order = self.shuffled(data.len());
        for batch in order.chunks(batch_size) {
            let (model, network) = (&self.model, &self.network);
            let outcome = match &self.pool {
                Some(pool) => pool.install(|| compute_batch(model, network, data, batch))?,
                None => compute_batch(model, network, data, batch)?,
            };
            tally.absorb(&outcome.tally);
            if outcome.tally.samples == 0 {
                continue;
            }

            let mut buffers = outcome.buffers;
            buffers.scale(1.0 / outcome.tally.samples as f32);
            self.trainer.zero_gradients(&mut self.model);
            self.model.load_gradients(&buffers)?;
            self.trainer.apply_update(&mut self.model)?;
        }
        Ok(self.finish_epoch(&tally))
    }

    /// Forward passes only; parameters are untouched.
    pub fn evaluate(&mut self, data: &dyn DataSource) -> Result<EpochStats> {
        let mut tally = Tally::default();
        for index in 0..data.len() {
            let sample = data.sample(index)?;
            self.graph.renew();
            match self.network.build(&mut self.graph, &self.model, &sample) {
                Ok(_) => {}
                Err(e) if e.is_construction_error() => {
                    warn!("skipping sample {}: {}", index, e);
                    tally.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
            let (predicted, loss) = self.graph.forward_pass(&self.model)?;
            tally.record(predicted, loss, &sample);
        }
        self.graph.renew();
        let stats = tally.stats();
        info!(
            "evaluation: {} samples, mean loss {:.4}, accuracy {:.2}%",
            stats.samples,
            stats.mean_loss,
            stats.accuracy * 100.0
        );
        Ok(stats)
    }

    fn finish_epoch(&mut self, tally: &Tally) -> EpochStats {
        self.epoch += 1;
        let stats = tally.stats();
        info!(
            "epoch {}: {} samples ({} skipped), mean loss {:.4}, accuracy {:.2}%",
            self.epoch,
            stats.samples,
            stats.skipped,
            stats.mean_loss,
            stats.accuracy * 100.0
        );
        if !stats.mean_loss.is_finite() {
            warn!("epoch {}: loss diverged", self.epoch);
        }
        stats
    }
}
