use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use gradgraph::{
    gaussian_blobs, two_point_dataset, Activation, DataSource, FeedForward, GradientDescentTrainer, Graph,
    IdxDataSource, Model, OptimizerConfig, OptimizerType, Session, TrainingConfig,
};
use log::info;

#[derive(Parser)]
#[command(name = "gradgraph")]
#[command(about = "Reverse-mode autodiff engine and feed-forward classifier trainer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OptimizerArg {
    Sgd,
    Adam,
    Rmsprop,
}

#[derive(Clone, Copy, ValueEnum)]
enum ActivationArg {
    Relu,
    Tanh,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a feed-forward classifier
    Train {
        /// JSON training configuration; flags below override it
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// IDX image file (MNIST format); synthetic blobs are used when absent
        #[arg(long, requires = "labels")]
        images: Option<PathBuf>,

        /// IDX label file
        #[arg(long, requires = "images")]
        labels: Option<PathBuf>,

        /// IDX image file for evaluation after training
        #[arg(long, requires = "test_labels")]
        test_images: Option<PathBuf>,

        /// IDX label file for evaluation after training
        #[arg(long, requires = "test_images")]
        test_labels: Option<PathBuf>,

        /// Number of classes
        #[arg(long, default_value_t = 10)]
        classes: usize,

        /// Only use the first N training samples
        #[arg(long)]
        limit: Option<usize>,

        /// Hidden layer sizes, comma separated
        #[arg(long, value_delimiter = ',')]
        hidden: Option<Vec<usize>>,

        #[arg(long, value_enum)]
        activation: Option<ActivationArg>,

        #[arg(long, value_enum)]
        optimizer: Option<OptimizerArg>,

        #[arg(long)]
        learning_rate: Option<f32>,

        #[arg(short, long)]
        epochs: Option<usize>,

        /// Mini-batch size; values above 1 train in parallel
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Worker threads for parallel batches (0 = all cores)
        #[arg(short, long)]
        workers: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        /// Write the trained parameters to this JSON checkpoint
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fit a linear softmax classifier to two separable points
    Demo {
        /// Print the per-sample graph
        #[arg(short, long)]
        graph: bool,
    },

    /// Show version information
    Version,
}

struct Overrides {
    hidden: Option<Vec<usize>>,
    activation: Option<ActivationArg>,
    optimizer: Option<OptimizerArg>,
    learning_rate: Option<f32>,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    workers: Option<usize>,
    seed: Option<u64>,
}

fn resolve_config(path: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<TrainingConfig> {
    let mut config = match path {
        Some(path) => TrainingConfig::from_file(&path).with_context(|| format!("reading {}", path.display()))?,
        None => TrainingConfig::default(),
    };

    if let Some(hidden) = overrides.hidden {
        config.hidden = hidden;
    }
    if let Some(activation) = overrides.activation {
        config.activation = match activation {
            ActivationArg::Relu => Activation::ReLU,
            ActivationArg::Tanh => Activation::TanH,
        };
    }
    if let Some(optimizer) = overrides.optimizer {
        config.optimizer.optimizer_type = match optimizer {
            OptimizerArg::Sgd => OptimizerType::SGD,
            OptimizerArg::Adam => OptimizerType::Adam,
            OptimizerArg::Rmsprop => OptimizerType::RMSprop,
        };
    }
    if let Some(lr) = overrides.learning_rate {
        config.optimizer.learning_rate = lr;
    }
    if let Some(epochs) = overrides.epochs {
        config.epochs = epochs;
    }
    if let Some(batch_size) = overrides.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(workers) = overrides.workers {
        config.workers = workers;
    }
    if let Some(seed) = overrides.seed {
        config.seed = seed;
    }

    config.validate()?;
    Ok(config)
}

fn run_training(
    config: &TrainingConfig,
    train: &(dyn DataSource + Sync),
    input_dim: usize,
    test: Option<&dyn DataSource>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut session = Session::from_config(config, input_dim, train.num_classes())?;

    for _ in 0..config.epochs {
        if config.batch_size > 1 {
            session.train_epoch_parallel(train, config.batch_size)?;
        } else {
            session.train_epoch(train)?;
        }
    }

    if let Some(test) = test {
        let stats = session.evaluate(test)?;
        println!(
            "Test: {} samples, mean loss {:.4}, accuracy {:.2}%",
            stats.samples,
            stats.mean_loss,
            stats.accuracy * 100.0
        );
    }

    if let Some(path) = output {
        session.model().save(&path).with_context(|| format!("writing {}", path.display()))?;
        println!("Saved {} parameters to {}", session.model().len(), path.display());
    }
    Ok(())
}

fn run_demo(print_graph: bool) -> anyhow::Result<()> {
    println!("gradgraph demo: linear softmax classifier on two points");
    println!("=======================================================\n");

    let data = two_point_dataset();
    let mut model = Model::new(7);
    let network = FeedForward::register(&mut model, 2, &[], 2, Activation::ReLU)?;

    if print_graph {
        let mut graph = Graph::new();
        network.build(&mut graph, &model, &data.samples()[0])?;
        graph.print_structure();
        for node in graph.nodes() {
            println!("{} {:<16} {}", node.id(), node.kind().to_string(), node.output_shape());
        }
        println!();
    }

    let trainer = GradientDescentTrainer::new(OptimizerConfig::sgd(0.5))?;
    let mut session = Session::new(model, network, trainer, 7);

    println!("Epoch | mean loss | accuracy");
    println!("------|-----------|---------");
    let epochs = 100;
    for epoch in 1..=epochs {
        let stats = session.train_epoch(&data)?;
        if epoch == 1 || epoch % 10 == 0 {
            println!("{:>5} | {:9.5} | {:7.1}%", epoch, stats.mean_loss, stats.accuracy * 100.0);
        }
    }

    let stats = session.evaluate(&data)?;
    if stats.accuracy < 1.0 {
        bail!("demo did not separate the two points (accuracy {:.1}%)", stats.accuracy * 100.0);
    }
    println!("\nConverged: loss {:.5}, both points classified correctly", stats.mean_loss);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            images,
            labels,
            test_images,
            test_labels,
            classes,
            limit,
            hidden,
            activation,
            optimizer,
            learning_rate,
            epochs,
            batch_size,
            workers,
            seed,
            output,
        } => {
            let config = resolve_config(
                config,
                Overrides {
                    hidden,
                    activation,
                    optimizer,
                    learning_rate,
                    epochs,
                    batch_size,
                    workers,
                    seed,
                },
            )?;

            let test = match (test_images, test_labels) {
                (Some(images), Some(labels)) => Some(IdxDataSource::open(&images, &labels, classes)?),
                _ => None,
            };

            match (images, labels) {
                (Some(images), Some(labels)) => {
                    let mut train = IdxDataSource::open(&images, &labels, classes)?;
                    if let Some(limit) = limit {
                        train.truncate(limit);
                    }
                    let input_dim = train.input_dim();
                    run_training(&config, &train, input_dim, test.as_ref().map(|t| t as &dyn DataSource), output)?;
                }
                _ => {
                    let per_class = limit.map(|n| n / classes.max(1)).unwrap_or(200);
                    let blobs = gaussian_blobs(classes, per_class, 8, config.seed)?;
                    info!("training on {} synthetic samples in {} classes", blobs.len(), classes);
                    run_training(&config, &blobs, 8, Some(&blobs as &dyn DataSource), output)?;
                }
            }
        }
        Commands::Demo { graph } => {
            run_demo(graph)?;
        }
        Commands::Version => {
            println!("gradgraph v{}", env!("CARGO_PKG_VERSION"));
            println!("Reverse-mode autodiff with a per-sample graph executor");
        }
    }

    Ok(())
}
