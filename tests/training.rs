use gradgraph::{
    gaussian_blobs, two_point_dataset, Activation, DataSource, FeedForward, GradientBuffers, GradientDescentTrainer,
    Graph, Model, OptimizerConfig, Session, Trainer,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_linear_logits_converge_on_two_points() {
    init_logger();
    let data = two_point_dataset();
    let mut model = Model::new(21);
    let w = model.add_parameter((2, 2));
    let b = model.add_parameter((1, 2));
    let mut trainer = GradientDescentTrainer::sgd(0.5).unwrap();
    let mut graph = Graph::new();

    for _ in 0..300 {
        for sample in data.samples() {
            let x = graph.add_input(sample.input.clone()).unwrap();
            let wp = graph.add_parameter(&model, w).unwrap();
            let bp = graph.add_parameter(&model, b).unwrap();
            let wx = graph.add_product(wp, x).unwrap();
            let logits = graph.add_summation(wx, bp).unwrap();
            graph.add_cross_entropy(logits, sample.label.clone()).unwrap();

            graph.forward_pass(&model).unwrap();
            trainer.zero_gradients(&mut model);
            graph.backward_pass(&mut model).unwrap();
            trainer.apply_update(&mut model).unwrap();
            graph.renew();
        }
    }

    for sample in data.samples() {
        let x = graph.add_input(sample.input.clone()).unwrap();
        let wp = graph.add_parameter(&model, w).unwrap();
        let bp = graph.add_parameter(&model, b).unwrap();
        let wx = graph.add_product(wp, x).unwrap();
        let logits = graph.add_summation(wx, bp).unwrap();
        graph.add_cross_entropy(logits, sample.label.clone()).unwrap();
        let (predicted, loss) = graph.forward_pass(&model).unwrap();
        assert_eq!(predicted, sample.class());
        assert!(loss < 0.1, "loss {} did not converge", loss);
        graph.renew();
    }
}

#[test]
fn test_session_separates_two_points() {
    init_logger();
    let data = two_point_dataset();
    let mut model = Model::new(3);
    let network = FeedForward::register(&mut model, 2, &[], 2, Activation::ReLU).unwrap();
    let mut session = Session::new(model, network, GradientDescentTrainer::sgd(0.5).unwrap(), 3);

    let first = session.train_epoch(&data).unwrap();
    let mut last = first;
    for _ in 0..150 {
        last = session.train_epoch(&data).unwrap();
    }
    assert!(last.mean_loss < first.mean_loss);
    let stats = session.evaluate(&data).unwrap();
    assert_eq!(stats.accuracy, 1.0);
    assert_eq!(stats.skipped, 0);
}

#[test]
fn test_parallel_batch_matches_averaged_gradients() {
    init_logger();
    let data = gaussian_blobs(3, 4, 5, 9).unwrap();
    let build = || {
        let mut model = Model::with_init(17, 0.0, 0.5).unwrap();
        let network = FeedForward::register(&mut model, 5, &[6], 3, Activation::TanH).unwrap();
        (model, network)
    };

    // Reference: per-sample gradients summed by hand, averaged, one SGD step.
    let (mut expected, network) = build();
    let mut total = GradientBuffers::for_model(&expected);
    for i in 0..data.len() {
        let sample = data.sample(i).unwrap();
        let mut graph = Graph::new();
        network.build(&mut graph, &expected, &sample).unwrap();
        graph.forward_pass(&expected).unwrap();
        let mut buffers = GradientBuffers::for_model(&expected);
        graph.backward_pass(&mut buffers).unwrap();
        total = total.merge(&buffers).unwrap();
    }
    total.scale(1.0 / data.len() as f32);
    expected.load_gradients(&total).unwrap();
    GradientDescentTrainer::sgd(0.1).unwrap().apply_update(&mut expected).unwrap();

    let (model, network) = build();
    let mut session = Session::new(model, network, GradientDescentTrainer::sgd(0.1).unwrap(), 5)
        .with_workers(3)
        .unwrap();
    let stats = session.train_epoch_parallel(&data, data.len()).unwrap();
    assert_eq!(stats.samples, data.len());

    for ((_, got), (_, want)) in session.model().parameters().zip(expected.parameters()) {
        for (a, b) in got.value().data().iter().zip(want.value().data().iter()) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }
}

#[test]
fn test_parallel_training_learns_blobs() {
    init_logger();
    let data = gaussian_blobs(3, 30, 4, 2).unwrap();
    let mut model = Model::with_init(8, 0.0, 0.5).unwrap();
    let network = FeedForward::register(&mut model, 4, &[8], 3, Activation::ReLU).unwrap();
    let trainer = GradientDescentTrainer::new(OptimizerConfig::adam(0.02, 0.9, 0.999, 1e-8)).unwrap();
    let mut session = Session::new(model, network, trainer, 8);

    let before = session.evaluate(&data).unwrap();
    for _ in 0..60 {
        session.train_epoch_parallel(&data, 8).unwrap();
    }
    let after = session.evaluate(&data).unwrap();
    assert!(after.mean_loss < before.mean_loss);
    assert!(after.accuracy > 0.9, "accuracy {}", after.accuracy);
}

#[test]
fn test_checkpoint_preserves_predictions() {
    init_logger();
    let data = two_point_dataset();
    let mut model = Model::new(5);
    let network = FeedForward::register(&mut model, 2, &[3], 2, Activation::TanH).unwrap();
    let mut session = Session::new(model, network.clone(), GradientDescentTrainer::sgd(0.2).unwrap(), 5);
    for _ in 0..20 {
        session.train_epoch(&data).unwrap();
    }
    let trained = session.evaluate(&data).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoint.json");
    session.model().save(&path).unwrap();

    let restored = Model::load(&path, 0).unwrap();
    let mut replay = Session::new(restored, network, GradientDescentTrainer::sgd(0.2).unwrap(), 5);
    let stats = replay.evaluate(&data).unwrap();
    assert_eq!(stats.accuracy, trained.accuracy);
    assert!((stats.mean_loss - trained.mean_loss).abs() < 1e-6);
}
