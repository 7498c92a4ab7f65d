//! End-to-end iteration cycles: forward, backward gradients split per
//! pyramid level, statistics update, recalibrated next forward.

use approx::assert_relative_eq;
use enfocar::{CycleState, EflConfig, EqualizedFocalLoss, Error, LocalGroup, Reduction};
use ndarray::{array, Array2, Array4, ArrayView2};

/// Repackage the rows `start..start + locations` of a `[N, C]` gradient as
/// one channel-first `[1, C, 1, locations]` pyramid-level tensor, the layout
/// a detection head's backward pass produces.
fn level_from_rows(grad: ArrayView2<f32>, start: usize, locations: usize) -> Array4<f32> {
    let classes = grad.ncols();
    Array4::from_shape_fn((1, classes, 1, locations), |(_, c, _, l)| {
        grad[[start + l, c]]
    })
}

fn config(num_classes: usize, fpn_levels: usize) -> EflConfig {
    EflConfig::new(num_classes)
        .with_focal_alpha(-1.0)
        .with_fpn_levels(fpn_levels)
}

#[test]
fn closed_form_loss_on_fresh_statistics() {
    // Fresh statistics put every ratio at one, so the loss is plain sigmoid
    // focal at the base gamma.
    let mut loss = EqualizedFocalLoss::new(config(3, 1)).unwrap();
    let logits = array![[2.0_f32, -2.0]];
    let labels = array![1_i64];

    let value = loss
        .forward(logits.view(), labels.view(), None)
        .unwrap()
        .scalar()
        .unwrap();

    let focal = |x: f32, t: f32| -> f32 {
        let p = 1.0 / (1.0 + (-x).exp());
        let pt = p * t + (1.0 - p) * (1.0 - t);
        -pt.ln() * (1.0 - pt).powi(2)
    };
    assert_relative_eq!(value, focal(2.0, 1.0) + focal(-2.0, 0.0), epsilon = 1e-5);
}

#[test]
fn ignored_sample_changes_neither_loss_nor_statistics() {
    let mut with_ignored = EqualizedFocalLoss::new(config(3, 1)).unwrap();
    let mut without = EqualizedFocalLoss::new(config(3, 1)).unwrap();

    // Same batch, except one extra sample labeled with the ignore index.
    let logits_a = array![[2.0_f32, -2.0], [0.4, 0.6], [9.0, 9.0]];
    let labels_a = array![1_i64, 0, -1];
    let logits_b = array![[2.0_f32, -2.0], [0.4, 0.6]];
    let labels_b = array![1_i64, 0];

    let a = with_ignored
        .forward(logits_a.view(), labels_a.view(), None)
        .unwrap()
        .scalar()
        .unwrap();
    let b = without
        .forward(logits_b.view(), labels_b.view(), None)
        .unwrap()
        .scalar()
        .unwrap();
    assert_relative_eq!(a, b, epsilon = 1e-6);

    // Feed gradients: the ignored row carries a huge value that must not
    // leak into the statistics.
    let mut grad_a = Array2::from_elem((3, 2), 0.5);
    grad_a[[2, 0]] = 1e6;
    grad_a[[2, 1]] = 1e6;
    let grad_b = Array2::from_elem((2, 2), 0.5);

    with_ignored
        .collect_grad(level_from_rows(grad_a.view(), 0, 3).view())
        .unwrap();
    without
        .collect_grad(level_from_rows(grad_b.view(), 0, 2).view())
        .unwrap();

    for c in 0..2 {
        assert_relative_eq!(
            with_ignored.statistics().pos_grad()[c],
            without.statistics().pos_grad()[c],
            epsilon = 1e-6
        );
        assert_relative_eq!(
            with_ignored.statistics().neg_grad()[c],
            without.statistics().neg_grad()[c],
            epsilon = 1e-6
        );
    }
}

#[test]
fn two_level_cycle_with_analytic_gradients() {
    // 2 levels x 2 locations: forward sees 4 samples; backward hands the
    // levels back in reverse order.
    let mut loss = EqualizedFocalLoss::new(config(3, 2)).unwrap();
    let logits = array![
        [1.5_f32, -0.5],
        [-0.2, 0.8],
        [0.0, 0.0],
        [2.0, -2.0]
    ];
    let labels = array![1_i64, 2, 0, 0];

    loss.forward(logits.view(), labels.view(), None).unwrap();
    let grad = loss
        .input_gradient(logits.view(), labels.view(), Reduction::Mean, None)
        .unwrap();

    // Forward layout: level 0 owns rows 0..2, level 1 rows 2..4. Backward
    // arrives level 1 first.
    assert_eq!(
        loss.collect_grad(level_from_rows(grad.view(), 2, 2).view())
            .unwrap(),
        CycleState::Pending
    );
    assert_eq!(
        loss.collect_grad(level_from_rows(grad.view(), 0, 2).view())
            .unwrap(),
        CycleState::Updated
    );

    // Hand-computed masked sums over the reassembled gradient.
    for c in 0..2 {
        let mut pos = 0.0_f32;
        let mut neg = 0.0_f32;
        for (i, &label) in labels.iter().enumerate() {
            let target = if label == (c as i64 + 1) { 1.0 } else { 0.0 };
            pos += grad[[i, c]].abs() * target;
            neg += grad[[i, c]].abs() * (1.0 - target);
        }
        assert_relative_eq!(loss.statistics().pos_grad()[c], pos, epsilon = 1e-6);
        assert_relative_eq!(loss.statistics().neg_grad()[c], neg, epsilon = 1e-6);
        let r = loss.ratios()[c];
        assert!((0.0..=1.0).contains(&r));
    }
}

#[test]
fn second_iteration_reflects_first_iterations_statistics() {
    let mut loss = EqualizedFocalLoss::new(config(3, 1)).unwrap();
    let logits = array![[1.0_f32, -1.0], [-0.5, 0.5]];
    let labels = array![1_i64, 0];

    let first = loss
        .forward(logits.view(), labels.view(), None)
        .unwrap()
        .scalar()
        .unwrap();

    let grad = loss
        .input_gradient(logits.view(), labels.view(), Reduction::Mean, None)
        .unwrap();
    loss.collect_grad(level_from_rows(grad.view(), 0, 2).view())
        .unwrap();

    let expected_ratios = loss.ratios().clone();
    let second = loss
        .forward(logits.view(), labels.view(), None)
        .unwrap()
        .scalar()
        .unwrap();

    // Recompute with a standalone engine pinned at the updated ratios.
    let engine = loss.engine().clone();
    let (pinned, _) = engine
        .forward(
            logits.view(),
            labels.view(),
            expected_ratios.view(),
            Reduction::Mean,
            1.0,
        )
        .unwrap();
    assert_relative_eq!(second, pinned.scalar().unwrap(), epsilon = 1e-6);
    assert_ne!(first, second);
}

#[test]
fn three_cycles_update_statistics_exactly_three_times() {
    let mut loss = EqualizedFocalLoss::new(config(2, 2)).unwrap();
    let logits = array![[0.5_f32], [-0.5], [1.0], [-1.0]];
    let labels = array![1_i64, 0, 0, 1];

    let mut updates = 0;
    for _ in 0..3 {
        loss.forward(logits.view(), labels.view(), None).unwrap();
        let grad = loss
            .input_gradient(logits.view(), labels.view(), Reduction::Mean, None)
            .unwrap();
        let pos_before = loss.statistics().pos_grad().clone();
        for (start, state) in [(2, CycleState::Pending), (0, CycleState::Updated)] {
            let outcome = loss
                .collect_grad(level_from_rows(grad.view(), start, 2).view())
                .unwrap();
            assert_eq!(outcome, state);
            if outcome == CycleState::Updated {
                updates += 1;
            } else {
                assert_eq!(loss.statistics().pos_grad(), &pos_before);
            }
        }
        assert!(loss.statistics().pos_grad()[0] > pos_before[0]);
    }
    assert_eq!(updates, 3);
}

#[test]
fn single_worker_allreduce_is_identity() {
    // The same data through a SingleProcess facade and through a LocalGroup
    // of one must land on identical statistics.
    let mut solo = EqualizedFocalLoss::new(config(2, 1)).unwrap();
    let comm = LocalGroup::group(1).pop().unwrap();
    let mut grouped = EqualizedFocalLoss::with_weight_table(config(2, 1), None, comm).unwrap();

    let logits = array![[0.5_f32], [-0.5]];
    let labels = array![1_i64, 0];
    let grad = Array2::from_elem((2, 1), 0.25);

    solo.forward(logits.view(), labels.view(), None).unwrap();
    solo.collect_grad(level_from_rows(grad.view(), 0, 2).view())
        .unwrap();
    grouped.forward(logits.view(), labels.view(), None).unwrap();
    grouped
        .collect_grad(level_from_rows(grad.view(), 0, 2).view())
        .unwrap();

    assert_eq!(solo.statistics().pos_grad(), grouped.statistics().pos_grad());
    assert_eq!(solo.ratios(), grouped.ratios());
}

#[test]
fn workers_agree_after_cross_worker_allreduce() {
    // Two workers, different batches. Worker 0 contributes pos 1 / neg 1,
    // worker 1 contributes pos 0 / neg 4. Both must end at the group totals
    // pos 1 / neg 5 and ratio 0.2.
    let handles = LocalGroup::group(2);
    let workers: Vec<_> = handles
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            std::thread::spawn(move || {
                let mut loss =
                    EqualizedFocalLoss::with_weight_table(config(2, 1), None, comm).unwrap();
                let (labels, grad_value) = if rank == 0 {
                    (array![1_i64, 0], 1.0_f32)
                } else {
                    (array![0_i64, 0], 2.0)
                };
                let logits = array![[0.5_f32], [-0.5]];
                loss.forward(logits.view(), labels.view(), None).unwrap();
                let grad = Array2::from_elem((2, 1), grad_value);
                loss.collect_grad(level_from_rows(grad.view(), 0, 2).view())
                    .unwrap();
                (
                    loss.statistics().pos_grad()[0],
                    loss.statistics().neg_grad()[0],
                    loss.ratios()[0],
                )
            })
        })
        .collect();

    for worker in workers {
        let (pos, neg, ratio) = worker.join().unwrap();
        assert_relative_eq!(pos, 1.0, epsilon = 1e-6);
        assert_relative_eq!(neg, 5.0, epsilon = 1e-6);
        assert_relative_eq!(ratio, 0.2, epsilon = 1e-5);
    }
}

#[test]
fn miscounted_levels_surface_as_protocol_errors() {
    let mut loss = EqualizedFocalLoss::new(config(2, 1)).unwrap();
    let logits = array![[0.5_f32], [-0.5]];
    let labels = array![1_i64, 0];
    let grad = Array2::from_elem((2, 1), 1.0);

    loss.forward(logits.view(), labels.view(), None).unwrap();
    loss.collect_grad(level_from_rows(grad.view(), 0, 2).view())
        .unwrap();

    // One level too many for this iteration.
    assert!(matches!(
        loss.collect_grad(level_from_rows(grad.view(), 0, 2).view()),
        Err(Error::ExtraLevel { fpn_levels: 1 })
    ));
}
