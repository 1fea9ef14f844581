//! Stratified demonstration sampling across classes and subgroups.
//!
//! Selection is a two-pass scheme: for each class, the positively-labeled
//! pool rows are partitioned by subgroup (pool order preserved), then the
//! first `quota` rows of each partition are taken. Deterministic first-N
//! selection, so identical pool ordering and parameters always yield the
//! same demo set.

use crate::dataset::{Demographics, LabelTable, Subgroup};
use crate::error::{HarnessError, Result};

/// One demonstration example: pool identifier plus the class description
/// rendered verbatim in prompts as its ground-truth answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoExample {
    pub id: String,
    pub class_desp: String,
}

/// Per-class subgroup quotas: Black count is `round(shots × split)`, White
/// count is the remainder.
pub fn subgroup_quotas(shots_per_class: usize, split: f64) -> (usize, usize) {
    let black = (shots_per_class as f64 * split).round() as usize;
    (black, shots_per_class - black)
}

/// Select a class-and-subgroup-balanced demo set from the pool.
///
/// Returns exactly `shots_per_class × classes` entries, grouped by class in
/// table order, without replacement within each class. The caller shuffles
/// for presentation order.
pub fn sample_demo_set(
    pool: &LabelTable,
    demographics: &Demographics,
    class_desp: &[String],
    shots_per_class: usize,
    split: f64,
) -> Result<Vec<DemoExample>> {
    if !(0.0..=1.0).contains(&split) {
        return Err(HarnessError::Config(format!(
            "subgroup split must be in [0, 1], got {split}"
        )));
    }
    if class_desp.len() != pool.classes.len() {
        return Err(HarnessError::Config(format!(
            "{} class descriptions provided for {} classes",
            class_desp.len(),
            pool.classes.len()
        )));
    }

    let (black_quota, white_quota) = subgroup_quotas(shots_per_class, split);
    let mut demos = Vec::with_capacity(shots_per_class * pool.classes.len());

    for (class_idx, class) in pool.classes.iter().enumerate() {
        let eligible = pool.rows_for_class(class_idx);
        if eligible.len() < shots_per_class {
            return Err(HarnessError::InsufficientDemoPool {
                class: class.clone(),
                requested: shots_per_class,
                available: eligible.len(),
            });
        }

        let mut black = Vec::new();
        let mut white = Vec::new();
        for row in &eligible {
            match demographics.subgroup_of(&row.id) {
                Some(Subgroup::Black) => black.push(*row),
                Some(Subgroup::White) => white.push(*row),
                // Rows absent from the demographics table are ineligible for
                // either quota.
                None => {}
            }
        }

        if black.len() < black_quota {
            return Err(HarnessError::QuotaUnmet {
                class: class.clone(),
                subgroup: Subgroup::Black,
                needed: black_quota,
                available: black.len(),
            });
        }
        if white.len() < white_quota {
            return Err(HarnessError::QuotaUnmet {
                class: class.clone(),
                subgroup: Subgroup::White,
                needed: white_quota,
                available: white.len(),
            });
        }

        let desp = &class_desp[class_idx];
        for row in black.iter().take(black_quota).chain(white.iter().take(white_quota)) {
            demos.push(DemoExample {
                id: row.id.clone(),
                class_desp: desp.clone(),
            });
        }
    }

    debug_assert_eq!(demos.len(), shots_per_class * pool.classes.len());
    Ok(demos)
}
