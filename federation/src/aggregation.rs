use comms::specs::experiment::AggregationSpec;
use rayon::prelude::*;

use crate::{FederationErr, Result};

/// The parameters a collaborator trained, weighted by the size of its shard.
#[derive(Debug, Clone, Copy)]
pub struct LocalUpdate<'a> {
    pub weight: usize,
    pub params: &'a [f32],
}

/// Combines the updates of every collaborator into the next global model.
///
/// # Returns
/// An error if there are no updates or they differ in length.
pub fn aggregate(spec: AggregationSpec, updates: &[LocalUpdate<'_>]) -> Result<Vec<f32>> {
    let Some(first) = updates.first() else {
        return Err(FederationErr::Aggregation("no local updates to aggregate"));
    };

    let len = first.params.len();
    if let Some(bad) = updates.iter().find(|u| u.params.len() != len) {
        return Err(FederationErr::ModelSizeMismatch {
            got: bad.params.len(),
            expected: len,
        });
    }

    let aggregated = match spec {
        AggregationSpec::WeightedAverage => weighted_average(updates, len),
        AggregationSpec::Median => median(updates, len),
    };

    Ok(aggregated)
}

fn weighted_average(updates: &[LocalUpdate<'_>], len: usize) -> Vec<f32> {
    let total: usize = updates.iter().map(|u| u.weight).sum();
    let mut out = vec![0.; len];

    for update in updates {
        // Falls back to a plain mean when no collaborator reported any data.
        let w = if total == 0 {
            1. / updates.len() as f32
        } else {
            update.weight as f32 / total as f32
        };

        out.iter_mut()
            .zip(update.params)
            .for_each(|(o, p)| *o += w * p);
    }

    out
}

fn median(updates: &[LocalUpdate<'_>], len: usize) -> Vec<f32> {
    (0..len)
        .into_par_iter()
        .map_init(
            || Vec::with_capacity(updates.len()),
            |values, i| {
                values.clear();
                values.extend(updates.iter().map(|u| u.params[i]));
                values.sort_unstable_by(f32::total_cmp);

                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) / 2.
                } else {
                    values[mid]
                }
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(weight: usize, params: &[f32]) -> LocalUpdate<'_> {
        LocalUpdate { weight, params }
    }

    #[test]
    fn average_is_weighted_by_data_size() {
        let a = [0., 4.];
        let b = [4., 0.];
        let out = aggregate(
            AggregationSpec::WeightedAverage,
            &[update(3, &a), update(1, &b)],
        )
        .unwrap();

        assert_eq!(out, [1., 3.]);
    }

    #[test]
    fn average_without_data_is_uniform() {
        let a = [2.];
        let b = [4.];
        let out = aggregate(
            AggregationSpec::WeightedAverage,
            &[update(0, &a), update(0, &b)],
        )
        .unwrap();

        assert_eq!(out, [3.]);
    }

    #[test]
    fn median_ignores_outliers() {
        let a = [1., 10.];
        let b = [2., 20.];
        let c = [1000., -1000.];
        let updates = [update(1, &a), update(1, &b), update(1, &c)];
        let out = aggregate(AggregationSpec::Median, &updates).unwrap();
        assert_eq!(out, [2., 10.]);

        let out = aggregate(AggregationSpec::Median, &[update(1, &a), update(1, &b)]).unwrap();
        assert_eq!(out, [1.5, 15.]);
    }

    #[test]
    fn mismatched_updates_are_rejected() {
        let a = [1., 2.];
        let b = [1.];

        assert!(matches!(
            aggregate(AggregationSpec::Median, &[update(1, &a), update(1, &b)]),
            Err(FederationErr::ModelSizeMismatch {
                got: 1,
                expected: 2
            })
        ));
        assert!(aggregate(AggregationSpec::WeightedAverage, &[]).is_err());
    }
}
