// src/weights.rs
//
// Rescaling of design weights for multilevel models (Carle 2009,
// "Fitting multilevel models in complex survey data with design weights").

use log::debug;
use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, SurveyStatsError};
use crate::table::{ColumnData, DataTable};

/// Name of the frequency-rescaled weight column, `w * n(g) / sum_w(g)`.
pub const SVYWGHT_A: &str = "svywght_a";
/// Name of the normalized weight column, `w / sum_w(g)`.
pub const SVYWGHT_B: &str = "svywght_b";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Number(u64),
    Label(String),
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Number(bits) => write!(f, "{}", f64::from_bits(*bits)),
            GroupKey::Label(label) => f.write_str(label),
        }
    }
}

/// Size and total weight of one cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupTotal {
    pub group: String,
    /// Rows in the group with both group and weight present.
    pub n: usize,
    pub sum_weight: f64,
}

fn group_keys(table: &DataTable, group: &str) -> Result<Vec<Option<GroupKey>>> {
    let column = table.column(group)?;
    let keys = match &column.data {
        ColumnData::Numeric(values) => values
            .iter()
            .map(|v| {
                v.filter(|x| !x.is_nan()).map(|x| {
                    // -0.0 and 0.0 are one group
                    let x = if x == 0.0 { 0.0 } else { x };
                    GroupKey::Number(x.to_bits())
                })
            })
            .collect(),
        ColumnData::Categorical(values) => values
            .iter()
            .map(|v| v.as_ref().map(|s| GroupKey::Label(s.clone())))
            .collect(),
    };
    Ok(keys)
}

fn probability_weights(table: &DataTable, weight: &str) -> Result<Vec<Option<f64>>> {
    let values = table.numeric_column(weight)?;
    if let Some(bad) = values.iter().flatten().find(|w| !w.is_finite() || **w < 0.0) {
        return Err(SurveyStatsError::input(
            weight,
            format!("finite, non-negative probability weights (found {})", bad),
        ));
    }
    Ok(values.to_vec())
}

/// Accumulated totals plus the group index of every row.
struct Accumulated {
    totals: Vec<(GroupKey, usize, f64)>,
    row_groups: Vec<Option<usize>>,
}

fn accumulate(keys: &[Option<GroupKey>], weights: &[Option<f64>]) -> Accumulated {
    let mut index: HashMap<GroupKey, usize> = HashMap::new();
    let mut totals: Vec<(GroupKey, usize, f64)> = Vec::new();
    let mut row_groups = Vec::with_capacity(keys.len());

    for (key, w) in keys.iter().zip(weights) {
        match (key, w) {
            (Some(key), Some(w)) => {
                let slot = *index.entry(key.clone()).or_insert_with(|| {
                    totals.push((key.clone(), 0, 0.0));
                    totals.len() - 1
                });
                totals[slot].1 += 1;
                totals[slot].2 += w;
                row_groups.push(Some(slot));
            }
            _ => row_groups.push(None),
        }
    }
    Accumulated { totals, row_groups }
}

/// Per-group row count and total weight, in order of first appearance.
///
/// # Errors
/// `Input` if either column is absent or a weight is negative or non-finite,
/// `TypeMismatch` if the weight column is not numeric.
pub fn group_weight_totals(table: &DataTable, group: &str, weight: &str) -> Result<Vec<GroupTotal>> {
    let keys = group_keys(table, group)?;
    let weights = probability_weights(table, weight)?;
    let acc = accumulate(&keys, &weights);
    Ok(acc
        .totals
        .into_iter()
        .map(|(key, n, sum_weight)| GroupTotal {
            group: key.to_string(),
            n,
            sum_weight,
        })
        .collect())
}

/// Appends the two rescaled design weights to a copy of `table`.
///
/// For row `i` in group `g` with weight `w_i`:
/// * `svywght_a = w_i * n(g) / sum_w(g)`, which sums to the group size,
/// * `svywght_b = w_i / sum_w(g)`, which sums to one within the group.
///
/// Rows whose group or weight is missing get missing rescaled weights and do
/// not count towards their group. Row order and row count are preserved.
///
/// # Errors
/// - `Input` if a column is absent or a weight is negative or non-finite.
/// - `TypeMismatch` if the weight column is categorical.
/// - `DivisionByZero` if a group's weights sum to zero.
///
/// # Examples
///
/// ```
/// use survey_stats::table::{Column, DataTable};
/// use survey_stats::weights::rescale_weights;
///
/// let table = DataTable::new(vec![
///     Column::categorical("psu", vec!["a", "a", "a", "b"]),
///     Column::numeric("probwt", vec![1.0, 1.0, 2.0, 4.0]),
/// ]).unwrap();
/// let out = rescale_weights(&table, "psu", "probwt").unwrap();
/// assert_eq!(out.numeric_column("svywght_a").unwrap()[2], Some(1.5));
/// ```
pub fn rescale_weights(table: &DataTable, group: &str, weight: &str) -> Result<DataTable> {
    let keys = group_keys(table, group)?;
    let weights = probability_weights(table, weight)?;
    let acc = accumulate(&keys, &weights);

    debug!(
        "Rescaling `{}` within {} groups of `{}` over {} rows.",
        weight,
        acc.totals.len(),
        group,
        table.n_rows()
    );

    if let Some((key, _, _)) = acc.totals.iter().find(|(_, _, sum)| *sum == 0.0) {
        return Err(SurveyStatsError::DivisionByZero {
            group: key.to_string(),
        });
    }

    let (svywght_a, svywght_b): (Vec<Option<f64>>, Vec<Option<f64>>) = acc
        .row_groups
        .iter()
        .zip(&weights)
        .map(|(slot, w)| match (slot, w) {
            (Some(slot), Some(w)) => {
                let (_, n, sum_w) = &acc.totals[*slot];
                (Some(w * *n as f64 / sum_w), Some(w / sum_w))
            }
            _ => (None, None),
        })
        .unzip();

    table
        .with_column(SVYWGHT_A, ColumnData::Numeric(svywght_a))?
        .with_column(SVYWGHT_B, ColumnData::Numeric(svywght_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Column;
    use approx::assert_abs_diff_eq;

    fn two_groups() -> DataTable {
        DataTable::new(vec![
            Column::categorical("psu", vec!["A", "A", "B", "A"]),
            Column::numeric("probwt", vec![1.0, 1.0, 4.0, 2.0]),
        ])
        .unwrap()
    }

    fn values(table: &DataTable, name: &str) -> Vec<f64> {
        table
            .numeric_column(name)
            .unwrap()
            .iter()
            .map(|v| v.unwrap())
            .collect()
    }

    #[test]
    fn rescales_two_groups() {
        let out = rescale_weights(&two_groups(), "psu", "probwt").unwrap();
        let a = values(&out, SVYWGHT_A);
        let b = values(&out, SVYWGHT_B);
        for (got, want) in a.iter().zip([0.75, 0.75, 1.0, 1.5]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }
        for (got, want) in b.iter().zip([0.25, 0.25, 1.0, 0.5]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
        }
        assert_eq!(out.n_rows(), 4);
        assert_eq!(out.column_names(), vec!["psu", "probwt", SVYWGHT_A, SVYWGHT_B]);
    }

    #[test]
    fn totals_follow_first_appearance() {
        let totals = group_weight_totals(&two_groups(), "psu", "probwt").unwrap();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].group, "A");
        assert_eq!(totals[0].n, 3);
        assert_abs_diff_eq!(totals[0].sum_weight, 4.0);
        assert_eq!(totals[1].group, "B");
        assert_eq!(totals[1].n, 1);
    }

    #[test]
    fn numeric_groups_and_missing_rows() {
        let table = DataTable::new(vec![
            Column::numeric_with_missing("school", vec![Some(1.0), Some(1.0), None, Some(2.0)]),
            Column::numeric_with_missing("w", vec![Some(2.0), None, Some(3.0), Some(5.0)]),
        ])
        .unwrap();
        let out = rescale_weights(&table, "school", "w").unwrap();
        let a = out.numeric_column(SVYWGHT_A).unwrap();
        assert_eq!(a[0], Some(1.0));
        assert_eq!(a[1], None);
        assert_eq!(a[2], None);
        assert_eq!(a[3], Some(1.0));
    }

    #[test]
    fn zero_total_weight_is_division_by_zero() {
        let table = DataTable::new(vec![
            Column::numeric("g", vec![1.0, 1.0, 2.0]),
            Column::numeric("w", vec![0.0, 0.0, 3.0]),
        ])
        .unwrap();
        match rescale_weights(&table, "g", "w") {
            Err(SurveyStatsError::DivisionByZero { group }) => assert_eq!(group, "1"),
            other => panic!("expected DivisionByZero, got {:?}", other),
        }
    }

    #[test]
    fn missing_columns_and_bad_weights_are_input_errors() {
        let table = two_groups();
        assert!(matches!(
            rescale_weights(&table, "cluster", "probwt"),
            Err(SurveyStatsError::Input { .. })
        ));
        assert!(matches!(
            rescale_weights(&table, "psu", "weight"),
            Err(SurveyStatsError::Input { .. })
        ));
        assert!(matches!(
            rescale_weights(&table, "probwt", "psu"),
            Err(SurveyStatsError::TypeMismatch { .. })
        ));

        let negative = DataTable::new(vec![
            Column::numeric("g", vec![1.0, 1.0]),
            Column::numeric("w", vec![1.0, -1.0]),
        ])
        .unwrap();
        assert!(matches!(
            rescale_weights(&negative, "g", "w"),
            Err(SurveyStatsError::Input { .. })
        ));
    }
}
