use crate::error::SurveyStatsError;
use crate::linalg_backends::{BackendEigh, FaerLinAlgBackend};
use crate::pca::{kaiser_count, summarize, Decomposition, PcaInput, PcaSummary};
use crate::table::{Column, DataTable};

use approx::assert_abs_diff_eq;
use ndarray::{array, Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::error::Error;

const TOLERANCE: f64 = 1e-9;

fn generate_random_data(n_samples: usize, n_features: usize, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array2::from_shape_fn((n_samples, n_features), |_| rng.sample::<f64, _>(StandardNormal))
}

fn names(k: usize) -> Vec<String> {
    (1..=k).map(|i| format!("v{}", i)).collect()
}

fn table_from(data: &Array2<f64>) -> DataTable {
    let names = names(data.ncols());
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    DataTable::from_matrix(&refs, data).unwrap()
}

fn assert_summary_invariants(summary: &PcaSummary, context: &str) {
    let k = summary.n_components();
    assert_abs_diff_eq!(summary.proportion.sum(), 1.0, epsilon = TOLERANCE);
    assert_abs_diff_eq!(summary.cumulative[k - 1], 1.0, epsilon = TOLERANCE);
    for i in 1..k {
        assert!(
            summary.eigenvalue[i] <= summary.eigenvalue[i - 1],
            "{}: eigenvalues not non-increasing at {}: {:?}",
            context,
            i,
            summary.eigenvalue
        );
        assert!(
            summary.cumulative[i] >= summary.cumulative[i - 1],
            "{}: cumulative variance decreased at {}",
            context,
            i
        );
    }
    assert!(summary.eigenvalue.iter().all(|&ev| ev >= 0.0), "{}: negative eigenvalue", context);
}

#[cfg(test)]
mod summary_tests {
    use super::*;

    #[test]
    fn test_fully_correlated_variables_have_one_component() -> Result<(), Box<dyn Error>> {
        let x: Vec<f64> = (1..=8).map(|v| v as f64).collect();
        let table = DataTable::new(vec![
            Column::numeric("a", x.iter().copied()),
            Column::numeric("b", x.iter().map(|v| 2.0 * v + 1.0)),
            Column::numeric("c", x.iter().map(|v| 3.0 - v)),
            Column::numeric("d", x.iter().map(|v| 0.5 * v)),
        ])?;
        let summary = summarize(PcaInput::Table(&table))?;

        assert_eq!(summary.n_components(), 4);
        assert_abs_diff_eq!(summary.proportion[0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(summary.eigenvalue[0], 4.0, epsilon = 1e-9);
        assert_eq!(summary.kaiser_count, 1);
        assert_summary_invariants(&summary, "fully correlated");

        // Every variable correlates perfectly with the first component.
        for i in 0..4 {
            assert_abs_diff_eq!(summary.raw_loadings[[i, 0]].abs(), 1.0, epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_random_data_invariants_and_total_variance() -> Result<(), Box<dyn Error>> {
        for (seed, (n, p)) in [(1u64, (50usize, 5usize)), (2, (8, 6)), (3, (4, 7))] {
            let data = generate_random_data(n, p, seed);
            let summary = summarize(PcaInput::Table(&table_from(&data)))?;
            let context = format!("{}x{}", n, p);
            assert_eq!(summary.n_components(), n.min(p), "{}: component count", context);
            assert_summary_invariants(&summary, &context);
            // Trace of a correlation matrix is the number of variables.
            assert_abs_diff_eq!(summary.eigenvalue.sum(), p as f64, epsilon = 1e-8);
        }
        Ok(())
    }

    #[test]
    fn test_eigenvalues_match_correlation_matrix_spectrum() -> Result<(), Box<dyn Error>> {
        let data = generate_random_data(40, 4, 11);
        let summary = summarize(PcaInput::Table(&table_from(&data)))?;

        let n = data.nrows() as f64;
        let mean = data.mean_axis(Axis(0)).unwrap();
        let sd = data.std_axis(Axis(0), 1.0);
        let z = (&data - &mean) / &sd;
        let correlation = z.t().dot(&z) / (n - 1.0);
        let eig = FaerLinAlgBackend.eigh_upper(correlation.view())?;
        let mut expected = eig.eigenvalues.to_vec();
        expected.sort_by(|a, b| b.partial_cmp(a).unwrap());

        for (got, want) in summary.eigenvalue.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_resummarizing_is_idempotent() -> Result<(), Box<dyn Error>> {
        let table = table_from(&generate_random_data(30, 5, 5));
        let from_table = summarize(PcaInput::Table(&table))?;
        let decomposition = Decomposition::fit(&table)?;
        let from_decomposition = summarize(PcaInput::Decomposition(&decomposition))?;
        let again = summarize(PcaInput::Summary(&from_table))?;

        assert_eq!(from_table.kaiser_count, from_decomposition.kaiser_count);
        for (a, b) in from_table.eigenvalue.iter().zip(from_decomposition.eigenvalue.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
        assert_eq!(from_table, again);
        assert_eq!(from_table.table(), again.table());
        Ok(())
    }

    #[test]
    fn test_table_orientation_and_labels() -> Result<(), Box<dyn Error>> {
        let summary = summarize(PcaInput::Table(&table_from(&generate_random_data(20, 3, 8))))?;
        let table = summary.table();
        assert_eq!(table.dim(), (PcaSummary::STATISTICS.len(), 3));
        assert_eq!(summary.components, vec!["PC1", "PC2", "PC3"]);
        for k in 0..3 {
            assert_eq!(table[[0, k]], summary.std_dev[k]);
            assert_eq!(table[[1, k]], summary.eigenvalue[k]);
            assert_eq!(table[[2, k]], summary.proportion[k]);
            assert_eq!(table[[3, k]], summary.cumulative[k]);
        }
        Ok(())
    }

    #[test]
    fn test_rows_with_missing_values_are_dropped() -> Result<(), Box<dyn Error>> {
        let data = generate_random_data(12, 3, 21);
        let complete = table_from(&data);

        let mut columns = Vec::new();
        for (j, name) in names(3).into_iter().enumerate() {
            let values: Vec<Option<f64>> = data
                .column(j)
                .iter()
                .enumerate()
                .map(|(i, &v)| if (i == 2 && j == 0) || (i == 7 && j == 2) { None } else { Some(v) })
                .collect();
            columns.push(Column::numeric_with_missing(name, values));
        }
        let with_missing = DataTable::new(columns)?;

        let kept: Vec<usize> = (0..12).filter(|&i| i != 2 && i != 7).collect();
        let reduced = table_from(&data.select(Axis(0), &kept));

        let summary = summarize(PcaInput::Table(&with_missing))?;
        let expected = summarize(PcaInput::Table(&reduced))?;
        for (a, b) in summary.eigenvalue.iter().zip(expected.eigenvalue.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
        assert_ne!(summary.eigenvalue, summarize(PcaInput::Table(&complete))?.eigenvalue);
        Ok(())
    }

    #[test]
    fn test_kaiser_count_rule() {
        assert_eq!(kaiser_count(&array![2.5, 1.0, 0.4, 0.1]), 2);
        assert_eq!(kaiser_count(&array![2.0, 1.5]), 2);
        assert_eq!(kaiser_count(&array![0.9, 0.1]), 0);
        assert_eq!(kaiser_count(&Array1::zeros(0)), 0);
    }

    #[test]
    fn test_invalid_inputs() {
        let constant = DataTable::new(vec![
            Column::numeric("a", vec![1.0, 2.0, 3.0]),
            Column::numeric("flat", vec![5.0, 5.0, 5.0]),
        ])
        .unwrap();
        match summarize(PcaInput::Table(&constant)) {
            Err(SurveyStatsError::Input { argument, .. }) => assert_eq!(argument, "flat"),
            other => panic!("expected Input error for constant column, got {:?}", other),
        }

        let categorical = DataTable::new(vec![
            Column::numeric("a", vec![1.0, 2.0, 3.0]),
            Column::categorical("region", vec!["n", "s", "n"]),
        ])
        .unwrap();
        assert!(matches!(
            summarize(PcaInput::Table(&categorical)),
            Err(SurveyStatsError::TypeMismatch { .. })
        ));

        let single_row = DataTable::new(vec![
            Column::numeric("a", vec![1.0]),
            Column::numeric("b", vec![2.0]),
        ])
        .unwrap();
        assert!(matches!(
            summarize(PcaInput::Table(&single_row)),
            Err(SurveyStatsError::Input { .. })
        ));
    }
}

#[cfg(test)]
mod decomposition_tests {
    use super::*;

    #[test]
    fn test_transform_reproduces_scores() -> Result<(), Box<dyn Error>> {
        let data = generate_random_data(25, 4, 3);
        let decomposition = Decomposition::fit_matrix(names(4), data.view())?;
        let projected = decomposition.transform(data.view())?;
        let scores = decomposition.scores().expect("fitted decompositions carry scores");
        for (a, b) in projected.iter().zip(scores.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
        // Score variances are the eigenvalues.
        for k in 0..decomposition.n_components() {
            let var = scores.column(k).var(1.0);
            assert_abs_diff_eq!(var, decomposition.sdev()[k].powi(2), epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_rotation_columns_are_orthonormal_and_oriented() -> Result<(), Box<dyn Error>> {
        let data = generate_random_data(30, 5, 17);
        let decomposition = Decomposition::fit_matrix(names(5), data.view())?;
        let rotation = decomposition.rotation();
        let gram = rotation.t().dot(rotation);
        for i in 0..gram.nrows() {
            for j in 0..gram.ncols() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[[i, j]], expected, epsilon = 1e-10);
            }
        }
        for column in rotation.columns() {
            let pivot = column
                .iter()
                .copied()
                .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
            assert!(pivot > 0.0, "largest loading should be positive: {:?}", column);
        }
        Ok(())
    }

    #[test]
    fn test_with_model_builds_raw_loadings() -> Result<(), Box<dyn Error>> {
        let rotation = array![[0.8, -0.6], [0.6, 0.8]];
        let sdev = array![1.2, 0.5];
        let decomposition =
            Decomposition::with_model(vec!["x".into(), "y".into()], sdev, rotation, None, None)?;
        let summary = summarize(PcaInput::Decomposition(&decomposition))?;
        assert_abs_diff_eq!(summary.raw_loadings[[0, 0]], 0.96, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.raw_loadings[[1, 1]], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.eigenvalue[0], 1.44, epsilon = 1e-12);
        assert_eq!(summary.kaiser_count, 1);

        // No center/scale: transform is not possible.
        assert!(decomposition.transform(array![[1.0, 2.0]].view()).is_err());
        Ok(())
    }

    #[test]
    fn test_with_model_rejects_inconsistent_parts() {
        let rotation = Array2::<f64>::eye(2);
        let unsorted = Decomposition::with_model(
            vec!["x".into(), "y".into()],
            array![0.5, 1.2],
            rotation.clone(),
            None,
            None,
        );
        assert!(matches!(unsorted, Err(SurveyStatsError::Input { .. })));

        let wrong_names =
            Decomposition::with_model(vec!["x".into()], array![1.2, 0.5], rotation.clone(), None, None);
        assert!(matches!(wrong_names, Err(SurveyStatsError::Input { .. })));

        let bad_scale = Decomposition::with_model(
            vec!["x".into(), "y".into()],
            array![1.2, 0.5],
            rotation,
            Some(array![0.0, 0.0]),
            Some(array![1.0, 0.0]),
        );
        assert!(matches!(bad_scale, Err(SurveyStatsError::Input { .. })));
    }
}
