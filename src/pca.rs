// Principal component analysis (PCA) summaries

use log::{debug, warn};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SurveyStatsError};
use crate::linalg_backends::{BackendSVD, FaerLinAlgBackend};
use crate::table::DataTable;

/// Columns whose standard deviation falls below this are treated as constant.
const CONSTANT_COLUMN_THRESHOLD: f64 = 1e-12;

/// A principal component decomposition of standardized data.
///
/// This mirrors the usual `prcomp(x, center = TRUE, scale. = TRUE)` layout:
/// component standard deviations are `d / sqrt(n - 1)` where `d` are the
/// singular values of the standardized data matrix, and the rotation holds
/// the right singular vectors. Components are ordered by descending
/// standard deviation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Decomposition {
    /// Standard deviation of each principal component, non-increasing.
    /// Shape: (k_components)
    sdev: Array1<f64>,
    /// The rotation matrix (unit-length principal axes as columns).
    /// Shape: (n_variables, k_components)
    rotation: Array2<f64>,
    /// Column means of the data the decomposition was fitted on.
    /// Shape: (n_variables)
    center: Option<Array1<f64>>,
    /// Column standard deviations (n - 1 denominator) of the fitted data.
    /// Shape: (n_variables)
    scale: Option<Array1<f64>>,
    /// Principal component scores of the fitted observations.
    /// Shape: (n_observations, k_components)
    scores: Option<Array2<f64>>,
    variable_names: Vec<String>,
}

impl Decomposition {
    /// Fits a decomposition to the numeric columns of `table`.
    ///
    /// Rows with a missing value in any column are dropped before fitting.
    ///
    /// # Errors
    /// - `TypeMismatch` if a column is categorical.
    /// - `Input` if fewer than 2 complete rows remain or a column is constant.
    pub fn fit(table: &DataTable) -> Result<Self> {
        let cases = table.complete_numeric_matrix()?;
        let dropped = table.n_rows() - cases.rows.len();
        if dropped > 0 {
            warn!(
                "Dropped {} of {} rows with missing values before decomposition.",
                dropped,
                table.n_rows()
            );
        }
        Self::fit_matrix(cases.names, cases.matrix.view())
    }

    /// Fits a decomposition to a dense matrix, shape (n_observations, n_variables).
    pub fn fit_matrix(variable_names: Vec<String>, data_matrix: ArrayView2<f64>) -> Result<Self> {
        let (n_samples, n_features) = data_matrix.dim();
        debug!(
            "Fitting principal components on {} observations x {} variables.",
            n_samples, n_features
        );

        if variable_names.len() != n_features {
            return Err(SurveyStatsError::input(
                "variable_names",
                format!("{} names (found {})", n_features, variable_names.len()),
            ));
        }
        if n_features == 0 {
            return Err(SurveyStatsError::input("x", "at least one variable"));
        }
        if n_samples < 2 {
            return Err(SurveyStatsError::input(
                "x",
                format!("at least 2 complete observations (found {})", n_samples),
            ));
        }

        let mean_vector = data_matrix
            .mean_axis(Axis(0))
            .ok_or_else(|| SurveyStatsError::input("x", "a non-empty data matrix"))?;
        let mut standardized = &data_matrix - &mean_vector;

        let std_dev_vector = standardized.map_axis(Axis(0), |column| column.std(1.0));
        if let Some(j) = std_dev_vector
            .iter()
            .position(|&sd| !(sd > CONSTANT_COLUMN_THRESHOLD))
        {
            return Err(SurveyStatsError::input(
                variable_names[j].clone(),
                "a non-constant column (cannot rescale a constant column to unit variance)",
            ));
        }
        standardized /= &std_dev_vector;

        let svd = FaerLinAlgBackend.thin_svd(standardized.view())?;
        let k = svd.s.len();

        // Components by descending singular value.
        let mut order: Vec<usize> = (0..k).collect();
        order.sort_by(|&a, &b| {
            svd.s[b]
                .partial_cmp(&svd.s[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let denom = ((n_samples - 1) as f64).sqrt();
        let mut sdev = Array1::<f64>::zeros(k);
        let mut rotation = Array2::<f64>::zeros((n_features, k));
        for (dest, &src) in order.iter().enumerate() {
            sdev[dest] = svd.s[src].max(0.0) / denom;
            let mut axis = svd.vt.row(src).to_owned();
            // Orient so the largest-magnitude loading is positive.
            let pivot = axis
                .iter()
                .copied()
                .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
            if pivot < 0.0 {
                axis.mapv_inplace(|v| -v);
            }
            rotation.slice_mut(s![.., dest]).assign(&axis);
        }

        let scores = standardized.dot(&rotation);

        Ok(Self {
            sdev,
            rotation,
            center: Some(mean_vector),
            scale: Some(std_dev_vector),
            scores: Some(scores),
            variable_names,
        })
    }

    /// Creates a decomposition from precomputed parts.
    ///
    /// * `sdev` - component standard deviations, non-negative and non-increasing.
    /// * `rotation` - shape (n_variables, k_components).
    /// * `center`, `scale` - optional, only needed by [`Decomposition::transform`].
    pub fn with_model(
        variable_names: Vec<String>,
        sdev: Array1<f64>,
        rotation: Array2<f64>,
        center: Option<Array1<f64>>,
        scale: Option<Array1<f64>>,
    ) -> Result<Self> {
        let (n_vars, k) = rotation.dim();
        if variable_names.len() != n_vars {
            return Err(SurveyStatsError::input(
                "variable_names",
                format!("{} names to match the rotation rows (found {})", n_vars, variable_names.len()),
            ));
        }
        if sdev.len() != k {
            return Err(SurveyStatsError::input(
                "sdev",
                format!("{} standard deviations to match the rotation columns (found {})", k, sdev.len()),
            ));
        }
        if sdev.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(SurveyStatsError::input("sdev", "finite, non-negative standard deviations"));
        }
        if sdev.windows(2).into_iter().any(|w| w[1] > w[0]) {
            return Err(SurveyStatsError::input(
                "sdev",
                "standard deviations sorted in non-increasing order",
            ));
        }
        for (argument, vector) in [("center", &center), ("scale", &scale)] {
            if let Some(v) = vector {
                if v.len() != n_vars {
                    return Err(SurveyStatsError::input(
                        argument,
                        format!("a vector of length {} (found {})", n_vars, v.len()),
                    ));
                }
            }
        }
        if let Some(sc) = &scale {
            if sc.iter().any(|v| !(*v > CONSTANT_COLUMN_THRESHOLD) || !v.is_finite()) {
                return Err(SurveyStatsError::input("scale", "finite, positive scale factors"));
            }
        }
        Ok(Self {
            sdev,
            rotation,
            center,
            scale,
            scores: None,
            variable_names,
        })
    }

    pub fn sdev(&self) -> &Array1<f64> {
        &self.sdev
    }

    pub fn rotation(&self) -> &Array2<f64> {
        &self.rotation
    }

    pub fn center(&self) -> Option<&Array1<f64>> {
        self.center.as_ref()
    }

    pub fn scale(&self) -> Option<&Array1<f64>> {
        self.scale.as_ref()
    }

    /// Scores of the observations the decomposition was fitted on, if fitted here.
    pub fn scores(&self) -> Option<&Array2<f64>> {
        self.scores.as_ref()
    }

    pub fn variable_names(&self) -> &[String] {
        &self.variable_names
    }

    pub fn n_components(&self) -> usize {
        self.sdev.len()
    }

    /// Projects new observations, shape (n, n_variables), onto the components.
    ///
    /// # Errors
    /// Returns `Input` if the decomposition carries no center/scale or the
    /// column count does not match.
    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        match (&self.center, &self.scale) {
            (Some(center), Some(scale)) => {
                if x.ncols() != center.len() {
                    return Err(SurveyStatsError::input(
                        "x",
                        format!("{} columns (found {})", center.len(), x.ncols()),
                    ));
                }
                let standardized = (&x - center) / scale;
                Ok(standardized.dot(&self.rotation))
            }
            _ => Err(SurveyStatsError::input(
                "decomposition",
                "a decomposition carrying center and scale vectors",
            )),
        }
    }
}

/// What [`summarize`] accepts.
#[derive(Debug, Clone, Copy)]
pub enum PcaInput<'a> {
    /// Raw observations; fitted with [`Decomposition::fit`] first.
    Table(&'a DataTable),
    Decomposition(&'a Decomposition),
    /// An earlier summary; summarizing it again yields the same statistics.
    Summary(&'a PcaSummary),
}

/// Per-component variance summary of a decomposition.
///
/// Statistics are stored component-major. [`PcaSummary::table`] gives the
/// display orientation, statistics as rows and components as columns.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PcaSummary {
    /// Component labels, `PC1..PCk`.
    pub components: Vec<String>,
    pub variable_names: Vec<String>,
    pub std_dev: Array1<f64>,
    /// Squared standard deviations.
    pub eigenvalue: Array1<f64>,
    /// Eigenvalue over the sum of all eigenvalues.
    pub proportion: Array1<f64>,
    pub cumulative: Array1<f64>,
    /// Number of components with eigenvalue >= 1 (Kaiser criterion).
    pub kaiser_count: usize,
    /// Loadings scaled by component standard deviation, `rotation * diag(sdev)`.
    /// Shape: (n_variables, k_components)
    pub raw_loadings: Array2<f64>,
}

impl PcaSummary {
    /// Row labels of [`PcaSummary::table`].
    pub const STATISTICS: [&'static str; 4] = [
        "Standard deviation",
        "Eigenvalue",
        "Proportion variance",
        "Cumulative variance",
    ];

    pub fn n_components(&self) -> usize {
        self.std_dev.len()
    }

    /// Statistics x components matrix, rows in the order of [`PcaSummary::STATISTICS`].
    pub fn table(&self) -> Array2<f64> {
        let k = self.n_components();
        let mut table = Array2::<f64>::zeros((Self::STATISTICS.len(), k));
        table.row_mut(0).assign(&self.std_dev);
        table.row_mut(1).assign(&self.eigenvalue);
        table.row_mut(2).assign(&self.proportion);
        table.row_mut(3).assign(&self.cumulative);
        table
    }
}

pub(crate) fn component_labels(k: usize) -> Vec<String> {
    (1..=k).map(|i| format!("PC{}", i)).collect()
}

pub(crate) fn cumulative_sum(values: &Array1<f64>) -> Array1<f64> {
    values
        .iter()
        .scan(0.0, |acc, &v| {
            *acc += v;
            Some(*acc)
        })
        .collect()
}

/// Kaiser count: index of the first eigenvalue below 1. When no eigenvalue
/// is below 1 every component is retained.
pub(crate) fn kaiser_count(eigenvalues: &Array1<f64>) -> usize {
    eigenvalues
        .iter()
        .position(|&ev| ev < 1.0)
        .unwrap_or(eigenvalues.len())
}

fn summarize_parts(
    variable_names: Vec<String>,
    std_dev: Array1<f64>,
    raw_loadings: Array2<f64>,
) -> Result<PcaSummary> {
    let eigenvalue = std_dev.mapv(|sd| sd * sd);
    let total: f64 = eigenvalue.sum();
    if !(total > 0.0) {
        return Err(SurveyStatsError::input(
            "x",
            "a decomposition with positive total variance",
        ));
    }
    let proportion = &eigenvalue / total;
    let cumulative = cumulative_sum(&proportion);
    let kaiser = kaiser_count(&eigenvalue);
    debug!(
        "Summarized {} components, Kaiser criterion retains {}.",
        std_dev.len(),
        kaiser
    );
    Ok(PcaSummary {
        components: component_labels(std_dev.len()),
        variable_names,
        std_dev,
        eigenvalue,
        proportion,
        cumulative,
        kaiser_count: kaiser,
        raw_loadings,
    })
}

/// Per-component variance summary of a table, a decomposition, or an earlier summary.
///
/// # Examples
///
/// ```
/// use ndarray::array;
/// use survey_stats::pca::{summarize, PcaInput};
/// use survey_stats::table::DataTable;
///
/// let data = array![[1.0, 2.0], [2.0, 4.5], [3.0, 5.5], [4.0, 8.0]];
/// let table = DataTable::from_matrix(&["a", "b"], &data).unwrap();
/// let summary = summarize(PcaInput::Table(&table)).unwrap();
/// assert_eq!(summary.kaiser_count, 1);
/// assert!((summary.cumulative[1] - 1.0).abs() < 1e-9);
/// ```
pub fn summarize(input: PcaInput<'_>) -> Result<PcaSummary> {
    match input {
        PcaInput::Table(table) => {
            let decomposition = Decomposition::fit(table)?;
            summarize(PcaInput::Decomposition(&decomposition))
        }
        PcaInput::Decomposition(d) => {
            let raw_loadings = &d.rotation * &d.sdev;
            summarize_parts(d.variable_names.clone(), d.sdev.clone(), raw_loadings)
        }
        PcaInput::Summary(summary) => summarize_parts(
            summary.variable_names.clone(),
            summary.std_dev.clone(),
            summary.raw_loadings.clone(),
        ),
    }
}
