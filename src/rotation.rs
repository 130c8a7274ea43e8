// Rotation of principal component loadings

use log::{debug, trace, warn};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SurveyStatsError};
use crate::linalg_backends::{orthogonal_polar_factor, symmetric_inverse, FaerLinAlgBackend};
use crate::pca::{component_labels, cumulative_sum, summarize, Decomposition, PcaInput, PcaSummary};
use crate::table::DataTable;

/// Rotation criteria accepted by [`RotationEngine::rotate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RotationKind {
    Varimax,
    Quartimax,
    Promax,
    Oblimin,
    Simplimax,
    Cluster,
    None,
}

impl RotationKind {
    pub const ALL: [RotationKind; 7] = [
        RotationKind::Varimax,
        RotationKind::Quartimax,
        RotationKind::Promax,
        RotationKind::Oblimin,
        RotationKind::Simplimax,
        RotationKind::Cluster,
        RotationKind::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RotationKind::Varimax => "varimax",
            RotationKind::Quartimax => "quartimax",
            RotationKind::Promax => "promax",
            RotationKind::Oblimin => "oblimin",
            RotationKind::Simplimax => "simplimax",
            RotationKind::Cluster => "cluster",
            RotationKind::None => "none",
        }
    }

    /// Whether the rotation keeps components uncorrelated.
    pub fn is_orthogonal(&self) -> bool {
        matches!(
            self,
            RotationKind::Varimax | RotationKind::Quartimax | RotationKind::None
        )
    }
}

impl fmt::Display for RotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationKind {
    type Err = SurveyStatsError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        RotationKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                SurveyStatsError::input(
                    "rotation",
                    format!(
                        "one of varimax, quartimax, promax, oblimin, simplimax, cluster, none (found `{}`)",
                        s
                    ),
                )
            })
    }
}

/// Tuning parameters for the iterative rotation criteria.
#[derive(Clone, Debug)]
pub struct RotationConfig {
    /// Iteration cap for varimax.
    pub max_iterations: usize,
    /// Relative improvement of the varimax criterion below which iteration stops.
    pub tolerance: f64,
    /// Row-normalize loadings (Kaiser normalization) before varimax.
    pub kaiser_normalize: bool,
    /// Power of the promax target, `m` in `L * |L|^(m-1)`.
    pub promax_power: i32,
    /// Iteration cap for the gradient projection used by quartimax.
    pub gpa_max_iterations: usize,
    /// Projected-gradient norm below which gradient projection stops.
    pub gpa_tolerance: f64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            max_iterations: 1000,
            tolerance: 1e-5,
            kaiser_normalize: true,
            promax_power: 4,
            gpa_max_iterations: 1000,
            gpa_tolerance: 1e-5,
        }
    }
}

/// Varimax rotation of a loading matrix, shape (n_variables, n_factors).
///
/// Maximizes the variance of squared loadings within each column by
/// repeated SVD of the criterion gradient. Matrices with fewer than two
/// columns are returned unchanged.
pub fn varimax(loadings: ArrayView2<f64>, config: &RotationConfig) -> Result<Array2<f64>> {
    let (p, nc) = loadings.dim();
    if nc < 2 {
        return Ok(loadings.to_owned());
    }

    let row_norms: Array1<f64> = if config.kaiser_normalize {
        loadings
            .map_axis(Axis(1), |row| row.dot(&row).sqrt())
            .mapv(|norm| if norm > 0.0 { norm } else { 1.0 })
    } else {
        Array1::ones(p)
    };
    let row_norms_col = row_norms.view().insert_axis(Axis(1));
    let x = &loadings / &row_norms_col;

    let backend = FaerLinAlgBackend;
    let mut tt = Array2::<f64>::eye(nc);
    let mut d = 0.0;
    let mut converged = false;
    for iteration in 0..config.max_iterations {
        let z = x.dot(&tt);
        let column_ss = z.mapv(|v| v * v).sum_axis(Axis(0));
        let gradient = z.mapv(|v| v.powi(3)) - &((&z * &column_ss) / p as f64);
        let b = x.t().dot(&gradient);
        let (polar, singular_sum) = orthogonal_polar_factor(&backend, b.view())?;
        tt = polar;
        let d_past = d;
        d = singular_sum;
        trace!("varimax iteration {}: criterion {:.8}", iteration, d);
        if d < d_past * (1.0 + config.tolerance) {
            converged = true;
            break;
        }
    }
    if !converged {
        warn!(
            "Varimax did not converge within {} iterations.",
            config.max_iterations
        );
    }

    Ok(x.dot(&tt) * &row_norms_col)
}

/// Quartimax criterion: `f = -sum(L^4) / 4`, gradient `-L^3`.
fn quartimax_criterion(l: &Array2<f64>) -> (f64, Array2<f64>) {
    let f = -l.mapv(|v| v.powi(4)).sum() / 4.0;
    (f, l.mapv(|v| -v.powi(3)))
}

const MAX_STEP_HALVINGS: usize = 10;

/// Orthogonal gradient projection rotation (Jennrich 2001) for a criterion
/// returning `(value, gradient)` at a loading matrix.
fn gradient_projection_orthogonal<F>(
    a: ArrayView2<f64>,
    criterion: F,
    config: &RotationConfig,
) -> Result<Array2<f64>>
where
    F: Fn(&Array2<f64>) -> (f64, Array2<f64>),
{
    let k = a.ncols();
    if k < 2 {
        return Ok(a.to_owned());
    }
    let backend = FaerLinAlgBackend;

    let mut t = Array2::<f64>::eye(k);
    let (mut f, gq) = criterion(&a.dot(&t));
    let mut g = a.t().dot(&gq);
    let mut alpha = 1.0;
    let mut converged = false;

    for iteration in 0..config.gpa_max_iterations {
        let m = t.t().dot(&g);
        let sym = (&m + &m.t()) / 2.0;
        let gp = &g - &t.dot(&sym);
        let s = gp.mapv(|v| v * v).sum().sqrt();
        trace!("gradient projection iteration {}: f = {:.8}, |Gp| = {:.3e}", iteration, f, s);
        if s < config.gpa_tolerance {
            converged = true;
            break;
        }

        // Step-halving line search along the projected gradient; the last
        // candidate is taken if no step gives sufficient decrease.
        alpha *= 2.0;
        let mut halvings = 0;
        let (t_next, f_next, gq_next) = loop {
            let candidate = &t - &(&gp * alpha);
            let (polar, _) = orthogonal_polar_factor(&backend, candidate.view())?;
            let (value, gradient) = criterion(&a.dot(&polar));
            let sufficient = value < f - 0.5 * s * s * alpha;
            if !sufficient {
                alpha /= 2.0;
            }
            if sufficient || halvings == MAX_STEP_HALVINGS {
                break (polar, value, gradient);
            }
            halvings += 1;
        };
        t = t_next;
        f = f_next;
        g = a.t().dot(&gq_next);
    }
    if !converged {
        warn!(
            "Gradient projection rotation did not converge within {} iterations.",
            config.gpa_max_iterations
        );
    }
    Ok(a.dot(&t))
}

/// Orthogonal quartimax rotation.
pub fn quartimax(loadings: ArrayView2<f64>, config: &RotationConfig) -> Result<Array2<f64>> {
    gradient_projection_orthogonal(loadings, quartimax_criterion, config)
}

/// Promax: varimax followed by an oblique least-squares fit to the
/// power target `L * |L|^(m-1)`, with columns rescaled so that the
/// implied factor variances are one.
pub fn promax(loadings: ArrayView2<f64>, config: &RotationConfig) -> Result<Array2<f64>> {
    if loadings.ncols() < 2 {
        return Ok(loadings.to_owned());
    }
    let backend = FaerLinAlgBackend;
    let x = varimax(loadings, config)?;
    let m = config.promax_power;
    let target = x.mapv(|v| v * v.abs().powi(m - 1));

    let xtx_inv = symmetric_inverse(&backend, x.t().dot(&x).view())?;
    let u = xtx_inv.dot(&x.t().dot(&target));
    let utu_inv = symmetric_inverse(&backend, u.t().dot(&u).view())?;
    let scale = utu_inv.diag().mapv(f64::sqrt);
    let u = &u * &scale;
    Ok(x.dot(&u))
}

/// An external factor-analysis routine for the rotations that re-fit from
/// raw data.
pub trait FactorRotator: Send + Sync {
    /// Whether `rotate` can handle `kind`.
    fn supports(&self, kind: RotationKind) -> bool;

    /// Returns loadings of shape (n_columns_of_data, nf). `nf = None` means
    /// the routine's own default.
    fn rotate(
        &self,
        data: &DataTable,
        nf: Option<usize>,
        kind: RotationKind,
        config: &RotationConfig,
    ) -> Result<Array2<f64>>;
}

/// Built-in rotator: principal component loadings of the raw data,
/// unrotated, quartimax- or promax-rotated. Varimax is handled by
/// [`RotationEngine`] itself, and there is no oblimin, simplimax or
/// cluster implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrincipalComponentRotator;

impl PrincipalComponentRotator {
    /// Factor count used when the caller gives none.
    pub const DEFAULT_FACTORS: usize = 1;
}

impl FactorRotator for PrincipalComponentRotator {
    fn supports(&self, kind: RotationKind) -> bool {
        matches!(
            kind,
            RotationKind::None | RotationKind::Quartimax | RotationKind::Promax
        )
    }

    fn rotate(
        &self,
        data: &DataTable,
        nf: Option<usize>,
        kind: RotationKind,
        config: &RotationConfig,
    ) -> Result<Array2<f64>> {
        let summary = summarize(PcaInput::Table(data))?;
        let nf = nf.unwrap_or(Self::DEFAULT_FACTORS);
        check_factor_count(nf, summary.n_components())?;
        let loadings = summary.raw_loadings.slice(s![.., ..nf]);
        match kind {
            RotationKind::None => Ok(loadings.to_owned()),
            RotationKind::Quartimax => quartimax(loadings, config),
            RotationKind::Promax => promax(loadings, config),
            other => Err(missing_rotation(other)),
        }
    }
}

fn missing_rotation(kind: RotationKind) -> SurveyStatsError {
    SurveyStatsError::MissingDependency {
        capability: format!("a factor-analysis routine providing `{}` rotation", kind),
    }
}

fn check_factor_count(nf: usize, available: usize) -> Result<()> {
    if nf == 0 || nf > available {
        return Err(SurveyStatsError::input(
            "nf",
            format!("a component count between 1 and {} (found {})", available, nf),
        ));
    }
    Ok(())
}

/// What [`RotationEngine::rotate`] accepts.
#[derive(Debug, Clone, Copy)]
pub enum RotationInput<'a> {
    Table(&'a DataTable),
    Decomposition(&'a Decomposition),
    Summary(&'a PcaSummary),
}

/// Variance explained by each rotated component.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RotationVariance {
    /// Column sum of squared loadings over the number of variables.
    pub proportion: Array1<f64>,
    pub cumulative: Array1<f64>,
    /// `proportion` relative to the total over the retained components.
    pub proportion_explained: Array1<f64>,
    pub cumulative_explained: Array1<f64>,
}

impl RotationVariance {
    fn from_loadings(loadings: &Array2<f64>) -> Self {
        let n_vars = loadings.nrows().max(1) as f64;
        let proportion = loadings.mapv(|v| v * v).sum_axis(Axis(0)) / n_vars;
        let cumulative = cumulative_sum(&proportion);
        let total = proportion.sum();
        let proportion_explained = if total > 0.0 {
            &proportion / total
        } else {
            Array1::zeros(proportion.len())
        };
        let cumulative_explained = cumulative_sum(&proportion_explained);
        Self {
            proportion,
            cumulative,
            proportion_explained,
            cumulative_explained,
        }
    }
}

/// Rotated loadings, variables as rows and components as columns.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RotatedLoadings {
    pub kind: RotationKind,
    /// Component labels, `PC1..PCnf`.
    pub components: Vec<String>,
    pub variable_names: Vec<String>,
    /// Shape: (n_variables, nf)
    pub loadings: Array2<f64>,
    pub variance: RotationVariance,
}

impl RotatedLoadings {
    fn new(kind: RotationKind, variable_names: Vec<String>, loadings: Array2<f64>) -> Self {
        let variance = RotationVariance::from_loadings(&loadings);
        Self {
            kind,
            components: component_labels(loadings.ncols()),
            variable_names,
            loadings,
            variance,
        }
    }

    pub fn n_factors(&self) -> usize {
        self.loadings.ncols()
    }
}

/// Dispatches a rotation request to varimax on the principal component
/// loadings or to an injected [`FactorRotator`].
pub struct RotationEngine {
    config: RotationConfig,
    rotator: Option<Box<dyn FactorRotator>>,
}

impl Default for RotationEngine {
    fn default() -> Self {
        Self::new(RotationConfig::default())
    }
}

impl fmt::Debug for RotationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationEngine")
            .field("config", &self.config)
            .field("has_rotator", &self.rotator.is_some())
            .finish()
    }
}

impl RotationEngine {
    /// Engine with the built-in [`PrincipalComponentRotator`].
    pub fn new(config: RotationConfig) -> Self {
        Self {
            config,
            rotator: Some(Box::new(PrincipalComponentRotator)),
        }
    }

    pub fn with_rotator(mut self, rotator: Box<dyn FactorRotator>) -> Self {
        self.rotator = Some(rotator);
        self
    }

    /// Engine that can only do varimax.
    pub fn without_rotator(mut self) -> Self {
        self.rotator = None;
        self
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Rotates the first `nf` components.
    ///
    /// Varimax reuses the principal component loadings of the input (a raw
    /// table is summarized first) and defaults `nf` to the Kaiser count.
    /// Every other kind re-fits from raw data through the injected rotator,
    /// which also decides the default `nf`.
    ///
    /// # Errors
    /// - `Input` if a non-varimax kind is requested on anything but a raw table,
    ///   or `nf` is zero or exceeds the available components.
    /// - `MissingDependency` if no injected rotator supports `kind`.
    pub fn rotate(
        &self,
        input: RotationInput<'_>,
        nf: Option<usize>,
        kind: RotationKind,
    ) -> Result<RotatedLoadings> {
        debug!("Rotating principal components: kind={}, nf={:?}.", kind, nf);
        match kind {
            RotationKind::Varimax => {
                let summary = match input {
                    RotationInput::Table(table) => summarize(PcaInput::Table(table))?,
                    RotationInput::Decomposition(d) => summarize(PcaInput::Decomposition(d))?,
                    RotationInput::Summary(summary) => summary.clone(),
                };
                let nf = nf.unwrap_or(summary.kaiser_count);
                check_factor_count(nf, summary.n_components())?;
                let loadings = varimax(summary.raw_loadings.slice(s![.., ..nf]), &self.config)?;
                Ok(RotatedLoadings::new(kind, summary.variable_names, loadings))
            }
            other => {
                let table = match input {
                    RotationInput::Table(table) => table,
                    _ => {
                        return Err(SurveyStatsError::input(
                            "x",
                            format!("a raw data table for `{}` rotation", other),
                        ))
                    }
                };
                let rotator = self
                    .rotator
                    .as_deref()
                    .filter(|r| r.supports(other))
                    .ok_or_else(|| missing_rotation(other))?;
                let loadings = rotator.rotate(table, nf, other, &self.config)?;
                let variable_names = table.column_names();
                if loadings.nrows() != variable_names.len() {
                    return Err(SurveyStatsError::input(
                        "rotator",
                        format!(
                            "loadings with one row per column of `x` ({} rows, found {})",
                            variable_names.len(),
                            loadings.nrows()
                        ),
                    ));
                }
                Ok(RotatedLoadings::new(other, variable_names, loadings))
            }
        }
    }
}

/// Rotates with a default-configured [`RotationEngine`].
pub fn pca_rotate(
    input: RotationInput<'_>,
    nf: Option<usize>,
    kind: RotationKind,
) -> Result<RotatedLoadings> {
    RotationEngine::default().rotate(input, nf, kind)
}
