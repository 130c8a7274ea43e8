// Goodness-of-fit statistics for fitted regression models

use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SurveyStatsError};

/// Consistency constant that makes the MAD estimate the normal standard deviation.
const MAD_CONSTANT: f64 = 1.4826;

/// Response distribution of a generalized or mixed model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Family {
    Gaussian,
    Binomial,
    Poisson,
    NegativeBinomial { theta: f64 },
    Gamma { dispersion: f64 },
}

impl Family {
    /// Variance function `V(mu)` on the response scale.
    pub fn variance(&self, mu: f64) -> f64 {
        match *self {
            Family::Gaussian => 1.0,
            Family::Binomial => mu * (1.0 - mu),
            Family::Poisson => mu,
            Family::NegativeBinomial { theta } => mu + mu * mu / theta,
            Family::Gamma { dispersion } => dispersion * mu * mu,
        }
    }
}

/// Fitting engine a mixed model came from. Both are handled identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixedEngine {
    Lme4,
    GlmmTmb,
}

/// Ordinary least squares fit.
#[derive(Debug, Clone)]
pub struct LinearFit {
    pub observed: Array1<f64>,
    pub fitted: Array1<f64>,
    /// Predictors excluding the intercept.
    pub n_predictors: usize,
}

/// Generalized linear model fit. `fitted` is on the response scale.
#[derive(Debug, Clone)]
pub struct GeneralizedFit {
    pub family: Family,
    pub observed: Array1<f64>,
    pub fitted: Array1<f64>,
    pub log_lik: f64,
    /// Log-likelihood of the intercept-only model.
    pub null_log_lik: f64,
}

/// Mixed-effects model fit.
#[derive(Debug, Clone)]
pub struct MixedFit {
    pub engine: MixedEngine,
    pub family: Family,
    /// Fixed-effects part of the linear predictor, `X beta`, per observation.
    pub fixed_linear_predictor: Array1<f64>,
    /// Random-effect variance components.
    pub random_effect_variances: Vec<f64>,
    /// Residual variance; required for the Gaussian family, ignored otherwise.
    pub residual_variance: Option<f64>,
    /// Predicted response on the response scale, per observation.
    pub fitted_response: Array1<f64>,
}

/// Two-level hierarchical model fit.
#[derive(Debug, Clone)]
pub struct HierarchicalFit {
    pub observed: Array1<f64>,
    pub fitted: Array1<f64>,
    pub residual_variance: f64,
    /// Random-intercept variance (tau00).
    pub intercept_variance: f64,
    /// Random-slope variance (tau11), if the model has one.
    pub slope_variance: Option<f64>,
}

/// Bayesian posterior model.
#[derive(Debug, Clone)]
pub struct BayesianFit {
    pub observed: Array1<f64>,
    /// Posterior draws of the expected response.
    /// Shape: (n_draws, n_observations)
    pub posterior_predictions: Array2<f64>,
    /// Leave-one-out predictive means, if a LOO routine was run.
    pub loo_predictions: Option<Array1<f64>>,
}

/// The closed set of model kinds [`r2`] knows a formula for.
#[derive(Debug, Clone)]
pub enum FittedModel {
    Linear(LinearFit),
    Generalized(GeneralizedFit),
    Mixed(MixedFit),
    Hierarchical(HierarchicalFit),
    Bayesian(BayesianFit),
    /// Anything else; [`r2`] returns `Ok(None)` for it.
    Unsupported { class: String },
}

impl FittedModel {
    pub fn kind_name(&self) -> &str {
        match self {
            FittedModel::Linear(_) => "linear",
            FittedModel::Generalized(_) => "generalized-linear",
            FittedModel::Mixed(_) => "mixed-effects",
            FittedModel::Hierarchical(_) => "hierarchical",
            FittedModel::Bayesian(_) => "bayesian",
            FittedModel::Unsupported { class } => class,
        }
    }
}

/// Options for [`r2`].
#[derive(Clone, Debug, Default)]
pub struct R2Options {
    /// For Bayesian models, report the leave-one-out adjusted R² instead.
    pub loo_adjusted: bool,
}

/// Variance decomposition behind a mixed-model R².
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarianceComponents {
    pub fixed: f64,
    pub random: f64,
    pub residual: f64,
}

/// R²-like statistics for one model. Values are never clamped to [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GoodnessOfFit {
    Linear {
        r2: f64,
        adj_r2: f64,
    },
    PseudoR2 {
        cox_snell: f64,
        nagelkerke: f64,
    },
    Mixed {
        engine: MixedEngine,
        marginal: f64,
        conditional: f64,
        variance: VarianceComponents,
    },
    Hierarchical {
        r2: f64,
        omega2: f64,
    },
    NullComparison {
        tau00: f64,
        tau11: Option<f64>,
        omega2: f64,
    },
    Bayesian {
        r2: f64,
        mad: f64,
    },
    LooAdjusted {
        r2: f64,
    },
}

impl GoodnessOfFit {
    /// Named values for display.
    pub fn values(&self) -> Vec<(&'static str, f64)> {
        match self {
            GoodnessOfFit::Linear { r2, adj_r2 } => vec![("R2", *r2), ("adj.R2", *adj_r2)],
            GoodnessOfFit::PseudoR2 {
                cox_snell,
                nagelkerke,
            } => vec![("CoxSnell", *cox_snell), ("Nagelkerke", *nagelkerke)],
            GoodnessOfFit::Mixed {
                marginal,
                conditional,
                ..
            } => vec![("R2_marginal", *marginal), ("R2_conditional", *conditional)],
            GoodnessOfFit::Hierarchical { r2, omega2 } => vec![("R2", *r2), ("O2", *omega2)],
            GoodnessOfFit::NullComparison {
                tau00,
                tau11,
                omega2,
            } => {
                let mut values = vec![("R2(tau-00)", *tau00)];
                if let Some(t) = tau11 {
                    values.push(("R2(tau-11)", *t));
                }
                values.push(("O2", *omega2));
                values
            }
            GoodnessOfFit::Bayesian { r2, mad } => vec![("R2", *r2), ("MAD", *mad)],
            GoodnessOfFit::LooAdjusted { r2 } => vec![("R2_loo", *r2)],
        }
    }
}

fn check_paired(
    observed: &Array1<f64>,
    fitted: &Array1<f64>,
    fitted_name: &str,
    min_len: usize,
) -> Result<()> {
    if observed.len() != fitted.len() {
        return Err(SurveyStatsError::input(
            fitted_name,
            format!("{} values to match `observed` (found {})", observed.len(), fitted.len()),
        ));
    }
    if observed.len() < min_len {
        return Err(SurveyStatsError::input(
            "observed",
            format!("at least {} observations (found {})", min_len, observed.len()),
        ));
    }
    Ok(())
}

fn sample_variance(values: ArrayView1<f64>) -> f64 {
    values.var(1.0)
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

fn median_absolute_deviation(values: &[f64], center: f64) -> f64 {
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    MAD_CONSTANT * median(&mut deviations)
}

fn pearson_correlation(x: &Array1<f64>, y: &Array1<f64>) -> f64 {
    let (mx, my) = (x.mean().unwrap_or(0.0), y.mean().unwrap_or(0.0));
    let dx = x - mx;
    let dy = y - my;
    dx.dot(&dy) / (dx.dot(&dx) * dy.dot(&dy)).sqrt()
}

fn linear_r2(fit: &LinearFit) -> Result<GoodnessOfFit> {
    check_paired(&fit.observed, &fit.fitted, "fitted", 2)?;
    let n = fit.observed.len() as f64;
    let mean = fit.observed.mean().unwrap_or(0.0);
    let ss_tot: f64 = fit.observed.iter().map(|y| (y - mean).powi(2)).sum();
    if !(ss_tot > 0.0) {
        return Err(SurveyStatsError::input("observed", "a non-constant response"));
    }
    let ss_res: f64 = (&fit.observed - &fit.fitted).mapv(|e| e * e).sum();
    let r2 = 1.0 - ss_res / ss_tot;

    let df_resid = n - fit.n_predictors as f64 - 1.0;
    if df_resid <= 0.0 {
        return Err(SurveyStatsError::input(
            "n_predictors",
            format!(
                "fewer predictors than observations minus one ({} predictors, {} observations)",
                fit.n_predictors, n
            ),
        ));
    }
    let adj_r2 = 1.0 - (1.0 - r2) * (n - 1.0) / df_resid;
    Ok(GoodnessOfFit::Linear { r2, adj_r2 })
}

fn pseudo_r2(fit: &GeneralizedFit) -> Result<GoodnessOfFit> {
    check_paired(&fit.observed, &fit.fitted, "fitted", 1)?;
    let n = fit.observed.len();
    if !fit.log_lik.is_finite() || !fit.null_log_lik.is_finite() {
        return Err(SurveyStatsError::input(
            "log_lik",
            "finite log-likelihoods for the full and the null model",
        ));
    }
    let n = n as f64;
    let cox_snell = 1.0 - ((2.0 / n) * (fit.null_log_lik - fit.log_lik)).exp();
    let nagelkerke = cox_snell / (1.0 - ((2.0 / n) * fit.null_log_lik).exp());
    Ok(GoodnessOfFit::PseudoR2 {
        cox_snell,
        nagelkerke,
    })
}

/// Tjur's Coefficient of Discrimination for a binary-response model:
/// `mean(fitted | y = 1) - mean(fitted | y = 0)`.
///
/// # Errors
/// `Input` if the family is not binomial, the response is not coded 0/1,
/// lengths disagree, or one of the two outcomes never occurs.
///
/// # Examples
///
/// ```
/// use ndarray::array;
/// use survey_stats::gof::{cod, Family, GeneralizedFit};
///
/// let fit = GeneralizedFit {
///     family: Family::Binomial,
///     observed: array![0.0, 0.0, 1.0, 1.0],
///     fitted: array![0.1, 0.2, 0.8, 0.9],
///     log_lik: -1.0,
///     null_log_lik: -2.77,
/// };
/// assert!((cod(&fit).unwrap() - 0.7).abs() < 1e-12);
/// ```
pub fn cod(fit: &GeneralizedFit) -> Result<f64> {
    if fit.family != Family::Binomial {
        return Err(SurveyStatsError::input(
            "family",
            format!("a binomial model (found {:?})", fit.family),
        ));
    }
    check_paired(&fit.observed, &fit.fitted, "fitted", 1)?;

    let (mut sum1, mut n1, mut sum0, mut n0) = (0.0, 0usize, 0.0, 0usize);
    for (&y, &p) in fit.observed.iter().zip(fit.fitted.iter()) {
        if y == 1.0 {
            sum1 += p;
            n1 += 1;
        } else if y == 0.0 {
            sum0 += p;
            n0 += 1;
        } else {
            return Err(SurveyStatsError::input(
                "observed",
                format!("a binary response coded 0/1 (found {})", y),
            ));
        }
    }
    if n1 == 0 || n0 == 0 {
        return Err(SurveyStatsError::input(
            "observed",
            "a response containing both outcomes",
        ));
    }
    Ok(sum1 / n1 as f64 - sum0 / n0 as f64)
}

fn mixed_r2(fit: &MixedFit) -> Result<GoodnessOfFit> {
    if fit.fixed_linear_predictor.len() < 2 {
        return Err(SurveyStatsError::input(
            "fixed_linear_predictor",
            "at least 2 observations",
        ));
    }
    if fit
        .random_effect_variances
        .iter()
        .any(|v| !v.is_finite() || *v < 0.0)
    {
        return Err(SurveyStatsError::input(
            "random_effect_variances",
            "finite, non-negative variance components",
        ));
    }

    let fixed = sample_variance(fit.fixed_linear_predictor.view());
    let random: f64 = fit.random_effect_variances.iter().sum();
    let residual = match fit.family {
        Family::Gaussian => match fit.residual_variance {
            Some(sigma2) if sigma2.is_finite() && sigma2 >= 0.0 => sigma2,
            _ => {
                return Err(SurveyStatsError::input(
                    "residual_variance",
                    "a finite, non-negative residual variance for a Gaussian mixed model",
                ))
            }
        },
        family => {
            // log-normal approximation of the distribution-specific variance
            let mu_bar = fit.fitted_response.mean().unwrap_or(f64::NAN);
            if !(mu_bar > 0.0) {
                return Err(SurveyStatsError::input(
                    "fitted_response",
                    "a positive mean predicted response",
                ));
            }
            (1.0 + family.variance(mu_bar) / (mu_bar * mu_bar)).ln()
        }
    };

    let total = fixed + random + residual;
    debug!(
        "Mixed model variance: fixed={:.6}, random={:.6}, residual={:.6}",
        fixed, random, residual
    );
    Ok(GoodnessOfFit::Mixed {
        engine: fit.engine,
        marginal: fixed / total,
        conditional: (fixed + random) / total,
        variance: VarianceComponents {
            fixed,
            random,
            residual,
        },
    })
}

fn hierarchical_r2(fit: &HierarchicalFit) -> Result<GoodnessOfFit> {
    check_paired(&fit.observed, &fit.fitted, "fitted", 2)?;
    let total = sample_variance(fit.observed.view());
    if !(total > 0.0) {
        return Err(SurveyStatsError::input("observed", "a non-constant response"));
    }
    if !(sample_variance(fit.fitted.view()) > 0.0) {
        return Err(SurveyStatsError::input("fitted", "non-constant fitted values"));
    }
    let r = pearson_correlation(&fit.fitted, &fit.observed);
    let residuals = &fit.observed - &fit.fitted;
    let omega2 = 1.0 - sample_variance(residuals.view()) / total;
    Ok(GoodnessOfFit::Hierarchical { r2: r * r, omega2 })
}

fn bayesian_r2(fit: &BayesianFit, options: &R2Options) -> Result<GoodnessOfFit> {
    let n = fit.observed.len();
    if n < 2 {
        return Err(SurveyStatsError::input(
            "observed",
            format!("at least 2 observations (found {})", n),
        ));
    }

    let var_y = sample_variance(fit.observed.view());
    if !(var_y > 0.0) {
        return Err(SurveyStatsError::input("observed", "a non-constant response"));
    }

    if options.loo_adjusted {
        let loo = fit.loo_predictions.as_ref().ok_or_else(|| {
            SurveyStatsError::MissingDependency {
                capability: "leave-one-out predictive means from a posterior-predictive LOO routine"
                    .to_string(),
            }
        })?;
        check_paired(&fit.observed, loo, "loo_predictions", 2)?;
        let loo_errors = loo - &fit.observed;
        return Ok(GoodnessOfFit::LooAdjusted {
            r2: 1.0 - sample_variance(loo_errors.view()) / var_y,
        });
    }

    let (n_draws, n_obs) = fit.posterior_predictions.dim();
    if n_obs != n {
        return Err(SurveyStatsError::input(
            "posterior_predictions",
            format!("{} columns, one per observation (found {})", n, n_obs),
        ));
    }
    if n_draws == 0 {
        return Err(SurveyStatsError::input(
            "posterior_predictions",
            "at least one posterior draw",
        ));
    }

    if fit.posterior_predictions.iter().any(|v| !v.is_finite()) {
        return Err(SurveyStatsError::input(
            "posterior_predictions",
            "finite posterior draws",
        ));
    }

    let draws: Vec<f64> = fit
        .posterior_predictions
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|mu| {
            let var_fit = sample_variance(mu);
            let residuals = &fit.observed - &mu;
            let var_res = sample_variance(residuals.view());
            var_fit / (var_fit + var_res)
        })
        .collect();

    let mut sorted = draws.clone();
    let r2 = median(&mut sorted);
    let mad = median_absolute_deviation(&draws, r2);
    debug!("Bayesian R2 over {} draws: median={:.6}, MAD={:.6}", n_draws, r2, mad);
    Ok(GoodnessOfFit::Bayesian { r2, mad })
}

/// R²-like statistics for a fitted model.
///
/// * Linear: R² and adjusted R².
/// * Generalized linear: Cox & Snell and Nagelkerke pseudo-R².
/// * Mixed: marginal and conditional R² (Nakagawa and Schielzeth).
/// * Hierarchical: squared fitted/observed correlation and simplified Omega².
/// * Bayesian: median and MAD of per-draw Bayesian R², or the LOO-adjusted
///   R² when `options.loo_adjusted` is set.
///
/// Returns `Ok(None)` for [`FittedModel::Unsupported`].
pub fn r2(model: &FittedModel, options: &R2Options) -> Result<Option<GoodnessOfFit>> {
    debug!("Computing R2 for a {} model.", model.kind_name());
    let result = match model {
        FittedModel::Linear(fit) => linear_r2(fit)?,
        FittedModel::Generalized(fit) => pseudo_r2(fit)?,
        FittedModel::Mixed(fit) => mixed_r2(fit)?,
        FittedModel::Hierarchical(fit) => hierarchical_r2(fit)?,
        FittedModel::Bayesian(fit) => bayesian_r2(fit, options)?,
        FittedModel::Unsupported { class } => {
            warn!("No R2 formula for models of class `{}`.", class);
            return Ok(None);
        }
    };
    Ok(Some(result))
}

/// Pseudo-R² of a hierarchical model against its null model: proportional
/// reduction of the random-intercept (and random-slope) variance, and
/// `Omega² = 1 - sigma²(full) / sigma²(null)`.
///
/// The null model must be nested in and fitted comparably to `full`; this is
/// not checked.
pub fn r2_against_null(full: &HierarchicalFit, null: &HierarchicalFit) -> Result<GoodnessOfFit> {
    if !(null.intercept_variance > 0.0) {
        return Err(SurveyStatsError::input(
            "null.intercept_variance",
            "a positive random-intercept variance in the null model",
        ));
    }
    if !(null.residual_variance > 0.0) {
        return Err(SurveyStatsError::input(
            "null.residual_variance",
            "a positive residual variance in the null model",
        ));
    }
    let reduction = |null_var: f64, full_var: f64| (null_var - full_var) / null_var;
    let tau00 = reduction(null.intercept_variance, full.intercept_variance);
    let tau11 = match (null.slope_variance, full.slope_variance) {
        (Some(n), Some(f)) if n > 0.0 => Some(reduction(n, f)),
        _ => None,
    };
    let omega2 = 1.0 - full.residual_variance / null.residual_variance;
    Ok(GoodnessOfFit::NullComparison {
        tau00,
        tau11,
        omega2,
    })
}
