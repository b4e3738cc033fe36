use crate::{
    diagnostics::Diagnostics,
    error::{FitResult, FitterError},
    mesh::Mesh,
    objective::{LinearResiduals, ObjectiveTerms, ObjectiveWeights},
    point_cloud::PointCloud,
};
use indicatif::ProgressBar;
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        Error, Executor, Operator, State, KV,
    },
    solver::conjugategradient::ConjugateGradient,
};

pub const DEFAULT_MAX_SUB_ITERATIONS: usize = 5;
/// Relative decrease of the objective below which a solve has converged
pub const COST_TOLERANCE: f64 = 1e-9;
/// Diagonal damping relative to the largest normal equation diagonal
pub const DAMPING: f64 = 1e-9;
pub const CG_RELATIVE_TOLERANCE: f64 = 1e-12;

/// Progress of one deformation solve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitState {
    NotStarted,
    Projected,
    Optimizing,
    Converged,
    IterationLimitReached,
}

/// Runs `(J^T J + damping I) x` for the Conjugate Gradient Solver
struct NormalEquationsOperator<'a> {
    jacobian: &'a CsrMatrix<f64>,
    transpose: &'a CsrMatrix<f64>,
    damping: f64,
}

impl<'a> Operator for NormalEquationsOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> Result<Self::Output, Error> {
        let x = DVector::from_vec(x.to_vec());
        let jx = self.jacobian * &x;
        let result = self.transpose * &jx + self.damping * x;
        Ok(result.data.as_vec().clone())
    }
}

/// Observer bar for argmin solver
struct ConjugateGradientObserverBar {
    bar: ProgressBar,
    initial_mag: Option<f64>,
    final_mag: f64,
}

impl ConjugateGradientObserverBar {
    fn new(bar: ProgressBar, target_cost: f64) -> ConjugateGradientObserverBar {
        ConjugateGradientObserverBar {
            bar,
            initial_mag: None,
            final_mag: target_cost.log10().floor(),
        }
    }
}

impl<I> Observe<I> for ConjugateGradientObserverBar
where
    I: State<Float = f64>,
{
    fn observe_init(&mut self, _name: &str, _state: &I, _kv: &KV) -> Result<(), Error> {
        Ok(())
    }

    fn observe_iter(&mut self, state: &I, _kv: &KV) -> Result<(), Error> {
        let cost = state.get_cost();
        if !(cost > 0.0) || !cost.is_finite() {
            return Ok(());
        }
        let cost_mag = cost.log10();
        let initial = *self.initial_mag.get_or_insert(cost_mag);
        let span = (initial - self.final_mag).max(1.0);
        let progress = ((initial - cost_mag) / span).clamp(0.0, 1.0);
        self.bar.set_position((1000.0 * progress) as u64);
        Ok(())
    }

    fn observe_final(&mut self, _state: &I) -> Result<(), Error> {
        self.bar.finish_and_clear();
        Ok(())
    }
}

/// Solves the damped normal equations using the conjugate gradient method.
///
/// This function returns an approximation for x in `(J^T J + d I) x = b`
///
/// # Arguments
/// * `jacobian` - Sparse residual Jacobian `J`
/// * `transpose` - Its transpose
/// * `damping` - Positive diagonal shift `d`
/// * `b` - Right hand side
///
/// # Returns
/// The solution and the number of iterations used
fn run_conjugate_gradient(
    jacobian: &CsrMatrix<f64>,
    transpose: &CsrMatrix<f64>,
    damping: f64,
    b: &DVector<f64>,
    diagnostics: &Diagnostics,
) -> FitResult<(DVector<f64>, u64)> {
    let b_flat: Vec<f64> = b.iter().copied().collect();
    let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b_flat);
    let initial_guess: Vec<f64> = vec![0.0; b.nrows()];
    let target_cost = CG_RELATIVE_TOLERANCE * b.norm();
    let max_iters = 10 * b.nrows().max(1) as u64;

    let operator = NormalEquationsOperator {
        jacobian,
        transpose,
        damping,
    };

    let mut executor = Executor::new(operator, solver).configure(|state| {
        state
            .param(initial_guess)
            .max_iters(max_iters)
            .target_cost(target_cost)
    });
    if diagnostics.solver_reports() {
        let observer = ConjugateGradientObserverBar::new(
            diagnostics.progress_bar(1000, "conjugate gradient"),
            target_cost,
        );
        executor = executor.add_observer(observer, ObserverMode::NewBest);
    }

    // Run solver
    let res = match executor.run() {
        Ok(r) => r,
        Err(err) => {
            return Err(FitterError::Solver(format!(
                "Fit: Conjugate Gradient error: {err}"
            )))
        }
    };

    let best_param = match &res.state().best_param {
        Some(vec) => DVector::from_vec(vec.clone()),
        None => {
            return Err(FitterError::Solver(
                "Fit: Conjugate Gradient could not produce best parameter".to_owned(),
            ))
        }
    };

    Ok((best_param, res.state().get_iter()))
}

/// Result of one call to [`optimise`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimisationReport {
    pub state: FitState,
    pub iterations: usize,
    pub initial: ObjectiveTerms,
    pub objective: ObjectiveTerms,
    pub cg_iterations: u64,
}

/// Moves every node parameter to reduce the objective with damped
/// Gauss-Newton steps. Projections and the reference state stay fixed.
///
/// All accepted steps are written within one change scope. On failure the
/// steps accepted so far are kept.
///
/// # Arguments
/// * `mesh` - The geometry to deform
/// * `data` - Points with current projections and marker locations
/// * `weights` - Validated term weights
/// * `max_iterations` - Cap on Gauss-Newton steps
/// * `diagnostics` - Solver report output
///
/// # Returns
/// The final state and the objective before and after
pub fn optimise(
    mesh: &mut Mesh,
    data: &PointCloud,
    weights: &ObjectiveWeights,
    max_iterations: usize,
    diagnostics: &Diagnostics,
) -> FitResult<OptimisationReport> {
    let residuals = LinearResiduals::assemble(mesh, data, weights)?;
    let mut parameters = mesh.parameters();
    let mut r = residuals.residuals(&parameters);
    let mut cost = r.norm_squared();
    if !cost.is_finite() {
        return Err(FitterError::Solver(format!(
            "Fit: objective is not finite ({cost})"
        )));
    }
    let initial = residuals.terms(&r);
    let mut report = OptimisationReport {
        state: FitState::Optimizing,
        iterations: 0,
        initial,
        objective: initial,
        cg_iterations: 0,
    };
    if residuals.is_empty() {
        report.state = FitState::Converged;
        return Ok(report);
    }

    let jacobian = residuals.jacobian();
    let transpose = jacobian.transpose();
    let largest_diagonal = transpose
        .row_iter()
        .map(|row| row.values().iter().map(|v| v * v).sum::<f64>())
        .fold(0.0, f64::max);
    let damping = DAMPING * largest_diagonal.max(f64::MIN_POSITIVE);

    let mut scope = mesh.begin_change();
    report.state = FitState::IterationLimitReached;
    for iteration in 0..max_iterations {
        let gradient = &transpose * &r;
        if gradient.norm() <= 1e-14 * (1.0 + cost) {
            report.state = FitState::Converged;
            break;
        }

        let (step, cg_iterations) =
            run_conjugate_gradient(jacobian, &transpose, damping, &(-gradient), diagnostics)?;
        report.cg_iterations += cg_iterations;

        let trial = &parameters + step;
        let trial_r = residuals.residuals(&trial);
        let trial_cost = trial_r.norm_squared();
        if !trial_cost.is_finite() {
            return Err(FitterError::Solver(format!(
                "Fit: objective is not finite after iteration {}",
                iteration + 1
            )));
        }
        if trial_cost >= cost {
            report.state = FitState::Converged;
            break;
        }

        scope.set_parameters(&trial)?;
        let decrease = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
        parameters = trial;
        r = trial_r;
        cost = trial_cost;
        report.iterations = iteration + 1;
        diagnostics.report(format_args!(
            "Fit: iteration {} objective {cost:.6e} ({cg_iterations} conjugate gradient iterations)",
            iteration + 1
        ));
        if decrease <= COST_TOLERANCE {
            report.state = FitState::Converged;
            break;
        }
    }
    drop(scope);

    report.objective = residuals.terms(&r);
    Ok(report)
}
