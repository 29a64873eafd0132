//! Nonlinear least-squares problem arena.
//!
//! A [`Problem`] owns every parameter value the solver touches. Map entities
//! are copied in by the problem builders, the solver mutates the arena, and
//! the results are copied back out. Residual blocks refer to parameters by
//! [`ParameterBlockId`] only.
//!
//! Jacobians are computed by central differences in the tangent space of each
//! block (ε = 1e-6), block by block, and evaluated in parallel over residual
//! blocks on the current rayon pool.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use super::loss::{Corrector, Loss};
use super::manifold::Manifold;
use crate::error::{OptimizerError, OptimizerResult};

/// Finite-difference step in tangent space.
const JACOBIAN_EPS: f64 = 1e-6;

/// A residual term over one or more parameter blocks. Residuals must already
/// be whitened (multiplied by the square-root information).
pub trait CostFunction: Send + Sync {
    fn num_residuals(&self) -> usize;

    /// `params[k]` holds the ambient values of the k-th block the residual
    /// was registered with.
    fn evaluate(&self, params: &[&[f64]]) -> DVector<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterBlockId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResidualBlockId(usize);

struct ParameterBlock {
    values: Vec<f64>,
    manifold: Manifold,
    constant: bool,
}

impl ParameterBlock {
    fn tangent_size(&self) -> usize {
        self.manifold.tangent_size(self.values.len())
    }
}

struct ResidualBlock {
    cost: Box<dyn CostFunction>,
    loss: Option<Arc<dyn Loss>>,
    blocks: Vec<ParameterBlockId>,
}

/// Column offsets of parameter blocks in a Jacobian. Blocks without an offset
/// are treated as constant.
#[derive(Debug, Clone)]
pub struct ColumnLayout {
    offsets: Vec<Option<usize>>,
    num_columns: usize,
}

impl ColumnLayout {
    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn offset(&self, id: ParameterBlockId) -> Option<usize> {
        self.offsets.get(id.0).copied().flatten()
    }
}

/// How robust losses enter a linearization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossMode {
    /// Plain whitened residuals.
    Ignore,
    /// Residuals and Jacobians rescaled by the [`Corrector`].
    Corrected,
    /// Residuals scaled by `√(ρ(s)/s)` so that their squared norm is the
    /// robust cost, with the exact Jacobian of that scaling.
    CostScaled,
}

/// Residuals and Jacobian of the whole problem at the current values.
pub struct Linearization {
    pub residuals: DVector<f64>,
    pub jacobian: DMatrix<f64>,
}

#[derive(Default)]
pub struct Problem {
    parameters: Vec<ParameterBlock>,
    residuals: Vec<Option<ResidualBlock>>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Parameter blocks
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_parameter_block(&mut self, values: &[f64], manifold: Manifold) -> ParameterBlockId {
        self.parameters.push(ParameterBlock {
            values: values.to_vec(),
            manifold,
            constant: false,
        });
        ParameterBlockId(self.parameters.len() - 1)
    }

    pub fn set_constant(&mut self, id: ParameterBlockId) {
        if let Some(block) = self.parameters.get_mut(id.0) {
            block.constant = true;
        }
    }

    pub fn set_variable(&mut self, id: ParameterBlockId) {
        if let Some(block) = self.parameters.get_mut(id.0) {
            block.constant = false;
        }
    }

    pub fn is_constant(&self, id: ParameterBlockId) -> bool {
        self.parameters.get(id.0).is_some_and(|b| b.constant)
    }

    pub fn has_parameter_block(&self, id: ParameterBlockId) -> bool {
        id.0 < self.parameters.len()
    }

    pub fn parameter_values(&self, id: ParameterBlockId) -> &[f64] {
        &self.parameters[id.0].values
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.parameters.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Residual blocks
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_residual_block(
        &mut self,
        cost: impl CostFunction + 'static,
        loss: Option<Arc<dyn Loss>>,
        blocks: &[ParameterBlockId],
    ) -> OptimizerResult<ResidualBlockId> {
        if let Some(missing) = blocks.iter().find(|id| !self.has_parameter_block(**id)) {
            return Err(OptimizerError::MissingParameterBlock(format!(
                "residual refers to unregistered block {}",
                missing.0
            )));
        }
        self.residuals.push(Some(ResidualBlock {
            cost: Box::new(cost),
            loss,
            blocks: blocks.to_vec(),
        }));
        Ok(ResidualBlockId(self.residuals.len() - 1))
    }

    /// Returns false if the block was already removed.
    pub fn remove_residual_block(&mut self, id: ResidualBlockId) -> bool {
        self.residuals.get_mut(id.0).and_then(Option::take).is_some()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residuals.iter().filter(|r| r.is_some()).count()
    }

    pub fn num_residuals(&self) -> usize {
        self.active_residuals().map(|(_, rb)| rb.cost.num_residuals()).sum()
    }

    /// Whitened residual of one block, without the robust loss.
    pub fn evaluate_residual(&self, id: ResidualBlockId) -> Option<DVector<f64>> {
        let rb = self.residuals.get(id.0)?.as_ref()?;
        Some(self.evaluate_block(rb))
    }

    /// Robust cost `½ Σ ρ(||rᵢ||²)` at the current values.
    pub fn cost(&self) -> f64 {
        let blocks: Vec<&ResidualBlock> = self.active_residuals().map(|(_, rb)| rb).collect();
        let total: f64 = blocks
            .par_iter()
            .map(|rb| {
                let s = self.evaluate_block(rb).norm_squared();
                match &rb.loss {
                    Some(loss) => loss.evaluate(s)[0],
                    None => s,
                }
            })
            .sum();
        0.5 * total
    }

    /// Residuals scaled so that their squared norm equals the robust cost
    /// `ρ(s)` of each block. Used by solvers that only see a plain sum of
    /// squares.
    pub fn robust_residual_vector(&self) -> DVector<f64> {
        let blocks: Vec<&ResidualBlock> = self.active_residuals().map(|(_, rb)| rb).collect();
        let parts: Vec<DVector<f64>> = blocks
            .par_iter()
            .map(|rb| {
                let mut r = self.evaluate_block(rb);
                if let Some(loss) = &rb.loss {
                    let s = r.norm_squared();
                    if s > 0.0 {
                        r *= (loss.evaluate(s)[0] / s).sqrt();
                    }
                }
                r
            })
            .collect();
        concat(&parts)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Tangent-space layout and updates
    // ─────────────────────────────────────────────────────────────────────────

    /// Layout over every non-constant block that some residual depends on.
    pub fn free_layout(&self) -> ColumnLayout {
        let mut used = vec![false; self.parameters.len()];
        for (_, rb) in self.active_residuals() {
            for id in &rb.blocks {
                used[id.0] = true;
            }
        }
        let mut offsets = vec![None; self.parameters.len()];
        let mut num_columns = 0;
        for (idx, block) in self.parameters.iter().enumerate() {
            if used[idx] && !block.constant {
                offsets[idx] = Some(num_columns);
                num_columns += block.tangent_size();
            }
        }
        ColumnLayout { offsets, num_columns }
    }

    /// Layout over exactly `blocks`, in the given order.
    pub fn layout_for(&self, blocks: &[ParameterBlockId]) -> OptimizerResult<ColumnLayout> {
        let mut offsets = vec![None; self.parameters.len()];
        let mut num_columns = 0;
        for id in blocks {
            let block = self.parameters.get(id.0).ok_or_else(|| {
                OptimizerError::MissingParameterBlock(format!("block {} not in problem", id.0))
            })?;
            offsets[id.0] = Some(num_columns);
            num_columns += block.tangent_size();
        }
        Ok(ColumnLayout { offsets, num_columns })
    }

    /// Applies `x ← x ⊞ delta` to every block of `layout`.
    pub fn apply_step(&mut self, layout: &ColumnLayout, delta: &DVector<f64>) {
        for (idx, block) in self.parameters.iter_mut().enumerate() {
            let Some(offset) = layout.offsets[idx] else {
                continue;
            };
            let n = block.tangent_size();
            let step = &delta.as_slice()[offset..offset + n];
            let current = block.values.clone();
            block.manifold.plus(&current, step, &mut block.values);
        }
    }

    pub fn snapshot(&self) -> Vec<Vec<f64>> {
        self.parameters.iter().map(|b| b.values.clone()).collect()
    }

    pub fn restore(&mut self, snapshot: &[Vec<f64>]) {
        for (block, values) in self.parameters.iter_mut().zip(snapshot) {
            block.values.copy_from_slice(values);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Linearization
    // ─────────────────────────────────────────────────────────────────────────

    /// Stacked residuals and Jacobian over the columns of `layout`.
    pub fn linearize(&self, layout: &ColumnLayout, loss_mode: LossMode) -> Linearization {
        let blocks: Vec<&ResidualBlock> = self.active_residuals().map(|(_, rb)| rb).collect();

        let parts: Vec<(DVector<f64>, DMatrix<f64>)> = blocks
            .par_iter()
            .map(|rb| self.linearize_block(rb, layout, loss_mode))
            .collect();

        let num_rows: usize = parts.iter().map(|(r, _)| r.len()).sum();
        let mut residuals = DVector::zeros(num_rows);
        let mut jacobian = DMatrix::zeros(num_rows, layout.num_columns);

        let mut row = 0;
        for (rb, (r, local_jac)) in blocks.iter().zip(&parts) {
            let m = r.len();
            residuals.rows_mut(row, m).copy_from(r);
            let mut local_col = 0;
            for id in &rb.blocks {
                let n = self.parameters[id.0].tangent_size();
                if let Some(col) = layout.offset(*id) {
                    // A block listed twice contributes through both slots.
                    let mut target = jacobian.view_mut((row, col), (m, n));
                    target += local_jac.view((0, local_col), (m, n));
                    local_col += n;
                }
            }
            row += m;
        }

        Linearization { residuals, jacobian }
    }

    fn active_residuals(&self) -> impl Iterator<Item = (ResidualBlockId, &ResidualBlock)> {
        self.residuals
            .iter()
            .enumerate()
            .filter_map(|(idx, rb)| rb.as_ref().map(|rb| (ResidualBlockId(idx), rb)))
    }

    fn evaluate_block(&self, rb: &ResidualBlock) -> DVector<f64> {
        let params: Vec<&[f64]> = rb.blocks.iter().map(|id| self.parameters[id.0].values.as_slice()).collect();
        rb.cost.evaluate(&params)
    }

    /// Residual of one block and its Jacobian w.r.t. the blocks of `layout`
    /// it depends on, columns in registration order.
    fn linearize_block(
        &self,
        rb: &ResidualBlock,
        layout: &ColumnLayout,
        loss_mode: LossMode,
    ) -> (DVector<f64>, DMatrix<f64>) {
        let mut local: Vec<Vec<f64>> = rb.blocks.iter().map(|id| self.parameters[id.0].values.clone()).collect();
        let evaluate = |values: &[Vec<f64>]| {
            let params: Vec<&[f64]> = values.iter().map(Vec::as_slice).collect();
            rb.cost.evaluate(&params)
        };

        let residual = evaluate(&local);
        let m = residual.len();
        let num_cols: usize = rb
            .blocks
            .iter()
            .filter(|id| layout.offset(**id).is_some())
            .map(|id| self.parameters[id.0].tangent_size())
            .sum();
        let mut jacobian = DMatrix::zeros(m, num_cols);

        let mut col = 0;
        for (k, id) in rb.blocks.iter().enumerate() {
            if layout.offset(*id).is_none() {
                continue;
            }
            let block = &self.parameters[id.0];
            let n = block.tangent_size();
            let base = local[k].clone();
            let mut delta = vec![0.0; n];
            for d in 0..n {
                delta[d] = JACOBIAN_EPS;
                block.manifold.plus(&base, &delta, &mut local[k]);
                let r_plus = evaluate(&local);
                delta[d] = -JACOBIAN_EPS;
                block.manifold.plus(&base, &delta, &mut local[k]);
                let r_minus = evaluate(&local);
                delta[d] = 0.0;
                jacobian
                    .column_mut(col + d)
                    .copy_from(&((r_plus - r_minus) / (2.0 * JACOBIAN_EPS)));
            }
            local[k].copy_from_slice(&base);
            col += n;
        }

        let mut residual = residual;
        let Some(loss) = &rb.loss else {
            return (residual, jacobian);
        };
        let s = residual.norm_squared();
        match loss_mode {
            LossMode::Ignore => {}
            LossMode::Corrected => {
                let corrector = Corrector::new(s, &loss.evaluate(s));
                corrector.correct_jacobian(&residual, &mut jacobian);
                corrector.correct_residuals(&mut residual);
            }
            LossMode::CostScaled if s > 0.0 => {
                // r̃ = φ(s)·r with φ = √(ρ/s);  J̃ = φJ + 2φ'(s)·r·(rᵀJ)
                let [rho, rho1, _] = loss.evaluate(s);
                let phi = (rho / s).sqrt();
                let dphi = (rho1 * s - rho) / (2.0 * s * s * phi);
                let rt_j = residual.transpose() * &jacobian;
                jacobian = &jacobian * phi + &residual * rt_j * (2.0 * dphi);
                residual *= phi;
            }
            LossMode::CostScaled => {}
        }
        (residual, jacobian)
    }
}

fn concat(parts: &[DVector<f64>]) -> DVector<f64> {
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut out = DVector::zeros(total);
    let mut row = 0;
    for p in parts {
        out.rows_mut(row, p.len()).copy_from(p);
        row += p.len();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::loss::CauchyLoss;
    use approx::assert_relative_eq;

    /// r = a·x − b for a scalar block x.
    struct Linear {
        a: f64,
        b: f64,
    }

    impl CostFunction for Linear {
        fn num_residuals(&self) -> usize {
            1
        }

        fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
            DVector::from_element(1, self.a * params[0][0] - self.b)
        }
    }

    /// r = x − y for two 2-vectors.
    struct Difference;

    impl CostFunction for Difference {
        fn num_residuals(&self) -> usize {
            2
        }

        fn evaluate(&self, params: &[&[f64]]) -> DVector<f64> {
            DVector::from_vec(vec![params[0][0] - params[1][0], params[0][1] - params[1][1]])
        }
    }

    #[test]
    fn test_cost_and_residuals() {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(&[2.0], Manifold::Euclidean);
        let r1 = problem.add_residual_block(Linear { a: 3.0, b: 1.0 }, None, &[x]).unwrap();
        problem.add_residual_block(Linear { a: 1.0, b: 0.0 }, None, &[x]).unwrap();

        assert_relative_eq!(problem.cost(), 0.5 * (25.0 + 4.0));
        assert_relative_eq!(problem.evaluate_residual(r1).unwrap()[0], 5.0);
        assert_eq!(problem.num_residuals(), 2);

        assert!(problem.remove_residual_block(r1));
        assert!(!problem.remove_residual_block(r1));
        assert!(problem.evaluate_residual(r1).is_none());
        assert_relative_eq!(problem.cost(), 2.0);
    }

    #[test]
    fn test_missing_block_is_fatal() {
        let mut problem = Problem::new();
        let mut other = Problem::new();
        other.add_parameter_block(&[0.0], Manifold::Euclidean);
        let foreign = other.add_parameter_block(&[0.0], Manifold::Euclidean);
        let err = problem
            .add_residual_block(Linear { a: 1.0, b: 0.0 }, None, &[foreign])
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_free_layout_skips_constant_and_unused() {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(&[0.0, 0.0], Manifold::Euclidean);
        let b = problem.add_parameter_block(&[1.0, 1.0], Manifold::Euclidean);
        let unused = problem.add_parameter_block(&[0.0; 3], Manifold::Euclidean);
        problem.set_constant(a);
        problem.add_residual_block(Difference, None, &[a, b]).unwrap();

        let layout = problem.free_layout();
        assert_eq!(layout.num_columns(), 2);
        assert_eq!(layout.offset(a), None);
        assert_eq!(layout.offset(b), Some(0));
        assert_eq!(layout.offset(unused), None);
    }

    #[test]
    fn test_linearize_matches_analytic_jacobian() {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(&[0.5, -1.0], Manifold::Euclidean);
        let b = problem.add_parameter_block(&[1.0, 1.0], Manifold::Euclidean);
        problem.add_residual_block(Difference, None, &[a, b]).unwrap();

        let lin = problem.linearize(&problem.free_layout(), LossMode::Ignore);
        assert_relative_eq!(lin.residuals, DVector::from_vec(vec![-0.5, -2.0]), epsilon = 1e-12);
        let expected = DMatrix::from_row_slice(2, 4, &[1.0, 0.0, -1.0, 0.0, 0.0, 1.0, 0.0, -1.0]);
        assert_relative_eq!(lin.jacobian, expected, epsilon = 1e-8);
    }

    #[test]
    fn test_layout_for_orders_columns() {
        let mut problem = Problem::new();
        let a = problem.add_parameter_block(&[0.5, -1.0], Manifold::Euclidean);
        let b = problem.add_parameter_block(&[1.0, 1.0], Manifold::Euclidean);
        problem.add_residual_block(Difference, None, &[a, b]).unwrap();

        let layout = problem.layout_for(&[b]).unwrap();
        let lin = problem.linearize(&layout, LossMode::Ignore);
        let expected = DMatrix::from_row_slice(2, 2, &[-1.0, 0.0, 0.0, -1.0]);
        assert_relative_eq!(lin.jacobian, expected, epsilon = 1e-8);
    }

    #[test]
    fn test_robust_residual_vector_matches_cost() {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(&[4.0], Manifold::Euclidean);
        let loss: Arc<dyn Loss> = Arc::new(CauchyLoss::new(1.0).unwrap());
        problem.add_residual_block(Linear { a: 1.0, b: 0.0 }, Some(loss), &[x]).unwrap();
        problem.add_residual_block(Linear { a: 1.0, b: 3.0 }, None, &[x]).unwrap();

        let r = problem.robust_residual_vector();
        assert_relative_eq!(0.5 * r.norm_squared(), problem.cost(), epsilon = 1e-12);
    }

    #[test]
    fn test_cost_scaled_jacobian_matches_finite_difference() {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(&[2.5], Manifold::Euclidean);
        let loss: Arc<dyn Loss> = Arc::new(CauchyLoss::new(1.0).unwrap());
        problem.add_residual_block(Linear { a: 2.0, b: 1.0 }, Some(loss), &[x]).unwrap();

        let layout = problem.free_layout();
        let lin = problem.linearize(&layout, LossMode::CostScaled);

        let h = 1e-6;
        let base = problem.snapshot();
        problem.apply_step(&layout, &DVector::from_element(1, h));
        let plus = problem.robust_residual_vector()[0];
        problem.restore(&base);
        problem.apply_step(&layout, &DVector::from_element(1, -h));
        let minus = problem.robust_residual_vector()[0];

        assert_relative_eq!(lin.jacobian[(0, 0)], (plus - minus) / (2.0 * h), epsilon = 1e-5);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut problem = Problem::new();
        let x = problem.add_parameter_block(&[1.0, 2.0], Manifold::Euclidean);
        problem.add_residual_block(Difference, None, &[x, x]).unwrap();
        let layout = problem.free_layout();
        let saved = problem.snapshot();
        problem.apply_step(&layout, &DVector::from_vec(vec![0.5, 0.5]));
        assert_eq!(problem.parameter_values(x), &[1.5, 2.5]);
        problem.restore(&saved);
        assert_eq!(problem.parameter_values(x), &[1.0, 2.0]);
    }
}
