//! Joint scheduling of a fixed cycle of kernels.
//!
//! The cycle runs in pairs of passes: an execute pass that applies the last
//! solution, then a measure pass whose timings feed the model. After every
//! pair the LP below is re-solved:
//!
//! ```text
//! minimize   sum_k z_k
//! subject to sum_d g_kd = 1                          for every kernel k
//!            z_k >= perf_kd * g_kd                   execution
//!            z_k >= h2d_kqd * (g_kd - g_qd)          inbound copies ("+")
//!            z_k >= d2h_kqd * (g_qd - g_kd)          outbound copies ("-")
//!            0 <= g_kd <= 1, z_k >= 0
//! ```
//!
//! where `q` is the kernel preceding `k` in the cycle. Transfer coefficients
//! come from a least-squares fit over observed (share delta, copy time)
//! samples.

use super::{Granularity, IterationTimers, KernelId};
use crate::coherence::Direction;
use crate::config::{MAX_CYCLE_DEVICES, MAX_CYCLE_LENGTH};
use crate::error::{Error, Fault, Result};
use minilp::{ComparisonOp, LinearExpr, OptimizationDirection, Problem, Variable};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Share deltas smaller than this imply no transfer direction.
const DELTA_EPSILON: f64 = 1e-3;
/// Regression samples kept per coupling.
const MAX_SAMPLES: usize = 32;

/// Which term of a kernel's objective was tight at the optimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Binding {
    Execution,
    HostToDevice,
    DeviceToHost,
}

/// Granularities chosen for every kernel of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSolution {
    /// One granularity per cycle position.
    pub granularities: Vec<Granularity>,
    pub objective: f64,
    pub binding: Vec<Binding>,
}

/// Regression key: copies into kernel `dst` caused by kernel `src` on `device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CommKey {
    dst: usize,
    src: usize,
    device: usize,
    direction: Direction,
}

/// Joint LP over the kernels of one cycle.
#[derive(Debug, Clone)]
pub struct MultiKernelSolver {
    kernels: usize,
    devices: usize,
    alpha: f64,
    comm_aware: bool,
    /// Smoothed seconds per unit share, `[kernel][device]`.
    perf: Vec<Vec<Option<f64>>>,
    samples: HashMap<CommKey, VecDeque<(f64, f64)>>,
}

impl MultiKernelSolver {
    /// Solver for `kernels` kernels on `devices` devices.
    pub fn new(kernels: usize, devices: usize, alpha: f64, comm_aware: bool) -> Result<Self> {
        if kernels == 0 || kernels > MAX_CYCLE_LENGTH {
            return Err(Error::resource_exhaustion(format!(
                "cycle length {} outside 1..={}",
                kernels, MAX_CYCLE_LENGTH
            )));
        }
        if devices == 0 || devices > MAX_CYCLE_DEVICES {
            return Err(Error::resource_exhaustion(format!(
                "{} devices outside 1..={} supported by the cycle solver",
                devices, MAX_CYCLE_DEVICES
            )));
        }
        Ok(Self {
            kernels,
            devices,
            alpha,
            comm_aware,
            perf: vec![vec![None; devices]; kernels],
            samples: HashMap::new(),
        })
    }

    fn previous(&self, k: usize) -> usize {
        (k + self.kernels - 1) % self.kernels
    }

    /// Record kernel `k`'s timings at `current`, given the granularity its
    /// predecessor ran with.
    pub fn record(
        &mut self,
        k: usize,
        current: &Granularity,
        previous: &Granularity,
        timers: &IterationTimers,
    ) {
        for d in 0..self.devices {
            let g = current.shares()[d];
            let t = timers.kernel[d].as_secs_f64();
            if g > 0.0 && t > 0.0 {
                let sample = t / g;
                let slot = &mut self.perf[k][d];
                *slot = Some(match *slot {
                    Some(old) => self.alpha * sample + (1.0 - self.alpha) * old,
                    None => sample,
                });
            }
        }

        if !self.comm_aware || self.kernels < 2 {
            return;
        }
        let q = self.previous(k);
        for d in 0..self.devices {
            let delta = current.shares()[d] - previous.shares()[d];
            let (direction, x, y) = if delta > DELTA_EPSILON {
                (Direction::HostToDevice, delta, timers.h2d[d].as_secs_f64())
            } else if delta < -DELTA_EPSILON {
                (Direction::DeviceToHost, -delta, timers.d2h[d].as_secs_f64())
            } else {
                continue;
            };
            let key = CommKey {
                dst: k,
                src: q,
                device: d,
                direction,
            };
            let samples = self.samples.entry(key).or_default();
            samples.push_back((x, y));
            if samples.len() > MAX_SAMPLES {
                samples.pop_front();
            }
        }
    }

    /// Seconds per unit share of kernel `k` on device `d`. Unmeasured
    /// devices borrow the kernel's mean.
    pub fn performance(&self, k: usize, d: usize) -> Option<f64> {
        if let Some(p) = self.perf[k][d] {
            return Some(p);
        }
        let known: Vec<f64> = self.perf[k].iter().flatten().copied().collect();
        if known.is_empty() {
            None
        } else {
            Some(known.iter().sum::<f64>() / known.len() as f64)
        }
    }

    fn coefficient(&self, key: &CommKey) -> Option<f64> {
        self.samples.get(key).and_then(|s| regression_slope(s.iter().copied()))
    }

    /// Copy cost per unit share delta into kernel `dst` from its predecessor
    /// on `device`, once at least two distinct samples exist.
    pub fn transfer_coefficient(&self, dst: usize, device: usize, direction: Direction) -> Option<f64> {
        self.coefficient(&CommKey {
            dst,
            src: self.previous(dst),
            device,
            direction,
        })
    }

    /// Solve for every kernel's granularity. `None` until every kernel has
    /// a performance sample.
    pub fn solve(&self) -> Option<std::result::Result<CycleSolution, Fault>> {
        let (k_n, d_n) = (self.kernels, self.devices);
        let mut perf = vec![vec![0.0; d_n]; k_n];
        for (k, row) in perf.iter_mut().enumerate() {
            for (d, cell) in row.iter_mut().enumerate() {
                *cell = self.performance(k, d)?;
            }
        }
        if perf.iter().flatten().any(|p| !p.is_finite()) {
            return Some(Err(Fault::NumericDegenerate("non-finite performance".into())));
        }

        let mut problem = Problem::new(OptimizationDirection::Minimize);
        let g: Vec<Vec<Variable>> = (0..k_n)
            .map(|_| (0..d_n).map(|_| problem.add_var(0.0, (0.0, 1.0))).collect())
            .collect();
        let z: Vec<Variable> = (0..k_n)
            .map(|_| problem.add_var(1.0, (0.0, f64::INFINITY)))
            .collect();

        let mut coupling: Vec<Vec<(Option<f64>, Option<f64>)>> = vec![vec![(None, None); d_n]; k_n];
        for k in 0..k_n {
            let mut sum = LinearExpr::empty();
            for d in 0..d_n {
                sum.add(g[k][d], 1.0);
            }
            problem.add_constraint(sum, ComparisonOp::Eq, 1.0);

            for d in 0..d_n {
                let mut exec = LinearExpr::empty();
                exec.add(z[k], 1.0);
                exec.add(g[k][d], -perf[k][d]);
                problem.add_constraint(exec, ComparisonOp::Ge, 0.0);
            }

            if !self.comm_aware || k_n < 2 {
                continue;
            }
            let q = self.previous(k);
            for d in 0..d_n {
                let h2d = self.transfer_coefficient(k, d, Direction::HostToDevice);
                let d2h = self.transfer_coefficient(k, d, Direction::DeviceToHost);
                if let Some(c) = h2d.filter(|c| *c > 0.0) {
                    let mut row = LinearExpr::empty();
                    row.add(z[k], 1.0);
                    row.add(g[k][d], -c);
                    row.add(g[q][d], c);
                    problem.add_constraint(row, ComparisonOp::Ge, 0.0);
                }
                if let Some(c) = d2h.filter(|c| *c > 0.0) {
                    let mut row = LinearExpr::empty();
                    row.add(z[k], 1.0);
                    row.add(g[k][d], c);
                    row.add(g[q][d], -c);
                    problem.add_constraint(row, ComparisonOp::Ge, 0.0);
                }
                coupling[k][d] = (h2d, d2h);
            }
        }

        let solution = match problem.solve() {
            Ok(s) => s,
            Err(e) => return Some(Err(Fault::NumericDegenerate(format!("lp: {}", e)))),
        };
        let objective = solution.objective();
        if !objective.is_finite() {
            return Some(Err(Fault::NumericDegenerate("non-finite lp objective".into())));
        }

        let mut raw = vec![vec![0.0; d_n]; k_n];
        let mut granularities = Vec::with_capacity(k_n);
        for k in 0..k_n {
            for d in 0..d_n {
                raw[k][d] = solution[g[k][d]];
            }
            match Granularity::from_shares(&raw[k]) {
                Some(gr) => granularities.push(gr),
                None => {
                    return Some(Err(Fault::NumericDegenerate(format!(
                        "lp shares for kernel {} left the simplex",
                        k
                    ))))
                }
            }
        }

        let binding = (0..k_n)
            .map(|k| {
                let q = self.previous(k);
                let mut best = (Binding::Execution, 0.0f64);
                for d in 0..d_n {
                    let exec = perf[k][d] * raw[k][d];
                    let (h2d, d2h) = coupling[k][d];
                    let delta = raw[k][d] - raw[q][d];
                    for (term, t) in [
                        (Binding::Execution, exec),
                        (Binding::HostToDevice, h2d.unwrap_or(0.0) * delta),
                        (Binding::DeviceToHost, -d2h.unwrap_or(0.0) * delta),
                    ] {
                        if t > best.1 {
                            best = (term, t);
                        }
                    }
                }
                best.0
            })
            .collect();

        Some(Ok(CycleSolution {
            granularities,
            objective,
            binding,
        }))
    }
}

/// Ordinary least-squares slope, clamped at 0. Needs two distinct x values.
fn regression_slope(samples: impl Iterator<Item = (f64, f64)> + Clone) -> Option<f64> {
    let n = samples.clone().count() as f64;
    if n < 2.0 {
        return None;
    }
    let (sx, sy) = samples.clone().fold((0.0, 0.0), |(a, b), (x, y)| (a + x, b + y));
    let (mx, my) = (sx / n, sy / n);
    let (sxy, sxx) = samples.fold((0.0, 0.0), |(a, b), (x, y)| {
        (a + (x - mx) * (y - my), b + (x - mx) * (x - mx))
    });
    if sxx < 1e-12 {
        return None;
    }
    let slope = sxy / sxx;
    slope.is_finite().then(|| slope.max(0.0))
}

/// Which pass of the cycle runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pass {
    Execute,
    Measure,
}

/// Result of reporting one cycle member's timings.
#[derive(Debug, Clone, Default)]
pub struct CycleOutcome {
    pub solution: Option<CycleSolution>,
    pub fault: Option<Fault>,
}

/// Cycle bookkeeping: membership, pass alternation and re-solve cadence.
#[derive(Debug, Clone)]
pub struct CycleScheduler {
    members: Vec<KernelId>,
    length: usize,
    reports: usize,
    solver: MultiKernelSolver,
    last: Option<CycleSolution>,
}

impl CycleScheduler {
    /// Cycle of `length` kernels on `devices` devices.
    pub fn new(length: usize, devices: usize, alpha: f64, comm_aware: bool) -> Result<Self> {
        Ok(Self {
            members: Vec::with_capacity(length),
            length,
            reports: 0,
            solver: MultiKernelSolver::new(length, devices, alpha, comm_aware)?,
            last: None,
        })
    }

    /// Admit a newly created kernel. The first `length` kernels form the
    /// cycle, in creation order.
    pub fn admit(&mut self, kernel: KernelId) -> Option<usize> {
        if self.members.len() >= self.length {
            return None;
        }
        self.members.push(kernel);
        Some(self.members.len() - 1)
    }

    /// Index of `kernel` within the cycle.
    pub fn position(&self, kernel: KernelId) -> Option<usize> {
        self.members.iter().position(|k| *k == kernel)
    }

    /// Kernels seen so far, in dispatch order.
    pub fn members(&self) -> &[KernelId] {
        &self.members
    }

    /// True once every member kernel is known.
    pub fn is_complete(&self) -> bool {
        self.members.len() == self.length
    }

    /// Pass the next dispatch belongs to.
    pub fn pass(&self) -> Pass {
        if self.reports < self.length {
            Pass::Execute
        } else {
            Pass::Measure
        }
    }

    /// Most recent LP solution.
    pub fn last_solution(&self) -> Option<&CycleSolution> {
        self.last.as_ref()
    }

    /// Underlying LP solver.
    pub fn solver(&self) -> &MultiKernelSolver {
        &self.solver
    }

    /// Report member `position`'s timings. `legal` holds the granularity
    /// every member last dispatched with, indexed by position.
    pub fn report(
        &mut self,
        position: usize,
        legal: &[Granularity],
        timers: &IterationTimers,
    ) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();
        if !self.is_complete() || legal.len() != self.length {
            return outcome;
        }

        if self.pass() == Pass::Measure {
            let prev = (position + self.length - 1) % self.length;
            self.solver.record(position, &legal[position], &legal[prev], timers);
        }
        self.reports += 1;
        if self.reports < 2 * self.length {
            return outcome;
        }
        self.reports = 0;

        match self.solver.solve() {
            None => debug!("cycle model incomplete, keeping granularities"),
            Some(Ok(solution)) => {
                info!(
                    objective = solution.objective,
                    binding = ?solution.binding,
                    "cycle re-solved"
                );
                self.last = Some(solution.clone());
                outcome.solution = Some(solution);
            }
            Some(Err(fault)) => {
                warn!(%fault, "cycle solve failed, keeping granularities");
                outcome.fault = Some(fault);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timers(kernel: &[f64], h2d: &[f64], d2h: &[f64]) -> IterationTimers {
        IterationTimers::from_secs(kernel, h2d, d2h)
    }

    #[test]
    fn test_limits() {
        assert!(matches!(
            MultiKernelSolver::new(2, MAX_CYCLE_DEVICES + 1, 0.3, true),
            Err(Error::ResourceExhaustion(_))
        ));
        assert!(MultiKernelSolver::new(0, 2, 0.3, true).is_err());
        assert!(MultiKernelSolver::new(MAX_CYCLE_LENGTH, 2, 0.3, true).is_ok());
    }

    #[test]
    fn test_single_kernel_balances_execution() {
        let mut solver = MultiKernelSolver::new(1, 2, 1.0, true).unwrap();
        let g = Granularity::uniform(2);
        solver.record(0, &g, &g, &timers(&[0.3, 0.1], &[0.0, 0.0], &[0.0, 0.0]));

        let solution = solver.solve().unwrap().unwrap();
        let shares = solution.granularities[0].shares();
        assert!((shares[0] - 0.25).abs() < 1e-6);
        assert!((shares[1] - 0.75).abs() < 1e-6);
        // 0.6 s per unit share * 0.25
        assert!((solution.objective - 0.15).abs() < 1e-6);
        assert_eq!(solution.binding, vec![Binding::Execution]);
    }

    #[test]
    fn test_needs_samples_for_every_kernel() {
        let mut solver = MultiKernelSolver::new(2, 2, 1.0, true).unwrap();
        let g = Granularity::uniform(2);
        solver.record(0, &g, &g, &timers(&[0.3, 0.1], &[0.0, 0.0], &[0.0, 0.0]));
        assert!(solver.solve().is_none());
    }

    #[test]
    fn test_regression_requires_distinct_samples() {
        assert_eq!(regression_slope([(0.1, 1.0)].into_iter()), None);
        assert_eq!(regression_slope([(0.1, 1.0), (0.1, 2.0)].into_iter()), None);
        let slope = regression_slope([(0.1, 0.2), (0.3, 0.6)].into_iter()).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
        assert_eq!(regression_slope([(0.1, 0.6), (0.3, 0.2)].into_iter()), Some(0.0));
    }

    #[test]
    fn test_transfer_samples_by_direction() {
        let mut solver = MultiKernelSolver::new(2, 2, 1.0, true).unwrap();
        let prev = Granularity::uniform(2);
        for (g1, h2d) in [(0.7, 0.2), (0.9, 0.4)] {
            let cur = Granularity::from_shares(&[1.0 - g1, g1]).unwrap();
            solver.record(1, &cur, &prev, &timers(&[0.1, 0.1], &[0.0, h2d], &[0.0, 0.0]));
        }
        // device 1 gained share: inbound copies, slope (0.4-0.2)/(0.4-0.2)
        let c = solver
            .transfer_coefficient(1, 1, Direction::HostToDevice)
            .unwrap();
        assert!((c - 1.0).abs() < 1e-9);
        assert_eq!(solver.transfer_coefficient(1, 0, Direction::HostToDevice), None);
        assert!(solver.samples.contains_key(&CommKey {
            dst: 1,
            src: 0,
            device: 0,
            direction: Direction::DeviceToHost,
        }));
    }

    #[test]
    fn test_coupling_pulls_kernels_together() {
        let mut solver = MultiKernelSolver::new(2, 2, 1.0, true).unwrap();
        let uniform = Granularity::uniform(2);
        // kernel 0 prefers device 1, kernel 1 is indifferent
        solver.record(0, &uniform, &uniform, &timers(&[0.3, 0.1], &[0.0, 0.0], &[0.0, 0.0]));
        solver.record(1, &uniform, &uniform, &timers(&[0.1, 0.1], &[0.0, 0.0], &[0.0, 0.0]));
        let free = solver.solve().unwrap().unwrap();

        // Copies cost 2.5 s per unit of share moved, in both directions.
        // Zero kernel times leave the performance model alone.
        for k in [0, 1] {
            for (a, y) in [(0.6, 0.5), (0.8, 1.5)] {
                let cur = Granularity::from_shares(&[1.0 - a, a]).unwrap();
                let prev = Granularity::from_shares(&[a, 1.0 - a]).unwrap();
                solver.record(k, &cur, &prev, &timers(&[0.0, 0.0], &[0.0, y], &[y, 0.0]));
            }
        }
        let c = solver.transfer_coefficient(1, 1, Direction::HostToDevice).unwrap();
        assert!((c - 2.5).abs() < 1e-6);

        let coupled = solver.solve().unwrap().unwrap();
        let gap = |s: &CycleSolution| {
            (s.granularities[0].shares()[1] - s.granularities[1].shares()[1]).abs()
        };
        assert!((gap(&free) - 0.25).abs() < 1e-6);
        assert!(gap(&coupled) < 0.1);
        assert!(coupled.objective > free.objective);
    }

    #[test]
    fn test_cycle_alternates_and_resolves() {
        let mut cycle = CycleScheduler::new(2, 2, 1.0, false).unwrap();
        assert_eq!(cycle.admit(KernelId(10)), Some(0));
        assert_eq!(cycle.admit(KernelId(11)), Some(1));
        assert_eq!(cycle.admit(KernelId(12)), None);
        assert_eq!(cycle.position(KernelId(11)), Some(1));

        let legal = vec![Granularity::uniform(2), Granularity::uniform(2)];
        let t = timers(&[0.3, 0.1], &[0.0, 0.0], &[0.0, 0.0]);

        // Execute pass: nothing recorded.
        assert_eq!(cycle.pass(), Pass::Execute);
        assert!(cycle.report(0, &legal, &t).solution.is_none());
        assert!(cycle.report(1, &legal, &t).solution.is_none());
        assert_eq!(cycle.solver().performance(0, 0), None);

        assert_eq!(cycle.pass(), Pass::Measure);
        assert!(cycle.report(0, &legal, &t).solution.is_none());
        let out = cycle.report(1, &legal, &t);
        let solution = out.solution.unwrap();
        assert_eq!(solution.granularities.len(), 2);
        assert!((solution.granularities[1].shares()[0] - 0.25).abs() < 1e-6);
        assert_eq!(cycle.pass(), Pass::Execute);
        assert!(cycle.last_solution().is_some());
    }
}
