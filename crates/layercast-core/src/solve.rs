//! Linear and mixed-integer programs in index form, and the solver thread that runs them.
//!
//! Callers build a [`Program`] out of plain indices and coefficients. Nothing in it borrows
//! from the network, so it can be moved onto a solver thread. Time limits are enforced by the
//! solver itself, which returns the best solution it found when one runs out.

use std::{thread, time::Duration};

use good_lp::{
    constraint, default_solver, variable, Expression, ProblemVariables, ResolutionError,
    Solution, SolutionStatus, SolverModel, Variable, WithTimeLimit,
};

/// Tolerance for treating solver outputs as zero or as satisfying a bound.
pub(crate) const EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sense {
    Minimise,
    Maximise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cmp {
    Le,
    Ge,
    Eq,
}

#[derive(Debug, Clone, Copy)]
struct VarDef {
    lo: f64,
    hi: Option<f64>,
    integer: bool,
}

#[derive(Debug, Clone)]
struct Row {
    terms: Vec<(usize, f64)>,
    cmp: Cmp,
    rhs: f64,
}

/// An optimization program over indexed variables.
#[derive(Debug, Clone)]
pub(crate) struct Program {
    sense: Sense,
    vars: Vec<VarDef>,
    rows: Vec<Row>,
    objective: Vec<(usize, f64)>,
    // Set when a row without variables cannot hold
    trivially_infeasible: bool,
}

impl Program {
    pub(crate) fn new(sense: Sense) -> Self {
        Self {
            sense,
            vars: Vec::new(),
            rows: Vec::new(),
            objective: Vec::new(),
            trivially_infeasible: false,
        }
    }

    /// Adds a continuous variable in `[lo, hi]` and returns its index.
    pub(crate) fn continuous(&mut self, lo: f64, hi: Option<f64>) -> usize {
        self.vars.push(VarDef {
            lo,
            hi,
            integer: false,
        });
        self.vars.len() - 1
    }

    /// Adds a 0/1 variable and returns its index.
    pub(crate) fn binary(&mut self) -> usize {
        self.vars.push(VarDef {
            lo: 0.0,
            hi: Some(1.0),
            integer: true,
        });
        self.vars.len() - 1
    }

    pub(crate) fn nr_vars(&self) -> usize {
        self.vars.len()
    }

    pub(crate) fn nr_rows(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn add_objective(&mut self, var: usize, coef: f64) {
        if coef != 0.0 {
            self.objective.push((var, coef));
        }
    }

    /// Adds the row `Σ terms cmp rhs`. A row whose terms are all zero is checked immediately.
    pub(crate) fn add_row(&mut self, terms: Vec<(usize, f64)>, cmp: Cmp, rhs: f64) {
        let terms = terms
            .into_iter()
            .filter(|&(_, c)| c != 0.0)
            .collect::<Vec<_>>();
        if terms.is_empty() {
            let holds = match cmp {
                Cmp::Le => 0.0 <= rhs + EPS,
                Cmp::Ge => 0.0 >= rhs - EPS,
                Cmp::Eq => rhs.abs() <= EPS,
            };
            self.trivially_infeasible |= !holds;
            return;
        }
        self.rows.push(Row { terms, cmp, rhs });
    }

    /// Solves the program, returning the value of every variable in index order.
    ///
    /// With a `time_limit`, the best solution found within the limit is returned, and
    /// [`SolveError::TimedOut`] only if the limit ran out before any was found.
    pub(crate) fn solve(self, time_limit: Option<Duration>) -> Result<Vec<f64>, SolveError> {
        if self.trivially_infeasible {
            return Err(SolveError::Infeasible);
        }
        let mut pv = ProblemVariables::new();
        let xs = self
            .vars
            .iter()
            .map(|d| {
                let mut def = variable().min(d.lo);
                if let Some(hi) = d.hi {
                    def = def.max(hi);
                }
                if d.integer {
                    def = def.integer();
                }
                pv.add(def)
            })
            .collect::<Vec<Variable>>();
        let linear = |terms: &[(usize, f64)]| -> Expression {
            terms.iter().map(|&(i, c)| c * xs[i]).sum()
        };
        let objective = linear(&self.objective);
        let problem = match self.sense {
            Sense::Minimise => pv.minimise(objective),
            Sense::Maximise => pv.maximise(objective),
        };
        let mut model = problem.using(default_solver);
        if let Some(limit) = time_limit {
            model = model.with_time_limit(limit.as_secs_f64());
        }
        for row in &self.rows {
            let lhs = linear(&row.terms);
            let rhs = row.rhs;
            model = model.with(match row.cmp {
                Cmp::Le => constraint!(lhs <= rhs),
                Cmp::Ge => constraint!(lhs >= rhs),
                Cmp::Eq => constraint!(lhs == rhs),
            });
        }
        settle(model.solve(), &xs, time_limit)
    }
}

/// Reads variable values out of a solver result. A time limit that ran out with an incumbent
/// still yields that incumbent.
fn settle<S: Solution>(
    res: Result<S, ResolutionError>,
    xs: &[Variable],
    time_limit: Option<Duration>,
) -> Result<Vec<f64>, SolveError> {
    let sol = match (res, time_limit) {
        (Err(ResolutionError::Other(msg)), Some(limit)) if msg.starts_with("Time limit") => {
            return Err(SolveError::TimedOut(limit));
        }
        (res, _) => res?,
    };
    match sol.status() {
        SolutionStatus::Optimal => {}
        status => log::warn!("solver stopped early ({status:?}), using the best solution found"),
    }
    Ok(xs.iter().map(|&x| sol.value(x)).collect())
}

/// Runs `f` on a dedicated solver thread and waits for it. A panicking solver is reported as
/// [`SolveError::Panicked`] instead of unwinding into the caller.
pub(crate) fn on_solver_thread<T, F>(f: F) -> Result<T, SolveError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SolveError> + Send + 'static,
{
    thread::Builder::new()
        .name("layercast-solver".into())
        .spawn(f)
        .map_err(SolveError::Spawn)?
        .join()
        .map_err(|_| SolveError::Panicked)?
}

#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error("Program is infeasible")]
    Infeasible,

    #[error("Program is unbounded")]
    Unbounded,

    #[error("Solver did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("Solver failed: {0}")]
    Solver(String),

    #[error("Solver thread panicked")]
    Panicked,

    #[error("Failed to spawn solver thread")]
    Spawn(#[source] std::io::Error),
}

impl From<ResolutionError> for SolveError {
    fn from(e: ResolutionError) -> Self {
        match e {
            ResolutionError::Infeasible => Self::Infeasible,
            ResolutionError::Unbounded => Self::Unbounded,
            other => Self::Solver(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn small_lp_is_solved() -> anyhow::Result<()> {
        // maximise x + 2y subject to x + y <= 4, y <= 3
        let mut p = Program::new(Sense::Maximise);
        let x = p.continuous(0.0, None);
        let y = p.continuous(0.0, Some(3.0));
        p.add_objective(x, 1.0);
        p.add_objective(y, 2.0);
        p.add_row(vec![(x, 1.0), (y, 1.0)], Cmp::Le, 4.0);
        let vals = p.solve(None)?;
        assert!((vals[x] - 1.0).abs() < EPS);
        assert!((vals[y] - 3.0).abs() < EPS);
        Ok(())
    }

    fn knapsack() -> (Program, usize, usize) {
        // maximise a + b subject to 2a + 2b <= 3
        let mut p = Program::new(Sense::Maximise);
        let a = p.binary();
        let b = p.binary();
        p.add_objective(a, 1.0);
        p.add_objective(b, 1.0);
        p.add_row(vec![(a, 2.0), (b, 2.0)], Cmp::Le, 3.0);
        (p, a, b)
    }

    #[test]
    fn binaries_stay_integral() -> anyhow::Result<()> {
        let (p, a, b) = knapsack();
        let vals = p.solve(Some(Duration::from_secs(10)))?;
        assert!((vals[a] + vals[b] - 1.0).abs() < EPS);
        Ok(())
    }

    #[test]
    fn exhausted_budget_without_incumbent_times_out() {
        let (p, ..) = knapsack();
        assert!(matches!(
            p.solve(Some(Duration::ZERO)),
            Err(SolveError::TimedOut(..))
        ));
    }

    /// A solver result cut short by its time limit.
    struct Incumbent(HashMap<Variable, f64>);

    impl Solution for Incumbent {
        fn status(&self) -> SolutionStatus {
            SolutionStatus::TimeLimit
        }

        fn value(&self, variable: Variable) -> f64 {
            self.0[&variable]
        }
    }

    #[test]
    fn incumbent_survives_the_time_limit() -> anyhow::Result<()> {
        let mut pv = ProblemVariables::new();
        let xs = [pv.add(variable()), pv.add(variable())];
        let found = Incumbent(HashMap::from([(xs[0], 1.0), (xs[1], 0.0)]));
        let vals = settle(Ok(found), &xs, Some(Duration::from_secs(1)))?;
        assert_eq!(vals, [1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn other_solver_errors_are_kept() {
        let res = settle::<Incumbent>(Err(ResolutionError::Infeasible), &[], None);
        assert!(matches!(res, Err(SolveError::Infeasible)));
        let res = settle::<Incumbent>(
            Err(ResolutionError::Other("Time limit reached")),
            &[],
            None,
        );
        assert!(matches!(res, Err(SolveError::Solver(..))));
    }

    #[test]
    fn constant_rows_are_checked_up_front() {
        let mut p = Program::new(Sense::Minimise);
        let x = p.continuous(0.0, None);
        p.add_row(vec![(x, 0.0)], Cmp::Eq, 1.0);
        assert_eq!(p.nr_rows(), 0);
        assert!(matches!(p.solve(None), Err(SolveError::Infeasible)));
    }

    #[test]
    fn result_is_forwarded() -> anyhow::Result<()> {
        let v = on_solver_thread(|| Ok(42))?;
        assert_eq!(v, 42);
        Ok(())
    }

    #[test]
    fn panicking_solve_is_reported() {
        let res: Result<(), _> = on_solver_thread(|| panic!("boom"));
        assert!(matches!(res, Err(SolveError::Panicked)));
    }

    #[test]
    fn solver_errors_pass_through() {
        let res: Result<(), _> = on_solver_thread(|| Err(SolveError::Infeasible));
        assert!(matches!(res, Err(SolveError::Infeasible)));
    }
}
