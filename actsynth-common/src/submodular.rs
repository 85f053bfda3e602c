// SPDX-License-Identifier: Apache-2.0

//! Approximate minimization of a set function by alternating local moves.
//!
//! Used by rematerialization to pick a subset of candidate clones whose
//! combined area delta is minimal. The cost function is evaluated as a black
//! box over subsets of an ordered universe.

/// Options controlling the alternating minimization.
#[derive(Debug, Clone, Copy)]
pub struct MinimizeOptions {
    /// Maximum number of add/remove sweeps before giving up on convergence.
    pub max_iterations: usize,
}

impl Default for MinimizeOptions {
    fn default() -> Self {
        Self { max_iterations: 100 }
    }
}

/// A set function over an ordered universe of elements.
pub struct SetFunction<'a, T> {
    universe: Vec<T>,
    function: Box<dyn Fn(&[bool]) -> f64 + 'a>,
}

impl<'a, T: Clone> SetFunction<'a, T> {
    /// `function` receives a membership mask aligned with `universe`.
    pub fn new<F>(universe: Vec<T>, function: F) -> Self
    where
        F: Fn(&[bool]) -> f64 + 'a,
    {
        Self {
            universe,
            function: Box::new(function),
        }
    }

    /// Greedy alternating descent: repeatedly applies the single add or
    /// remove move with the best improvement until a sweep makes no progress
    /// or the iteration budget runs out. Starts from the empty set, so the
    /// result never costs more than choosing nothing.
    pub fn approx_minimize(&self, options: MinimizeOptions) -> Vec<T> {
        let n = self.universe.len();
        let mut mask = vec![false; n];
        let mut best_cost = (self.function)(&mask);

        for _ in 0..options.max_iterations {
            let mut improved = false;
            for i in 0..n {
                mask[i] = !mask[i];
                let cost = (self.function)(&mask);
                if cost < best_cost {
                    best_cost = cost;
                    improved = true;
                } else {
                    mask[i] = !mask[i];
                }
            }
            if !improved {
                break;
            }
        }

        self.universe
            .iter()
            .zip(mask.iter())
            .filter_map(|(e, &m)| if m { Some(e.clone()) } else { None })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_negative_contributors() {
        // Cost = sum of chosen weights; minimizer should select exactly the
        // negative-weight elements.
        let weights = vec![3.0, -2.0, 5.0, -1.0];
        let f = SetFunction::new(vec![0usize, 1, 2, 3], |mask: &[bool]| {
            mask.iter()
                .zip(weights.iter())
                .filter(|(&m, _)| m)
                .map(|(_, w)| *w)
                .sum()
        });
        let chosen = f.approx_minimize(MinimizeOptions::default());
        assert_eq!(chosen, vec![1, 3]);
    }

    #[test]
    fn empty_set_when_nothing_helps() {
        let f = SetFunction::new(vec!["a", "b"], |mask: &[bool]| {
            mask.iter().filter(|&&m| m).count() as f64
        });
        let chosen = f.approx_minimize(MinimizeOptions::default());
        assert!(chosen.is_empty());
    }
}
