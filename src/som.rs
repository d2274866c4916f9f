//! The self-organizing map: `nsom` independent `nbin x nbin` grids of
//! K-dimensional prototypes trained by competitive learning with a
//! time-decaying neighborhood.

use rand::{rngs::SmallRng, Rng};

/// Map tunables: grid side, learning constant, activation threshold for
/// scoring, and the number of independent maps averaged for robustness.
#[derive(Debug, Clone, Copy)]
pub struct SomParams {
    pub nbin: usize,
    pub learn: f64,
    pub threshold: f64,
    pub nsom: usize,
}

impl Default for SomParams {
    fn default() -> Self {
        SomParams {
            nbin: 20,
            learn: 0.1,
            threshold: 0.2,
            nsom: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SomGrid {
    nbin: usize,
    nsom: usize,
    kdim: usize,
    nt: usize,
    learn: f64,
    threshold: f64,
    /// Prototype weights, `nsom * nbin * nbin * kdim`, row-major per map.
    weights: Vec<f64>,
    /// Accumulated learning influence per cell, `nsom * nbin * nbin`.
    counts: Vec<f64>,
    /// Per-map learning cycle.
    t: Vec<u64>,
}

impl SomGrid {
    /// A fresh grid with weights drawn uniformly from [0,1] and zeroed
    /// counts. `nt` is the learning-cycle horizon driving the decay.
    pub fn new(params: &SomParams, kdim: usize, nt: usize, rng: &mut SmallRng) -> Self {
        assert!(params.nbin >= 2, "the map needs at least a 2x2 grid");
        assert!(kdim >= 1, "the map needs at least one annotation");
        let ncell = params.nsom * params.nbin * params.nbin;
        let weights = (0..ncell * kdim).map(|_| rng.gen::<f64>()).collect();
        SomGrid {
            nbin: params.nbin,
            nsom: params.nsom,
            kdim,
            nt,
            learn: params.learn,
            threshold: params.threshold,
            weights,
            counts: vec![0.0; ncell],
            t: vec![0; params.nsom],
        }
    }

    pub fn kdim(&self) -> usize {
        self.kdim
    }

    pub fn nbin(&self) -> usize {
        self.nbin
    }

    pub fn nsom(&self) -> usize {
        self.nsom
    }

    /// Learning-cycle horizon.
    pub fn cycles(&self) -> usize {
        self.nt
    }

    /// Shrinks the horizon when fewer vectors were sampled than requested.
    pub(crate) fn set_cycles(&mut self, nt: usize) {
        self.nt = nt;
    }

    #[inline]
    fn wslot(&self, map: usize, i: usize, j: usize) -> usize {
        ((map * self.nbin + i) * self.nbin + j) * self.kdim
    }

    #[inline]
    fn cslot(&self, map: usize, i: usize, j: usize) -> usize {
        (map * self.nbin + i) * self.nbin + j
    }

    /// Best matching unit within one map: the cell minimizing the squared
    /// Euclidean distance. Ties go to the first cell in row-major order.
    fn best_matching_unit(&self, map: usize, vec: &[f64]) -> (usize, usize) {
        let mut min_dist = f64::INFINITY;
        let (mut imin, mut jmin) = (0, 0);
        for i in 0..self.nbin {
            for j in 0..self.nbin {
                let slot = self.wslot(map, i, j);
                let dist = sq_dist(vec, &self.weights[slot..slot + self.kdim]);
                if dist < min_dist {
                    min_dist = dist;
                    imin = i;
                    jmin = j;
                }
            }
        }
        (imin, jmin)
    }

    /// One competitive-learning step: a uniformly chosen map pulls the BMU
    /// neighborhood toward `vec`. Each map's clock advances in nsom-sized
    /// steps so the decay horizon tracks the total number of training
    /// vectors. The neighborhood influence is `exp(-d^4 / 2r^2) * lr` over
    /// cells with squared grid distance within `r^2`.
    pub fn train(&mut self, vec: &[f64], rng: &mut SmallRng) {
        debug_assert_eq!(vec.len(), self.kdim);
        // single-map runs burn no randomness on the map choice
        let map = if self.nsom == 1 {
            0
        } else {
            (rng.gen::<f64>() * self.nsom as f64) as usize
        };
        let (imin, jmin) = self.best_matching_unit(map, vec);

        let t = (self.t[map] * self.nsom as u64) as f64;
        self.t[map] += 1;
        let decay = (-t / self.nt as f64).exp();
        let radius_sq = {
            let radius = self.nbin as f64 * decay;
            radius * radius
        };
        let learning_rate = self.learn * decay;

        for i in 0..self.nbin {
            for j in 0..self.nbin {
                let di = i as f64 - imin as f64;
                let dj = j as f64 - jmin as f64;
                let dist = di * di + dj * dj;
                if dist > radius_sq {
                    continue;
                }
                let influence = (-dist * dist * 0.5 / radius_sq).exp() * learning_rate;
                let wslot = self.wslot(map, i, j);
                for k in 0..self.kdim {
                    self.weights[wslot + k] += influence * (vec[k] - self.weights[wslot + k]);
                }
                let cslot = self.cslot(map, i, j);
                self.counts[cslot] += influence;
            }
        }
    }

    /// Divides each map's count grid by its maximum, so populated cells
    /// land in [0,1] and the activation threshold is comparable across
    /// maps.
    pub fn normalize(&mut self) {
        let ncell = self.nbin * self.nbin;
        for map in 0..self.nsom {
            let grid = &mut self.counts[map * ncell..(map + 1) * ncell];
            let max = grid.iter().fold(0.0_f64, |m, &c| m.max(c));
            if max > 0.0 {
                for count in grid.iter_mut() {
                    *count /= max;
                }
            }
        }
    }

    /// Minimum squared distance to any sufficiently-populated prototype
    /// across all maps, or `None` when no cell anywhere clears the
    /// activation threshold.
    pub fn min_distance(&self, vec: &[f64]) -> Option<f64> {
        let mut best: Option<f64> = None;
        for map in 0..self.nsom {
            for i in 0..self.nbin {
                for j in 0..self.nbin {
                    if self.counts[self.cslot(map, i, j)] < self.threshold {
                        continue;
                    }
                    let slot = self.wslot(map, i, j);
                    let dist = sq_dist(vec, &self.weights[slot..slot + self.kdim]);
                    if best.map_or(true, |b| dist < b) {
                        best = Some(dist);
                    }
                }
            }
        }
        best
    }
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod test {
    use float_eq::assert_float_eq;
    use rand::SeedableRng;

    use super::*;

    fn rng(seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }

    fn corners() -> Vec<Vec<f64>> {
        let corners = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        (0..16).map(|i| corners[i % 4].to_vec()).collect()
    }

    #[test]
    fn quartic_neighborhood_single_step() {
        // 2x2 grid, K=1, all weights forced to zero; one step with vec=[1]
        // at full decay. BMU ties resolve to (0,0), so the updates are:
        //   d2=0: influence = 0.5
        //   d2=1: influence = 0.5 * exp(-1*1*0.5/4)  = 0.5 * exp(-0.125)
        //   d2=2: influence = 0.5 * exp(-2*2*0.5/4)  = 0.5 * exp(-0.5)
        // A plain Gaussian (d^2) would give exp(-0.25) at the far corner.
        let params = SomParams {
            nbin: 2,
            learn: 0.5,
            threshold: 0.0,
            nsom: 1,
        };
        let mut rng = rng(7);
        let mut som = SomGrid::new(&params, 1, 1, &mut rng);
        som.weights.iter_mut().for_each(|w| *w = 0.0);
        som.train(&[1.0], &mut rng);

        let near = 0.5 * (-0.125_f64).exp(); // 0.44124845129229776
        let far = 0.5 * (-0.5_f64).exp(); // 0.3032653298563167
        assert_float_eq!(som.weights[0], 0.5, abs <= 1e-12);
        assert_float_eq!(som.weights[1], near, abs <= 1e-12);
        assert_float_eq!(som.weights[2], near, abs <= 1e-12);
        assert_float_eq!(som.weights[3], far, abs <= 1e-12);
        assert_float_eq!(som.counts[0], 0.5, abs <= 1e-12);
        assert_float_eq!(som.counts[3], far, abs <= 1e-12);
        assert_eq!(som.t[0], 1);
    }

    #[test]
    fn bmu_prefers_scan_order_on_ties() {
        let params = SomParams {
            nbin: 3,
            learn: 0.1,
            threshold: 0.0,
            nsom: 1,
        };
        let mut rng = rng(1);
        let mut som = SomGrid::new(&params, 2, 4, &mut rng);
        som.weights.iter_mut().for_each(|w| *w = 0.25);
        assert_eq!(som.best_matching_unit(0, &[0.5, 0.5]), (0, 0));
    }

    #[test]
    fn training_is_deterministic_and_bounded() {
        let params = SomParams {
            nbin: 4,
            learn: 0.1,
            threshold: 0.2,
            nsom: 1,
        };
        let run = || {
            let mut rng = rng(1);
            let mut som = SomGrid::new(&params, 2, 16, &mut rng);
            for vec in corners() {
                som.train(&vec, &mut rng);
            }
            som.normalize();
            som
        };
        let a = run();
        let b = run();
        assert_eq!(a.weights, b.weights);
        assert_eq!(a.counts, b.counts);
        assert_eq!(a.t, vec![16]);

        // inputs and the uniform init both live in [0,1]; every update is a
        // convex pull toward the input, so weights never escape
        assert!(a.weights.iter().all(|w| (0.0..=1.0).contains(w)));
    }

    #[test]
    fn normalized_count_maximum_is_one_or_zero() {
        let params = SomParams {
            nbin: 4,
            learn: 0.1,
            threshold: 0.2,
            nsom: 2,
        };
        let mut rng = rng(11);
        let mut som = SomGrid::new(&params, 2, 16, &mut rng);
        for vec in corners() {
            som.train(&vec, &mut rng);
        }
        som.normalize();
        let ncell = som.nbin * som.nbin;
        for map in 0..som.nsom {
            let max = som.counts[map * ncell..(map + 1) * ncell]
                .iter()
                .fold(0.0_f64, |m, &c| m.max(c));
            assert!(max == 1.0 || max == 0.0, "map {map} max {max}");
        }

        // untouched grid normalizes to all zeros
        let mut idle = SomGrid::new(&params, 2, 16, &mut rng);
        idle.normalize();
        assert!(idle.counts.iter().all(|&c| c == 0.0));
    }

    #[test]
    fn scoring_ignores_cells_below_threshold() {
        let params = SomParams {
            nbin: 3,
            learn: 0.1,
            threshold: 0.2,
            nsom: 1,
        };
        let mut rng = rng(3);
        let mut som = SomGrid::new(&params, 2, 9, &mut rng);
        // only (0,0) is populated; its prototype is pinned for the check
        som.counts.iter_mut().for_each(|c| *c = 0.0);
        som.counts[0] = 1.0;
        som.weights[0] = 0.25;
        som.weights[1] = 0.75;

        for vec in [[0.0, 0.0], [1.0, 1.0], [0.25, 0.75]] {
            let expected = (vec[0] - 0.25f64).powi(2) + (vec[1] - 0.75f64).powi(2);
            assert_float_eq!(som.min_distance(&vec).unwrap(), expected, abs <= 1e-12);
        }

        // nothing activated anywhere -> no score
        som.counts[0] = 0.1;
        assert_eq!(som.min_distance(&[0.5, 0.5]), None);
    }

    #[test]
    fn map_clock_advances_by_map_count() {
        let params = SomParams {
            nbin: 2,
            learn: 0.1,
            threshold: 0.0,
            nsom: 3,
        };
        let mut rng = rng(5);
        let mut som = SomGrid::new(&params, 1, 30, &mut rng);
        for _ in 0..30 {
            som.train(&[0.5], &mut rng);
        }
        assert_eq!(som.t.iter().sum::<u64>(), 30);
    }
}
