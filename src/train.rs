use eyre::Result;
use rand::{rngs::SmallRng, Rng};

use crate::{
    dist::DistStore,
    filter::FilterSet,
    som::{SomGrid, SomParams},
    table::Table,
};

/// Fixed-capacity uniform sample over a stream of unknown length.
struct Reservoir {
    cap: usize,
    vecs: Vec<Vec<f64>>,
}

impl Reservoir {
    fn new(cap: usize) -> Self {
        Reservoir {
            cap,
            vecs: Vec::with_capacity(cap),
        }
    }

    /// Fill first; once full, an incoming vector overwrites slot
    /// `floor(U * (cap - 1))`, so the last slot keeps its first occupant.
    fn add(&mut self, vec: &[f64], rng: &mut SmallRng) {
        if self.cap == 0 {
            return;
        }
        if self.vecs.len() < self.cap {
            self.vecs.push(vec.to_vec());
        } else {
            let slot = (rng.gen::<f64>() * (self.cap - 1) as f64) as usize;
            self.vecs[slot] = vec.to_vec();
        }
    }

    fn len(&self) -> usize {
        self.vecs.len()
    }
}

/// Samples the training reservoirs in a single table pass and drives the
/// map through them.
pub struct TrainOptions {
    nt_total: usize,
    learn_frac: f64,
}

impl TrainOptions {
    pub fn new(nt_total: usize, learn_frac: f64) -> Self {
        TrainOptions {
            nt_total,
            learn_frac,
        }
    }

    /// One pass over the scaled rows: good sites feed the fixed reservoir,
    /// non-good sites passing the learning filter feed the learn
    /// reservoir. The fixed reservoir trains first, then the learn one,
    /// both in insertion order, and the count grids are normalized before
    /// the map is returned frozen.
    pub fn run(
        &self,
        table: &Table,
        dists: &DistStore,
        params: &SomParams,
        learning: Option<&FilterSet>,
        fixed_filter: Option<&FilterSet>,
        rng: &mut SmallRng,
    ) -> Result<SomGrid> {
        let ngood = dists.ngood() as usize;
        let nt = if self.nt_total == 0 || self.nt_total > ngood {
            ngood
        } else {
            self.nt_total
        };
        let fixed_cap = (nt as f64 * (1.0 - self.learn_frac)) as usize;
        let learn_cap = (nt as f64 * self.learn_frac) as usize;

        let kdim = table.columns().nann_som();
        let nann = table.columns().nann();
        let mut som = SomGrid::new(params, kdim, nt, rng);

        let mut good_sites = Reservoir::new(fixed_cap);
        let mut learn_sites = Reservoir::new(learn_cap);
        let mut rows = table.rows(Some(dists), true)?;
        while let Some(row) = rows.next_row()? {
            // training requires every model annotation, the ones pulled in
            // by filters included
            if !row.complete(nann) {
                continue;
            }
            if let Some(filter) = fixed_filter {
                if filter.failed(&row.raw_vals) != 0 {
                    continue;
                }
            }
            if row.is_good() {
                if fixed_cap == 0 {
                    continue;
                }
                good_sites.add(&row.vals[..kdim], rng);
            } else {
                let Some(filter) = learning else {
                    continue;
                };
                if learn_cap == 0 {
                    continue;
                }
                if filter.failed(&row.vals) != 0 {
                    continue;
                }
                learn_sites.add(&row.vals[..kdim], rng);
            }
        }

        let sampled = good_sites.len() + learn_sites.len();
        if sampled < nt {
            log::warn!("sampled only {sampled} of the requested {nt} training vectors");
            som.set_cycles(sampled);
        }
        log::info!(
            "Selected {} training vectors: {} from good sites, {} from learning-filter sites.",
            som.cycles(),
            good_sites.len(),
            learn_sites.len()
        );

        for vec in &good_sites.vecs {
            som.train(vec, rng);
        }
        for vec in &learn_sites.vecs {
            som.train(vec, rng);
        }
        som.normalize();
        Ok(som)
    }
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn reservoir_caps_split_by_learn_fraction() {
        let nt = 10usize;
        let learn_frac = 0.3;
        let fixed_cap = (nt as f64 * (1.0 - learn_frac)) as usize;
        let learn_cap = (nt as f64 * learn_frac) as usize;
        assert_eq!(fixed_cap, 7);
        assert_eq!(learn_cap, 3);
    }

    #[test]
    fn reservoir_never_replaces_the_last_slot() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut res = Reservoir::new(7);
        for i in 0..100 {
            res.add(&[f64::from(i)], &mut rng);
        }
        assert_eq!(res.len(), 7);
        // slot cap-1 still holds its first occupant
        assert_eq!(res.vecs[6], vec![6.0]);
        // overflow went somewhere: not all of the first seven survived
        assert!(res.vecs[..6].iter().any(|v| v[0] >= 7.0));
    }

    #[test]
    fn reservoir_matches_the_replacement_rule_exactly() {
        // reference replay of the fill-then-floor(U*(cap-1)) rule over the
        // same random stream
        let cap = 7usize;
        let mut rng = SmallRng::seed_from_u64(1234);
        let mut res = Reservoir::new(cap);
        for i in 0..100 {
            res.add(&[f64::from(i)], &mut rng);
        }

        let mut rng = SmallRng::seed_from_u64(1234);
        let mut expected: Vec<f64> = (0..cap as i32).map(f64::from).collect();
        for i in cap as i32..100 {
            let slot = (rng.gen::<f64>() * (cap - 1) as f64) as usize;
            expected[slot] = f64::from(i);
        }
        let got: Vec<f64> = res.vecs.iter().map(|v| v[0]).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn zero_capacity_reservoir_stays_empty() {
        let mut rng = SmallRng::seed_from_u64(9);
        let mut res = Reservoir::new(0);
        for i in 0..10 {
            res.add(&[f64::from(i)], &mut rng);
        }
        assert_eq!(res.len(), 0);
    }
}
