use std::{
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use eyre::Result;
use rand::{rngs::SmallRng, SeedableRng};

use crate::{
    context::IndelContext,
    dist::{DistStore, DEFAULT_HI_PCTL, DEFAULT_LO_PCTL},
    evaluate::{EvalOptions, Provenance},
    filter::FilterSet,
    score::{ScoreOptions, VariantType},
    som::SomParams,
    table::{GoodMask, Table},
    train::TrainOptions,
};

/// One end-to-end run: distribution stats, training, scoring and the
/// quality table, all derived from a single annotation table.
pub struct SomPipeline {
    table: PathBuf,
    variant_type: VariantType,
    out_prefix: Option<PathBuf>,
    annots: Vec<String>,
    good_mask: GoodMask,
    params: SomParams,
    nt_total: usize,
    learn_frac: f64,
    learning_filters: Option<String>,
    fixed_filter: Option<String>,
    fasta_ref: Option<PathBuf>,
    seed: u64,
    lo_pctl: f64,
    hi_pctl: f64,
    provenance: Provenance,
}

impl SomPipeline {
    pub fn new<P>(table: P, variant_type: VariantType) -> Self
    where
        P: Into<PathBuf>,
    {
        SomPipeline {
            table: table.into(),
            variant_type,
            out_prefix: None,
            annots: Vec::new(),
            good_mask: GoodMask::default(),
            params: SomParams::default(),
            nt_total: 0,
            learn_frac: 0.0,
            learning_filters: None,
            fixed_filter: None,
            fasta_ref: None,
            seed: 1,
            lo_pctl: DEFAULT_LO_PCTL,
            hi_pctl: DEFAULT_HI_PCTL,
            provenance: Provenance::default(),
        }
    }

    pub fn output_prefix<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.out_prefix = Some(dir.into());
        self
    }

    pub fn annots(mut self, annots: Vec<String>) -> Self {
        self.annots = annots;
        self
    }

    pub fn good_mask(mut self, mask: GoodMask) -> Self {
        self.good_mask = mask;
        self
    }

    pub fn map_params(mut self, params: SomParams) -> Self {
        self.params = params;
        self
    }

    pub fn ntrain_sites(mut self, total: usize, learn_frac: f64) -> Self {
        self.nt_total = total;
        self.learn_frac = learn_frac;
        self
    }

    pub fn learning_filters<S: Into<String>>(mut self, expr: S) -> Self {
        self.learning_filters = Some(expr.into());
        self
    }

    pub fn fixed_filter<S: Into<String>>(mut self, expr: S) -> Self {
        self.fixed_filter = Some(expr.into());
        self
    }

    pub fn fasta_ref<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.fasta_ref = Some(path.into());
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn percentiles(mut self, lo: f64, hi: f64) -> Self {
        self.lo_pctl = lo;
        self.hi_pctl = hi;
        self
    }

    pub fn provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    /// Artifact prefix: `DIR/annots` under an output directory (created on
    /// demand), otherwise the table path itself.
    fn prefix(&self) -> Result<String> {
        match &self.out_prefix {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                Ok(format!("{}/annots", dir.display()))
            }
            None => Ok(self.table.display().to_string()),
        }
    }

    pub fn run(&self) -> Result<()> {
        let seed = if self.seed == 0 {
            SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs()
        } else {
            self.seed
        };
        log::info!("Random seed {seed}");
        let mut rng = SmallRng::seed_from_u64(seed);

        log::info!("Initializing and training...");
        let prefix = self.prefix()?;
        let mut table = Table::open(&self.table, &self.annots, self.good_mask)?;
        let dists = DistStore::init(&table, &prefix, self.lo_pctl, self.hi_pctl)?;

        let learning = self
            .learning_filters
            .as_deref()
            .map(|expr| FilterSet::parse(expr, table.columns_mut()))
            .transpose()?;
        let fixed = self
            .fixed_filter
            .as_deref()
            .map(|expr| FilterSet::parse(expr, table.columns_mut()))
            .transpose()?;
        // filters may have pulled extra columns into the model
        dists.validate(table.columns())?;

        let som = TrainOptions::new(self.nt_total, self.learn_frac).run(
            &table,
            &dists,
            &self.params,
            learning.as_ref(),
            fixed.as_ref(),
            &mut rng,
        )?;

        let indel_ctx = match &self.fasta_ref {
            Some(path) if self.variant_type == VariantType::Indel => {
                Some(IndelContext::from_file(path)?)
            }
            _ => None,
        };

        let sites = format!("{prefix}.sites.gz");
        let totals = ScoreOptions::new(&som, self.variant_type)
            .fixed_filter(fixed.as_ref())
            .indel_context(indel_ctx)
            .write_sites(&table, &dists, &sites)?;

        EvalOptions::new(self.variant_type, self.provenance.clone()).run(
            &sites,
            format!("{prefix}.tab"),
            totals,
        )
    }
}
