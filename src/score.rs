use std::{fs::File, io::Write, path::Path, str::FromStr};

use eyre::Result;
use noodles::bgzf;

use crate::{
    context::{self, IndelContext},
    dist::DistStore,
    filter::FilterSet,
    som::SomGrid,
    table::{Row, Table},
    utils,
};

/// Header of the BGZF sites artifact.
pub const SITES_HEADER: &str =
    "# [1]score\t[2]variant class\t[3]filter mask, good(&1)\t[4]chromosome\t[5]position";

/// Score recorded when no map cell clears the activation threshold.
pub const UNSCORED: f64 = f64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantType {
    Snp,
    Indel,
}

impl FromStr for VariantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SNP" => Ok(VariantType::Snp),
            "INDEL" => Ok(VariantType::Indel),
            _ => Err(format!("the variant type \"{s}\" is not recognised")),
        }
    }
}

fn acgt_code(base: u8) -> i32 {
    match base.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4,
    }
}

/// Transitions (A<->G, C<->T) are 1, transversions 0.
fn snp_class(reference: &str, alternate: &str) -> u8 {
    let r = reference.bytes().next().map_or(4, acgt_code);
    let a = alternate.bytes().next().map_or(4, acgt_code);
    u8::from((r - a).abs() == 2)
}

/// Totals observed while scoring; evaluation gating and sensitivity are
/// computed against these.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreTotals {
    pub nall: u64,
    pub ngood: u64,
}

/// Second pass over the table: each complete row is scored against the
/// frozen map and appended to the BGZF sites artifact.
pub struct ScoreOptions<'a> {
    som: &'a SomGrid,
    variant_type: VariantType,
    fixed_filter: Option<&'a FilterSet>,
    indel_ctx: Option<IndelContext>,
}

impl<'a> ScoreOptions<'a> {
    pub fn new(som: &'a SomGrid, variant_type: VariantType) -> Self {
        ScoreOptions {
            som,
            variant_type,
            fixed_filter: None,
            indel_ctx: None,
        }
    }

    pub fn fixed_filter(mut self, filter: Option<&'a FilterSet>) -> Self {
        self.fixed_filter = filter;
        self
    }

    pub fn indel_context(mut self, ctx: Option<IndelContext>) -> Self {
        self.indel_ctx = ctx;
        self
    }

    /// Scores every complete row and writes the sites artifact. The score
    /// is the minimum squared prototype distance normalized by the model
    /// width, so activated maps land in [0,1]; rows with no activated cell
    /// record [`UNSCORED`]. Bit 0 of the mask column is goodness, higher
    /// bits carry fixed-filter failures.
    pub fn write_sites<P>(mut self, table: &Table, dists: &DistStore, path: P) -> Result<ScoreTotals>
    where
        P: AsRef<Path>,
    {
        log::info!("Classifying...");
        let mut writer = bgzf::Writer::new(File::create(&path)?);
        writeln!(writer, "{SITES_HEADER}")?;

        let kdim = self.som.kdim();
        let max_dist = kdim as f64;
        let nann = table.columns().nann();
        let mut totals = ScoreTotals::default();

        let mut rows = table.rows(Some(dists), true)?;
        while let Some(row) = rows.next_row()? {
            if !row.complete(nann) {
                continue;
            }
            if row.is_good() {
                totals.ngood += 1;
            }
            totals.nall += 1;

            let score = match self.som.min_distance(&row.vals[..kdim]) {
                Some(dist) => dist / max_dist,
                None => UNSCORED,
            };
            let class = self.classify(&row)?;
            let failed = self
                .fixed_filter
                .map_or(0, |filter| filter.failed(&row.raw_vals));
            let goodness = u64::from(row.is_good()) | failed << 1;
            writeln!(
                writer,
                "{}\t{}\t{}\t{}\t{}",
                utils::sci(score),
                class,
                goodness,
                row.chrom,
                row.pos
            )?;
        }
        writer.finish()?;
        Ok(totals)
    }

    fn classify(&mut self, row: &Row) -> Result<u8> {
        match self.variant_type {
            VariantType::Snp => Ok(snp_class(&row.reference, &row.alternate)),
            VariantType::Indel => match self.indel_ctx.as_mut() {
                Some(ctx) => ctx.classify(&row.chrom, row.pos, &row.reference, &row.alternate),
                None => Ok(context::NOT_APPLICABLE),
            },
        }
    }
}
