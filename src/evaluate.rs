use std::{
    fs::File,
    io::{self, BufRead, BufReader, BufWriter, Read, Write},
    path::Path,
};

use eyre::Result;
use noodles::bgzf;

use crate::{
    extsort::{ExternalSorter, SortItem},
    score::{ScoreTotals, VariantType},
    utils,
};

/// Fraction of sites that must be consumed before the first quality line.
const MIN_SCANNED_FRAC: f64 = 0.1;
/// Minimum movement of the quality metric between emitted lines.
const METRIC_STEP: f64 = 0.005;
/// Records held in memory before the score sort spills to disk.
const SPILL_LIMIT: usize = 1 << 20;

/// Tool provenance recorded in the quality table.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub version: String,
    pub command: String,
}

impl Default for Provenance {
    fn default() -> Self {
        Provenance {
            version: env!("CARGO_PKG_VERSION").to_string(),
            command: String::from("varsom"),
        }
    }
}

/// One record cut from the sites artifact: score, class, goodness word.
struct SiteScore {
    score: f64,
    class: u8,
    goodness: u64,
}

impl SortItem for SiteScore {
    fn key(&self) -> f64 {
        self.score
    }

    fn encode<W: Write>(&self, wtr: &mut W) -> io::Result<()> {
        wtr.write_all(&self.score.to_le_bytes())?;
        wtr.write_all(&[self.class])?;
        wtr.write_all(&self.goodness.to_le_bytes())
    }

    fn decode<R: Read>(rdr: &mut R) -> io::Result<Option<Self>> {
        let mut score = [0u8; 8];
        match rdr.read_exact(&mut score) {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            other => other?,
        }
        let mut class = [0u8; 1];
        rdr.read_exact(&mut class)?;
        let mut goodness = [0u8; 8];
        rdr.read_exact(&mut goodness)?;
        Ok(Some(SiteScore {
            score: f64::from_le_bytes(score),
            class: class[0],
            goodness: u64::from_le_bytes(goodness),
        }))
    }
}

fn parse_site(line: &str) -> Result<SiteScore> {
    let mut fields = line.splitn(4, '\t');
    let mut next = || {
        fields
            .next()
            .ok_or_else(|| eyre::eyre!("could not parse sites record: [{line}]"))
    };
    let score: f64 = next()?
        .parse()
        .map_err(|_| eyre::eyre!("could not parse the score in: [{line}]"))?;
    let class: u8 = next()?
        .parse()
        .map_err(|_| eyre::eyre!("could not parse the variant class in: [{line}]"))?;
    let goodness: u64 = next()?
        .parse()
        .map_err(|_| eyre::eyre!("could not parse the filter mask in: [{line}]"))?;
    if class > 2 {
        eyre::bail!("variant class out of range in: [{line}]");
    }
    Ok(SiteScore {
        score,
        class,
        goodness,
    })
}

fn metric_of(variant_type: VariantType, nclass: &[u64; 3]) -> f64 {
    match variant_type {
        VariantType::Snp => nclass[1] as f64 / nclass[0] as f64,
        VariantType::Indel => nclass[1] as f64 / (nclass[1] + nclass[0]) as f64,
    }
}

/// Streams the sites artifact through an ascending score sort and folds it
/// into the threshold/sensitivity/quality table.
pub struct EvalOptions {
    variant_type: VariantType,
    provenance: Provenance,
    spill_limit: usize,
}

impl EvalOptions {
    pub fn new(variant_type: VariantType, provenance: Provenance) -> Self {
        EvalOptions {
            variant_type,
            provenance,
            spill_limit: SPILL_LIMIT,
        }
    }

    #[cfg(test)]
    fn spill_limit(mut self, limit: usize) -> Self {
        self.spill_limit = limit;
        self
    }

    /// The quality metric is ts/tv for SNPs and the repeat-consistency
    /// fraction for indels, tracked over all sites and over novel sites
    /// (not marked good). Nothing is emitted until a tenth of the sites
    /// have been consumed; afterwards a line is written whenever the
    /// metric has moved by more than the emission step.
    pub fn run<P, Q>(&self, sites: P, out: Q, totals: ScoreTotals) -> Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        log::info!("Evaluating...");
        let mut sorter = ExternalSorter::new(self.spill_limit);
        let rdr = BufReader::new(bgzf::Reader::new(File::open(&sites)?));
        for line in rdr.lines() {
            let line = line?;
            if line.starts_with('#') {
                continue;
            }
            sorter.push(parse_site(&line)?)?;
        }

        let mut out = BufWriter::new(File::create(&out)?);
        match self.variant_type {
            VariantType::Snp => writeln!(
                out,
                "# [1]ts/tv (all)\t[2]nAll\t[3]sensitivity\t[4]ts/tv (novel)\t[5]threshold"
            )?,
            VariantType::Indel => writeln!(
                out,
                "# [1]repeat consistency (all)\t[2]nAll\t[3]sensitivity\t[4]repeat consistency (novel)\t[5]threshold"
            )?,
        }
        writeln!(out, "# varsomVersion={}", self.provenance.version)?;
        writeln!(out, "# varsomCommand={}", self.provenance.command)?;

        let mut nall_read = 0u64;
        let mut ngood_read = 0u64;
        let mut nclass = [0u64; 3];
        let mut nclass_novel = [0u64; 3];
        let mut prev_metric: Option<f64> = None;
        for site in sorter.finish()? {
            let site = site?;
            nall_read += 1;
            nclass[site.class as usize] += 1;
            if site.goodness & 1 != 0 {
                ngood_read += 1;
            } else if totals.ngood > 0 {
                nclass_novel[site.class as usize] += 1;
            }

            if (nall_read as f64) / (totals.nall as f64) < MIN_SCANNED_FRAC {
                continue;
            }

            let metric = metric_of(self.variant_type, &nclass);
            if prev_metric.map_or(true, |prev| (prev - metric).abs() > METRIC_STEP) {
                let metric_novel = if nclass_novel[0] == 0 {
                    0.0
                } else {
                    metric_of(self.variant_type, &nclass_novel)
                };
                let sensitivity = if totals.ngood > 0 {
                    100.0 * ngood_read as f64 / totals.ngood as f64
                } else {
                    0.0
                };
                writeln!(
                    out,
                    "{metric:.3}\t{nall_read}\t{sensitivity:.2}\t{metric_novel:.3}\t{}",
                    utils::sci(site.score)
                )?;
                prev_metric = Some(metric);
            }
        }
        out.flush()?;
        Ok(())
    }
}
