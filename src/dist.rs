use std::{
    fs::File,
    io::{self, BufRead, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use eyre::Result;
use thiserror::Error;

use crate::{
    extsort::{ExternalSorter, SortItem},
    table::{Columns, Table, NFIXED},
    utils,
};

/// Default percentile bounds used to crop outliers before scaling.
pub const DEFAULT_LO_PCTL: f64 = 0.1;
pub const DEFAULT_HI_PCTL: f64 = 99.9;

/// Samples buffered per column before a sort chunk spills to disk.
const SPILL_LIMIT: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum DistError {
    #[error("no extremes found for the annotation: {0}")]
    NoExtremes(String),
    #[error("the annotation {0} does not look good (constant at {1:e}), please leave it out")]
    Constant(String, f64),
    #[error("could not parse distribution line {line} of {path}, expected 10 fields: [{text}]")]
    Malformed {
        path: PathBuf,
        line: usize,
        text: String,
    },
    #[error("missing header line in {0}")]
    MissingHeader(PathBuf),
}

/// Per-column distribution statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Dist {
    pub nall: u64,
    pub ngood: u64,
    pub nmissing: u64,
    pub good_min: f64,
    pub good_max: f64,
    pub all_min: f64,
    pub all_max: f64,
    pub scale_min: f64,
    pub scale_max: f64,
}

impl Dist {
    /// Piecewise-linear map into [0,1], clamped at the percentile bounds.
    pub fn scale(&self, val: f64) -> f64 {
        let scaled = if val < self.scale_min {
            0.0
        } else if val > self.scale_max {
            1.0
        } else {
            (val - self.scale_min) / (self.scale_max - self.scale_min)
        };
        debug_assert!((0.0..=1.0).contains(&scaled));
        scaled
    }
}

/// One streamed (value, goodness) observation headed for the sorter.
struct AnnotSample {
    value: f64,
    is_good: bool,
}

impl SortItem for AnnotSample {
    fn key(&self) -> f64 {
        self.value
    }

    fn encode<W: Write>(&self, wtr: &mut W) -> io::Result<()> {
        wtr.write_all(&self.value.to_le_bytes())?;
        wtr.write_all(&[u8::from(self.is_good)])
    }

    fn decode<R: Read>(rdr: &mut R) -> io::Result<Option<Self>> {
        let mut value = [0u8; 8];
        match rdr.read_exact(&mut value) {
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            other => other?,
        }
        let mut flag = [0u8; 1];
        rdr.read_exact(&mut flag)?;
        Ok(Some(AnnotSample {
            value: f64::from_le_bytes(value),
            is_good: flag[0] != 0,
        }))
    }
}

/// Distribution statistics for every annotation column, built from a full
/// table pass or reloaded from a persisted `.n` file. Immutable once
/// loaded.
#[derive(Debug)]
pub struct DistStore {
    dists: Vec<Dist>,
    nall: u64,
    ngood: u64,
}

impl DistStore {
    /// Resolves the distribution statistics for a table: `{prefix}.n` when
    /// present, else `{table}.n`, else a fresh build persisted to
    /// `{prefix}.n`. A fresh build is read back from disk so scaling
    /// behaves identically whether or not the file pre-existed.
    pub fn init(table: &Table, prefix: &str, lo_pctl: f64, hi_pctl: f64) -> Result<Self> {
        let own = format!("{prefix}.n");
        if Path::new(&own).exists() {
            log::info!("Re-using {own}...");
            return Self::load(&own, table.columns());
        }
        let shared = format!("{}.n", table.path().display());
        if Path::new(&shared).exists() {
            log::info!("Re-using {shared}...");
            return Self::load(&shared, table.columns());
        }
        create(table, &own, lo_pctl, hi_pctl)?;
        Self::load(&own, table.columns())
    }

    /// Reads a persisted `.n` file, aligning rows to the table's columns by
    /// annotation name. Unmatched file rows are ignored; table columns with
    /// no observations at all are fatal, as are constant model columns.
    pub fn load<P>(path: P, columns: &Columns) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let names: Vec<String> = (NFIXED..columns.ncols())
            .map(|col| columns.name_of(col).to_string())
            .collect();
        let mut dists = vec![Dist::default(); names.len()];

        let mut lines = utils::reader(path)?.lines();
        match lines.next().transpose()? {
            Some(header) if header.starts_with('#') => {}
            _ => return Err(DistError::MissingHeader(path.to_path_buf()).into()),
        }
        for (lineno, line) in lines.enumerate() {
            let line = line?;
            let malformed = || DistError::Malformed {
                path: path.to_path_buf(),
                line: lineno + 2,
                text: line.clone(),
            };
            let fields: Vec<&str> = line.split('\t').collect();
            let [nall, ngood, nmissing, good_min, good_max, all_min, all_max, scale_min, scale_max, name] =
                fields[..]
            else {
                return Err(malformed().into());
            };
            let Some(idx) = names.iter().position(|n| n == name) else {
                continue;
            };
            dists[idx] = Dist {
                nall: nall.parse().map_err(|_| malformed())?,
                ngood: ngood.parse().map_err(|_| malformed())?,
                nmissing: nmissing.parse().map_err(|_| malformed())?,
                good_min: good_min.parse().map_err(|_| malformed())?,
                good_max: good_max.parse().map_err(|_| malformed())?,
                all_min: all_min.parse().map_err(|_| malformed())?,
                all_max: all_max.parse().map_err(|_| malformed())?,
                scale_min: scale_min.parse().map_err(|_| malformed())?,
                scale_max: scale_max.parse().map_err(|_| malformed())?,
            };
        }

        let mut nall = u64::MAX;
        let mut ngood = u64::MAX;
        for (name, dist) in names.iter().zip(&dists) {
            if dist.nall == 0 && dist.nmissing == 0 {
                return Err(DistError::NoExtremes(name.clone()).into());
            }
            nall = nall.min(dist.nall);
            ngood = ngood.min(dist.ngood);
        }

        let store = DistStore { dists, nall, ngood };
        store.validate(columns)?;
        Ok(store)
    }

    /// Constant model columns make every scaled value collapse; fatal.
    /// Re-run after filter expressions extend the model.
    pub fn validate(&self, columns: &Columns) -> Result<()> {
        for entry in columns.model_entries() {
            let dist = self.column(entry.column);
            if dist.scale_min == dist.scale_max {
                return Err(DistError::Constant(entry.name.clone(), dist.scale_min).into());
            }
        }
        Ok(())
    }

    pub fn column(&self, column: usize) -> &Dist {
        &self.dists[column - NFIXED]
    }

    /// Scaling table indexed by model position.
    pub(crate) fn model_dists(&self, columns: &Columns) -> Vec<Dist> {
        columns
            .model_entries()
            .iter()
            .map(|entry| self.dists[entry.column - NFIXED])
            .collect()
    }

    /// Minimum observation count across all annotation columns.
    pub fn nall(&self) -> u64 {
        self.nall
    }

    /// Minimum good-site count across all annotation columns.
    pub fn ngood(&self) -> u64 {
        self.ngood
    }
}

/// Full pass over every annotation column: counts and extremes are tracked
/// in stream order while each column's (value, goodness) pairs feed a
/// sorter; the percentile bounds come from a scan of the sorted values.
fn create(table: &Table, path: &str, lo_pctl: f64, hi_pctl: f64) -> Result<()> {
    log::info!("Sorting annotations and creating distribution stats: {path}");
    let nann = table.columns().ncols() - NFIXED;
    let mut dists = vec![Dist::default(); nann];
    let mut sorters: Vec<ExternalSorter<AnnotSample>> =
        (0..nann).map(|_| ExternalSorter::new(SPILL_LIMIT)).collect();

    let mut rows = table.rows_all()?;
    while let Some(row) = rows.next_row()? {
        let is_good = row.is_good();
        for (i, dist) in dists.iter_mut().enumerate() {
            if row.missing[i] {
                dist.nmissing += 1;
                continue;
            }
            let val = row.raw_vals[i];
            if is_good {
                if dist.ngood == 0 {
                    dist.good_min = val;
                    dist.good_max = val;
                }
                dist.good_min = dist.good_min.min(val);
                dist.good_max = dist.good_max.max(val);
                dist.ngood += 1;
            }
            if dist.nall == 0 {
                dist.all_min = val;
                dist.all_max = val;
            }
            dist.all_min = dist.all_min.min(val);
            dist.all_max = dist.all_max.max(val);
            dist.nall += 1;
            sorters[i].push(AnnotSample {
                value: val,
                is_good,
            })?;
        }
    }

    for (dist, sorter) in dists.iter_mut().zip(sorters) {
        let (scale_min, scale_max) =
            percentile_bounds(sorter.finish()?, dist.nall, lo_pctl, hi_pctl)?;
        dist.scale_min = scale_min;
        dist.scale_max = scale_max;
    }

    save(path, table.columns(), &dists, lo_pctl, hi_pctl)
}

/// Scans a sorted stream with a running counter `k`: the low bound is the
/// first value whose running percentile `100*k/nall` reaches `lo_pctl`,
/// the high bound the first strictly past `hi_pctl`, falling back to the
/// last value observed.
fn percentile_bounds<I>(sorted: I, nall: u64, lo_pctl: f64, hi_pctl: f64) -> Result<(f64, f64)>
where
    I: Iterator<Item = io::Result<AnnotSample>>,
{
    let mut k = 0u64;
    let mut lo = None;
    let mut hi = None;
    let mut last = 0.0;
    for sample in sorted {
        let val = sample?.value;
        k += 1;
        last = val;
        let pctl = 100.0 * k as f64 / nall as f64;
        if lo.is_none() && pctl >= lo_pctl {
            lo = Some(val);
        }
        if hi.is_none() && pctl > hi_pctl {
            hi = Some(val);
        }
    }
    Ok((lo.unwrap_or(last), hi.unwrap_or(last)))
}

fn save(path: &str, columns: &Columns, dists: &[Dist], lo_pctl: f64, hi_pctl: f64) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(
        out,
        "# [1]nAll\t[2]nGood\t[3]nMissing\t[4]minGood\t[5]maxGood\t[6]minAll\t[7]maxAll\t[8]{lo_pctl:.6} percentile\t[9]{hi_pctl:.6} percentile\t[10]Annotation"
    )?;
    for (i, dist) in dists.iter().enumerate() {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            dist.nall,
            dist.ngood,
            dist.nmissing,
            utils::sci(dist.good_min),
            utils::sci(dist.good_max),
            utils::sci(dist.all_min),
            utils::sci(dist.all_max),
            utils::sci(dist.scale_min),
            utils::sci(dist.scale_max),
            columns.name_of(i + NFIXED),
        )?;
    }
    out.flush()?;
    Ok(())
}
