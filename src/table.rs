use std::{
    io::BufRead,
    path::{Path, PathBuf},
    str::FromStr,
};

use eyre::Result;
use thiserror::Error;

use crate::{dist::Dist, utils};

/// Number of fixed leading columns: CHROM, POS, MASK, REF, ALT.
pub const NFIXED: usize = 5;

/// Bit set in [`Row::mask`] when the site matches the good-mask.
pub const MASK_GOOD: u8 = 2;

/// Model annotations are tracked in a 64-bit presence bitmap.
pub const MAX_ANNOTS: usize = 64;

const HEADER_PREFIX: &str = "# [1]CHROM\t[2]POS\t[3]MASK\t[4]REF\t[5]ALT";

#[derive(Debug, Error)]
pub enum TableError {
    #[error("missing header line in {0}, was the table extracted with headers?")]
    MissingHeader(PathBuf),
    #[error("version mismatch in {path}:\n\t[{found}]\n\t[{expected}]")]
    HeaderMismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },
    #[error("malformed column header [{0}], expected the form [i]Name")]
    BadColumnHeader(String),
    #[error("duplicate column name: [{0}]")]
    DuplicateColumn(String),
    #[error("the requested annotation \"{0}\" is not in the table")]
    UnknownAnnotation(String),
    #[error("the annotation \"{0}\" was given multiple times")]
    RepeatedAnnotation(String),
    #[error("too many annotations ({0}), the model is limited to {MAX_ANNOTS}")]
    TooManyAnnotations(usize),
    #[error("no annotation columns after the {NFIXED} fixed fields")]
    NoAnnotations,
    #[error("could not parse {field} on line {line}: [{text}]")]
    BadField {
        field: String,
        line: u64,
        text: String,
    },
    #[error("line {line} has {found} columns, expected {expected}: is the line truncated?")]
    WrongWidth {
        line: u64,
        found: usize,
        expected: usize,
    },
}

#[derive(Debug, Error)]
#[error("good-mask may contain only '0' and '1': [{0}]")]
pub struct MaskError(String);

/// Which positions of the per-site mask string denote a good site.
/// Position 0 is the leftmost character.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoodMask(u64);

impl GoodMask {
    /// True when any selected position carries a '1' in the mask field.
    pub fn matches(&self, mask_field: &str) -> bool {
        mask_field
            .bytes()
            .take(MAX_ANNOTS)
            .enumerate()
            .any(|(i, b)| b == b'1' && self.0 & (1 << i) != 0)
    }
}

impl FromStr for GoodMask {
    type Err = MaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bits = 0u64;
        for (i, b) in s.bytes().take(MAX_ANNOTS).enumerate() {
            match b {
                b'1' => bits |= 1 << i,
                b'0' => {}
                _ => return Err(MaskError(s.to_string())),
            }
        }
        Ok(GoodMask(bits))
    }
}

/// One annotation column bound into the model.
#[derive(Debug, Clone)]
pub struct ModelColumn {
    pub column: usize,
    pub model: usize,
    pub name: String,
}

/// Immutable column identity table: every column name plus the
/// column<->model index maps. Hot-path lookups are by position, never by
/// name. Filter expressions may append extra model entries after open;
/// `nann_som` stays frozen so the SOM width is unaffected.
#[derive(Debug, Clone)]
pub struct Columns {
    colnames: Vec<String>,
    entries: Vec<ModelColumn>,
    col2model: Vec<Option<usize>>,
    nann_som: usize,
}

impl Columns {
    pub(crate) fn parse_header(
        path: &Path,
        line: &str,
        requested: &[String],
    ) -> Result<Self, TableError> {
        if !line.starts_with('#') {
            return Err(TableError::MissingHeader(path.to_path_buf()));
        }
        if !line.starts_with(HEADER_PREFIX) {
            let found = line.chars().take(HEADER_PREFIX.len()).collect();
            return Err(TableError::HeaderMismatch {
                path: path.to_path_buf(),
                found,
                expected: HEADER_PREFIX.to_string(),
            });
        }

        let mut colnames: Vec<String> = Vec::new();
        for raw in line.split('\t') {
            let name = raw
                .split_once(']')
                .map(|(_, name)| name)
                .ok_or_else(|| TableError::BadColumnHeader(raw.to_string()))?;
            if colnames.iter().any(|seen| seen == name) {
                return Err(TableError::DuplicateColumn(name.to_string()));
            }
            colnames.push(name.to_string());
        }
        if colnames.len() <= NFIXED {
            return Err(TableError::NoAnnotations);
        }

        let mut col2model = vec![None; colnames.len()];
        let mut entries = Vec::new();
        if requested.is_empty() {
            for (column, name) in colnames.iter().enumerate().skip(NFIXED) {
                col2model[column] = Some(entries.len());
                entries.push(ModelColumn {
                    column,
                    model: entries.len(),
                    name: name.clone(),
                });
            }
        } else {
            for name in requested {
                let column = colnames
                    .iter()
                    .skip(NFIXED)
                    .position(|c| c == name)
                    .map(|i| i + NFIXED)
                    .ok_or_else(|| TableError::UnknownAnnotation(name.clone()))?;
                if col2model[column].is_some() {
                    return Err(TableError::RepeatedAnnotation(name.clone()));
                }
                col2model[column] = Some(entries.len());
                entries.push(ModelColumn {
                    column,
                    model: entries.len(),
                    name: name.clone(),
                });
            }
        }
        if entries.len() > MAX_ANNOTS {
            return Err(TableError::TooManyAnnotations(entries.len()));
        }

        let nann_som = entries.len();
        Ok(Columns {
            colnames,
            entries,
            col2model,
            nann_som,
        })
    }

    pub fn ncols(&self) -> usize {
        self.colnames.len()
    }

    /// Number of model annotations, filter extensions included.
    pub fn nann(&self) -> usize {
        self.entries.len()
    }

    /// Model width seen by the SOM, frozen at open.
    pub fn nann_som(&self) -> usize {
        self.nann_som
    }

    pub fn name_of(&self, column: usize) -> &str {
        &self.colnames[column]
    }

    pub fn model_of(&self, column: usize) -> Option<usize> {
        self.col2model[column]
    }

    pub fn model_entries(&self) -> &[ModelColumn] {
        &self.entries
    }

    /// Column index of an annotation (fixed fields never match).
    pub fn find_annotation(&self, name: &str) -> Option<usize> {
        self.colnames
            .iter()
            .skip(NFIXED)
            .position(|c| c == name)
            .map(|i| i + NFIXED)
    }

    /// Pulls a column into the model, returning its model index.
    pub(crate) fn extend(&mut self, column: usize) -> Result<usize, TableError> {
        if self.entries.len() >= MAX_ANNOTS {
            return Err(TableError::TooManyAnnotations(self.entries.len() + 1));
        }
        let model = self.entries.len();
        self.col2model[column] = Some(model);
        self.entries.push(ModelColumn {
            column,
            model,
            name: self.colnames[column].clone(),
        });
        Ok(model)
    }
}

/// One parsed annotation row.
#[derive(Debug, Clone)]
pub struct Row {
    pub chrom: String,
    pub pos: i64,
    /// 2 when the site matches the good-mask, 1 otherwise.
    pub mask: u8,
    pub reference: String,
    pub alternate: String,
    /// Model-indexed values, scaled into [0,1] when the pass scales.
    pub vals: Vec<f64>,
    /// Model-indexed values as written in the table.
    pub raw_vals: Vec<f64>,
    pub missing: Vec<bool>,
    pub nset: usize,
    pub nset_mask: u64,
}

impl Row {
    pub fn is_good(&self) -> bool {
        self.mask & MASK_GOOD != 0
    }

    /// True when every model annotation is present.
    pub fn complete(&self, nann: usize) -> bool {
        self.nset == nann
    }
}

/// The annotation table: header parsed once at open, rows re-read on each
/// pass.
#[derive(Debug)]
pub struct Table {
    path: PathBuf,
    columns: Columns,
    good_mask: GoodMask,
}

impl Table {
    pub fn open<P>(path: P, requested: &[String], good_mask: GoodMask) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_path_buf();
        let mut rdr = utils::reader(&path)?;
        let mut header = String::new();
        rdr.read_line(&mut header)?;
        let header = header.trim_end_matches(['\n', '\r']);
        let columns = Columns::parse_header(&path, header, requested)?;
        Ok(Table {
            path,
            columns,
            good_mask,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut Columns {
        &mut self.columns
    }

    /// Starts a fresh pass restricted to the model columns.
    pub fn rows(&self, dists: Option<&crate::dist::DistStore>, scale: bool) -> Result<RowReader> {
        let scaling = match (scale, dists) {
            (true, Some(store)) => Some(store.model_dists(&self.columns)),
            _ => None,
        };
        self.pass(self.columns.col2model.clone(), self.columns.nann(), scaling)
    }

    /// Pass reading every annotation column in declared order, used to
    /// build the distribution statistics.
    pub(crate) fn rows_all(&self) -> Result<RowReader> {
        let ncols = self.columns.ncols();
        let col2model = (0..ncols)
            .map(|col| (col >= NFIXED).then(|| col - NFIXED))
            .collect();
        self.pass(col2model, ncols - NFIXED, None)
    }

    fn pass(
        &self,
        col2model: Vec<Option<usize>>,
        nann: usize,
        scaling: Option<Vec<Dist>>,
    ) -> Result<RowReader> {
        let mut rdr = utils::reader(&self.path)?;
        let mut header = String::new();
        rdr.read_line(&mut header)?;
        let rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .from_reader(rdr);
        Ok(RowReader {
            rdr,
            record: csv::StringRecord::new(),
            colnames: self.columns.colnames.clone(),
            col2model,
            nann,
            scaling,
            good_mask: self.good_mask,
            line: 1,
        })
    }
}

/// One pass over the table's data rows.
pub struct RowReader {
    rdr: csv::Reader<Box<dyn BufRead>>,
    record: csv::StringRecord,
    colnames: Vec<String>,
    col2model: Vec<Option<usize>>,
    nann: usize,
    scaling: Option<Vec<Dist>>,
    good_mask: GoodMask,
    line: u64,
}

impl RowReader {
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if !self.rdr.read_record(&mut self.record)? {
            return Ok(None);
        }
        self.line += 1;
        let line = self.line;
        if self.record.len() != self.col2model.len() {
            return Err(TableError::WrongWidth {
                line,
                found: self.record.len(),
                expected: self.col2model.len(),
            }
            .into());
        }

        let pos: i64 = self.record[1].parse().map_err(|_| TableError::BadField {
            field: "POS".to_string(),
            line,
            text: self.record[1].to_string(),
        })?;
        let mask = if self.good_mask.matches(&self.record[2]) {
            MASK_GOOD
        } else {
            1
        };
        let mut row = Row {
            chrom: self.record[0].to_string(),
            pos,
            mask,
            reference: self.record[3].to_string(),
            alternate: self.record[4].to_string(),
            vals: vec![f64::NAN; self.nann],
            raw_vals: vec![f64::NAN; self.nann],
            missing: vec![true; self.nann],
            nset: 0,
            nset_mask: 0,
        };

        for (column, field) in self.record.iter().enumerate().skip(NFIXED) {
            let Some(iann) = self.col2model[column] else {
                continue;
            };
            if field == "." {
                continue;
            }
            let val: f64 = field.parse().map_err(|_| TableError::BadField {
                field: self.colnames[column].clone(),
                line,
                text: field.to_string(),
            })?;
            if !val.is_finite() {
                continue;
            }
            row.raw_vals[iann] = val;
            row.vals[iann] = match &self.scaling {
                Some(dists) => dists[iann].scale(val),
                None => val,
            };
            row.missing[iann] = false;
            row.nset += 1;
            row.nset_mask |= 1 << iann;
        }
        Ok(Some(row))
    }
}
