use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use eyre::{Result, WrapErr};
use noodles::bgzf;

/// Opens a text artifact for reading, transparently decompressing BGZF
/// when the path ends in `.gz`.
pub fn reader<P>(path: P) -> Result<Box<dyn BufRead>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = File::open(path).wrap_err_with(|| format!("could not read {}", path.display()))?;
    if path.extension().map_or(false, |ext| ext == "gz") {
        Ok(Box::new(BufReader::new(bgzf::Reader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Scientific-notation rendering used by every persisted float.
pub(crate) fn sci(val: f64) -> String {
    format!("{val:.6e}")
}
