use std::{
    fs::File,
    io::{Read, Seek},
    path::Path,
};

use bio::io::fasta::IndexedReader;
use eyre::Result;
use fnv::FnvHashMap;

/// Variant classes shared with the scoring pass.
pub const REPEAT_INCONSISTENT: u8 = 0;
pub const REPEAT_CONSISTENT: u8 = 1;
pub const NOT_APPLICABLE: u8 = 2;

/// How far past the indel the reference is scanned for the repeat tract.
const REPEAT_WINDOW: u64 = 100;
/// Longest repeat unit considered.
const MAX_UNIT: usize = 10;

/// Classifies indels as repeat-consistent or not against a faidx-indexed
/// reference: an indel whose length change is a whole multiple of the
/// local tandem-repeat unit is consistent.
pub struct IndelContext<R: Read + Seek = File> {
    genome: IndexedReader<R>,
    chrom_lens: FnvHashMap<String, u64>,
}

impl IndelContext<File> {
    pub fn from_file<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let genome =
            IndexedReader::from_file(&path.as_ref()).map_err(|e| eyre::eyre!(e.to_string()))?;
        Ok(Self::new(genome))
    }
}

impl<R: Read + Seek> IndelContext<R> {
    pub fn new(genome: IndexedReader<R>) -> Self {
        let mut chrom_lens = FnvHashMap::default();
        genome.index.sequences().into_iter().for_each(|sequence| {
            chrom_lens.insert(sequence.name, sequence.len);
        });
        IndelContext { genome, chrom_lens }
    }

    /// Repeat class for the indel at `pos` (1-based, anchor-base
    /// convention): repeat-consistent (1), repeat-inconsistent (0) or
    /// not-applicable (2) when there is no length change, no repeat tract,
    /// or a homopolymer unit.
    pub fn classify(
        &mut self,
        chrom: &str,
        pos: i64,
        reference: &str,
        alternate: &str,
    ) -> Result<u8> {
        let Some((nrep, nlen, ndel)) = self.repeat_profile(chrom, pos, reference, alternate)?
        else {
            return Ok(NOT_APPLICABLE);
        };
        if nlen <= 1 || nrep <= 1 {
            return Ok(NOT_APPLICABLE);
        }
        if ndel.unsigned_abs() % nlen as u64 == 0 {
            Ok(REPEAT_CONSISTENT)
        } else {
            Ok(REPEAT_INCONSISTENT)
        }
    }

    /// `(nrep, nlen, ndel)`: consecutive copies of the reference repeat
    /// unit downstream of the indel, the unit length, and the signed
    /// allele-length change. `None` when the alleles have equal length or
    /// no unit repeats at the site.
    #[allow(clippy::read_zero_byte_vec)]
    fn repeat_profile(
        &mut self,
        chrom: &str,
        pos: i64,
        reference: &str,
        alternate: &str,
    ) -> Result<Option<(u64, usize, i64)>> {
        let ndel = alternate.len() as i64 - reference.len() as i64;
        if ndel == 0 {
            return Ok(None);
        }
        let &chrom_len = self
            .chrom_lens
            .get(chrom)
            .ok_or_else(|| eyre::eyre!("the chromosome \"{chrom}\" is not in the reference"))?;

        // first base touched by the indel, zero-based
        let prefix = common_prefix(reference.as_bytes(), alternate.as_bytes());
        let start = (pos - 1).max(0) as u64 + prefix as u64;
        if start >= chrom_len {
            return Ok(None);
        }
        let stop = (start + REPEAT_WINDOW).min(chrom_len);
        self.genome.fetch(chrom, start, stop)?;
        let mut window = Vec::new();
        self.genome.read(&mut window)?;
        window.make_ascii_uppercase();

        let Some(nlen) = repeat_unit(&window) else {
            return Ok(None);
        };
        Ok(Some((consecutive_repeats(&window, nlen), nlen, ndel)))
    }
}

/// Length of the shared prefix of `a` and `b`.
fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Shortest prefix of `window` that repeats at least twice back to back.
fn repeat_unit(window: &[u8]) -> Option<usize> {
    (1..=MAX_UNIT.min(window.len() / 2)).find(|&len| window[len..2 * len] == window[..len])
}

fn consecutive_repeats(window: &[u8], unit: usize) -> u64 {
    window
        .chunks_exact(unit)
        .take_while(|chunk| *chunk == &window[..unit])
        .count() as u64
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::*;

    // one: AT-repeat tract; two: homopolymer then a CAG tract
    const FASTA_FILE: &[u8] = b">one\nGATATATATATATATATATCCGGA\n>two\nAAAAAAACAGCAGCAGCAGTTTTT\n";
    const FAI_FILE: &[u8] = b"one\t24\t5\t24\t25\ntwo\t24\t35\t24\t25\n";

    fn ctx() -> IndelContext<Cursor<&'static [u8]>> {
        let genome = IndexedReader::new(Cursor::new(FASTA_FILE), FAI_FILE).unwrap();
        IndelContext::new(genome)
    }

    #[test]
    fn deletion_of_whole_units_is_consistent() {
        let mut ctx = ctx();
        // removes "AT" from the tract starting after the G anchor
        assert_eq!(ctx.classify("one", 1, "GAT", "G").unwrap(), REPEAT_CONSISTENT);
        // inserting two more units keeps the register too
        assert_eq!(ctx.classify("one", 1, "G", "GATAT").unwrap(), REPEAT_CONSISTENT);
    }

    #[test]
    fn partial_unit_changes_are_inconsistent() {
        let mut ctx = ctx();
        assert_eq!(
            ctx.classify("one", 1, "GATA", "G").unwrap(),
            REPEAT_INCONSISTENT
        );
        assert_eq!(
            ctx.classify("one", 1, "G", "GA").unwrap(),
            REPEAT_INCONSISTENT
        );
    }

    #[test]
    fn homopolymer_units_are_not_applicable() {
        let mut ctx = ctx();
        assert_eq!(ctx.classify("two", 1, "AA", "A").unwrap(), NOT_APPLICABLE);
    }

    #[test]
    fn equal_length_alleles_are_not_applicable() {
        let mut ctx = ctx();
        assert_eq!(ctx.classify("one", 2, "A", "T").unwrap(), NOT_APPLICABLE);
    }

    #[test]
    fn no_repeat_tract_is_not_applicable() {
        let mut ctx = ctx();
        // the deleted base is the last of the chromosome, so the window
        // left after the anchor holds no repeating unit
        assert_eq!(ctx.classify("one", 23, "GA", "G").unwrap(), NOT_APPLICABLE);
    }

    #[test]
    fn triplet_tract_classifies_by_register() {
        let mut ctx = ctx();
        // pos 7 anchors on the last A of the homopolymer; the tract after
        // it is CAGCAGCAGCAG
        assert_eq!(
            ctx.classify("two", 7, "ACAG", "A").unwrap(),
            REPEAT_CONSISTENT
        );
        assert_eq!(
            ctx.classify("two", 7, "ACA", "A").unwrap(),
            REPEAT_INCONSISTENT
        );
    }

    #[test]
    fn unknown_chromosome_is_fatal() {
        let mut ctx = ctx();
        assert!(ctx.classify("three", 1, "GA", "G").is_err());
    }
}
