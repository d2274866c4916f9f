use std::{error::Error, fs, io::Write, path::Path};

use assert_fs::{fixture::PathChild, TempDir};
use libvarsom::{evaluate::Provenance, som::SomParams, GoodMask, SomPipeline, VariantType};
use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Synthetic annotation table: good sites cluster around high QUAL / low
/// MQ0, everything else spreads out.
fn write_table(path: &Path, nrows: usize) -> Result<(), Box<dyn Error>> {
    let mut rng = SmallRng::seed_from_u64(99);
    let mut out = fs::File::create(path)?;
    writeln!(out, "# [1]CHROM\t[2]POS\t[3]MASK\t[4]REF\t[5]ALT\t[6]QUAL\t[7]MQ0")?;
    for i in 0..nrows {
        let good = i % 4 == 0;
        let (qual, mq0) = if good {
            (60.0 + 10.0 * rng.gen::<f64>(), 2.0 * rng.gen::<f64>())
        } else {
            (80.0 * rng.gen::<f64>(), 40.0 * rng.gen::<f64>())
        };
        let mask = if good { "010" } else { "000" };
        let (reference, alternate) = match i % 3 {
            0 => ("A", "G"),
            1 => ("C", "A"),
            _ => ("C", "T"),
        };
        writeln!(
            out,
            "1\t{}\t{}\t{}\t{}\t{:.4}\t{:.4}",
            i + 1,
            mask,
            reference,
            alternate,
            qual,
            mq0
        )?;
    }
    Ok(())
}

fn run_pipeline(table: &Path, out_dir: &Path) -> Result<(), Box<dyn Error>> {
    SomPipeline::new(table, VariantType::Snp)
        .output_prefix(out_dir)
        .good_mask("010".parse::<GoodMask>()?)
        .map_params(SomParams {
            nbin: 8,
            learn: 0.1,
            threshold: 0.2,
            nsom: 1,
        })
        .seed(7)
        .provenance(Provenance {
            version: "0.1.0".to_string(),
            command: "varsom integration".to_string(),
        })
        .run()?;
    Ok(())
}

#[test]
fn pipeline_produces_all_artifacts() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?.into_persistent_if(std::env::var("TEST_PERSIST").is_ok());
    let table = temp_dir.child("annots.tab");
    write_table(table.path(), 400)?;

    let out_dir = temp_dir.child("run");
    run_pipeline(table.path(), out_dir.path())?;

    // distribution stats: fixed 10-column header plus one row per column
    let dists = fs::read_to_string(out_dir.child("annots.n").path())?;
    let mut lines = dists.lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("# [1]nAll"));
    assert!(header.ends_with("[10]Annotation"));
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].ends_with("QUAL"));
    assert!(rows[1].ends_with("MQ0"));

    // sites artifact: header plus one scored record per complete row
    let sites: Vec<String> = {
        let rdr = libvarsom::utils::reader(out_dir.child("annots.sites.gz").path())?;
        use std::io::BufRead;
        rdr.lines().collect::<std::io::Result<Vec<_>>>()?
    };
    assert!(sites[0].starts_with("# [1]score"));
    assert_eq!(sites.len(), 401);
    for line in &sites[1..] {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 5);
        let score: f64 = fields[0].parse()?;
        assert!((0.0..=1.0).contains(&score), "score out of range: {score}");
        let class: u8 = fields[1].parse()?;
        assert!(class <= 1);
    }

    // quality table: type header, two provenance lines, gated data rows
    let tab = fs::read_to_string(out_dir.child("annots.tab").path())?;
    let mut lines = tab.lines();
    assert!(lines.next().unwrap().starts_with("# [1]ts/tv (all)"));
    assert!(lines.next().unwrap().starts_with("# varsomVersion="));
    assert!(lines.next().unwrap().starts_with("# varsomCommand=varsom integration"));
    let data: Vec<&str> = lines.collect();
    assert!(!data.is_empty());
    for line in &data {
        assert_eq!(line.split('\t').count(), 5);
    }
    let first_nall: u64 = data[0].split('\t').nth(1).unwrap().parse()?;
    assert!(first_nall >= 40, "emitted before the 10% gate: {first_nall}");

    temp_dir.close()?;
    Ok(())
}

#[test]
fn same_seed_runs_are_bit_identical() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let table = temp_dir.child("annots.tab");
    write_table(table.path(), 300)?;

    let first = temp_dir.child("first");
    let second = temp_dir.child("second");
    run_pipeline(table.path(), first.path())?;
    run_pipeline(table.path(), second.path())?;

    for artifact in ["annots.n", "annots.tab", "annots.sites.gz"] {
        let a = fs::read(first.child(artifact).path())?;
        let b = fs::read(second.child(artifact).path())?;
        assert_eq!(a, b, "{artifact} differs between same-seed runs");
    }
    temp_dir.close()?;
    Ok(())
}

#[test]
fn distribution_stats_are_reused_between_runs() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let table = temp_dir.child("annots.tab");
    write_table(table.path(), 200)?;

    let out_dir = temp_dir.child("run");
    run_pipeline(table.path(), out_dir.path())?;
    let stats = out_dir.child("annots.n");
    let before = fs::metadata(stats.path())?.modified()?;

    // second run over the same prefix loads the persisted stats
    run_pipeline(table.path(), out_dir.path())?;
    let after = fs::metadata(stats.path())?.modified()?;
    assert_eq!(before, after);
    temp_dir.close()?;
    Ok(())
}
