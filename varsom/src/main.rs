use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::Verbosity;
use eyre::Result;
use human_panic::setup_panic;
use libvarsom::{
    evaluate::Provenance, som::SomParams, GoodMask, SomPipeline, VariantType,
};

fn parse_map_params(src: &str) -> Result<SomParams, String> {
    let fields: Vec<&str> = src.split(',').collect();
    let [nbin, learn, threshold, nsom] = fields[..] else {
        return Err(String::from("expected nbin,learn,threshold,nsom"));
    };
    let params = SomParams {
        nbin: nbin
            .parse()
            .map_err(|_| format!("invalid number of bins: {nbin}"))?,
        learn: learn
            .parse()
            .map_err(|_| format!("invalid learning constant: {learn}"))?,
        threshold: threshold
            .parse()
            .map_err(|_| format!("invalid BMU threshold: {threshold}"))?,
        nsom: nsom
            .parse()
            .map_err(|_| format!("invalid number of maps: {nsom}"))?,
    };
    if params.nbin < 2 {
        return Err(String::from("the map needs at least 2 bins"));
    }
    if params.nsom < 1 {
        return Err(String::from("the map count must be at least 1"));
    }
    Ok(params)
}

#[derive(Debug, Clone, Copy)]
struct TrainSites {
    total: usize,
    learn_frac: f64,
}

fn parse_ntrain_sites(src: &str) -> Result<TrainSites, String> {
    let (total, frac) = src
        .split_once(',')
        .ok_or_else(|| String::from("expected count,fraction"))?;
    let total = total
        .parse()
        .map_err(|_| format!("invalid training-site count: {total}"))?;
    let mut learn_frac: f64 = frac
        .parse()
        .map_err(|_| format!("invalid learning fraction: {frac}"))?;
    // a fraction above one reads as a percentage
    if learn_frac > 1.0 {
        learn_frac *= 0.01;
    }
    Ok(TrainSites { total, learn_frac })
}

/// SOM (self-organizing map) variant filtering: trains a map of good sites
/// from an annotation table and scores every site by prototype distance.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    verbose: Verbosity,

    /// Annotation table (tab-delimited, plain or bgzip-compressed)
    table: PathBuf,

    /// Comma-separated list of annotations (default: use all annotations)
    #[clap(short, long)]
    annots: Option<String>,

    /// Directory receiving the output artifacts
    #[clap(short = 'p', long)]
    output_prefix: Option<PathBuf>,

    /// Number of bins, learning constant, BMU threshold, number of maps
    #[clap(short = 'm', long, default_value = "20,0.1,0.2,1", value_parser = parse_map_params)]
    map_params: SomParams,

    /// Number of training sites and the fraction drawn from learning-filter sites
    #[clap(short = 'n', long, default_value = "0,0", value_parser = parse_ntrain_sites)]
    ntrain_sites: TrainSites,

    /// Filters selecting non-good training sites (values scaled to [0,1])
    #[clap(short = 'l', long)]
    learning_filters: Option<String>,

    /// Hard filters applied to raw annotation values (e.g. 'QUAL>4')
    #[clap(short = 'f', long)]
    fixed_filter: Option<String>,

    /// Mask recognising good variants in the annotation table
    #[clap(short = 'g', long, default_value = "010")]
    good_mask: GoodMask,

    /// Variant type to filter
    #[clap(short = 't', long, default_value = "SNP")]
    r#type: VariantType,

    /// Random seed, 0 for the current time
    #[clap(short = 'R', long, default_value_t = 1)]
    random_seed: u64,

    /// faidx-indexed reference sequence, required to classify indels
    #[clap(short = 'F', long)]
    fasta_ref: Option<PathBuf>,
}

fn main() -> Result<()> {
    setup_panic!();
    jane_eyre::install()?;

    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    if args.r#type == VariantType::Indel && args.fasta_ref.is_none() {
        eyre::bail!("expected --fasta-ref with --type INDEL");
    }

    let annots: Vec<String> = args
        .annots
        .as_deref()
        .map(|list| list.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    let provenance = Provenance {
        version: env!("CARGO_PKG_VERSION").to_string(),
        command: std::env::args().collect::<Vec<_>>().join(" "),
    };

    let mut pipeline = SomPipeline::new(&args.table, args.r#type)
        .annots(annots)
        .good_mask(args.good_mask)
        .map_params(args.map_params)
        .ntrain_sites(args.ntrain_sites.total, args.ntrain_sites.learn_frac)
        .seed(args.random_seed)
        .provenance(provenance);
    if let Some(dir) = args.output_prefix {
        pipeline = pipeline.output_prefix(dir);
    }
    if let Some(expr) = args.learning_filters {
        pipeline = pipeline.learning_filters(expr);
    }
    if let Some(expr) = args.fixed_filter {
        pipeline = pipeline.fixed_filter(expr);
    }
    if let Some(fasta) = args.fasta_ref {
        pipeline = pipeline.fasta_ref(fasta);
    }
    pipeline.run()
}
