use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use bixgsea::core::enrichment::gsea::{default_threads, parse_permutation_type};
use bixgsea::core::enrichment::ranking::parse_ranking_metric;
use bixgsea::{
    plot, read_cls, read_expression, read_gmt, run_gsea, write_results_tsv, GseaParams, GseaPlot,
    GseaResults, RankingStatistic,
};

#[derive(Debug, Parser)]
#[command(
    name = "bixgsea",
    version,
    about = "Gene set enrichment analysis of two-phenotype expression data"
)]
struct Cli {
    #[arg(long, help = "Expression table (.gct or tab-separated)")]
    data: PathBuf,

    #[arg(long, help = "Phenotype labels (.cls)")]
    cls: PathBuf,

    #[arg(long, help = "Gene set library (.gmt)")]
    gmt: PathBuf,

    #[arg(long, default_value_t = 15)]
    min_size: usize,

    #[arg(long, default_value_t = 500)]
    max_size: usize,

    #[arg(long, default_value_t = 1000)]
    permutations: usize,

    #[arg(long, default_value = "gene_set", help = "gene_set | phenotype")]
    permutation_type: String,

    #[arg(
        long,
        default_value = "signal_to_noise",
        help = "signal_to_noise | abs_signal_to_noise | t_test | ratio_of_classes | diff_of_classes | log2_ratio_of_classes"
    )]
    method: String,

    #[arg(long, default_value_t = 1.0)]
    weight: f64,

    #[arg(long, help = "Worker threads (default: available cores - 2)")]
    threads: Option<usize>,

    #[arg(long, default_value_t = 7)]
    seed: u64,

    #[arg(
        long,
        allow_negative_numbers = true,
        help = "Term to plot: rank index (negative counts from the end) or name; repeatable"
    )]
    plot: Vec<String>,

    #[arg(long, default_value = ".")]
    plot_dir: PathBuf,

    #[arg(long, help = "Write the result table as TSV")]
    out: Option<PathBuf>,
}

/// File name for a term plot, prefixed with the rank so sanitised names stay
/// unique
fn plot_file(dir: &Path, rank: usize, term: &str) -> PathBuf {
    let stem: String = term
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    dir.join(format!("{:03}_{}.svg", rank, stem))
}

fn print_ranked(results: &GseaResults) {
    println!("rank\tterm\tES\tNES\tNOM p-val\tFDR q-val");
    for (i, r) in results.ranked_results().iter().enumerate() {
        let nes = r.nes.map_or_else(|| "NA".to_string(), |v| format!("{:.3}", v));
        println!(
            "{}\t{}\t{:.3}\t{}\t{:.4}\t{:.4}",
            i, r.term, r.es, nes, r.pval, r.fdr
        );
    }
}

fn plot_terms(
    results: &GseaResults,
    ranking: &RankingStatistic,
    selection: &[String],
    dir: &Path,
) -> Result<()> {
    let ranked = results.rank();
    let selection: Vec<String> = if selection.is_empty() {
        vec!["0".to_string(), "-1".to_string()]
    } else {
        selection.to_vec()
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating plot directory {}", dir.display()))?;

    for sel in &selection {
        let term = match sel.parse::<isize>() {
            Ok(idx) => ranked.term(idx)?.to_string(),
            Err(_) => {
                let pos = ranked.position(sel)?;
                tracing::info!(term = %sel, position = pos, "term located in ranking");
                sel.clone()
            }
        };
        let rank = ranked.position(&term)?;
        let result = results.lookup(&term)?;
        let config = GseaPlot::from_result(result, ranking, results.params().weight)
            .with_output(plot_file(dir, rank, &term));
        plot(ranking, &config).with_context(|| format!("plotting {}", term))?;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let permutation_type = parse_permutation_type(&cli.permutation_type).ok_or_else(|| {
        anyhow::anyhow!("unknown permutation type '{}'", cli.permutation_type)
    })?;
    let metric = parse_ranking_metric(&cli.method)
        .ok_or_else(|| anyhow::anyhow!("unknown ranking method '{}'", cli.method))?;

    let params = GseaParams {
        weight: cli.weight,
        min_size: cli.min_size,
        max_size: cli.max_size,
        permutations: cli.permutations,
        permutation_type,
        metric,
        seed: cli.seed,
        threads: cli.threads.unwrap_or_else(default_threads),
    };

    let matrix = read_expression(&cli.data)
        .with_context(|| format!("loading expression data {}", cli.data.display()))?;
    let phenotypes = read_cls(&cli.cls)
        .with_context(|| format!("loading phenotypes {}", cli.cls.display()))?;
    let library =
        read_gmt(&cli.gmt).with_context(|| format!("loading gene sets {}", cli.gmt.display()))?;
    tracing::info!(
        genes = matrix.n_genes(),
        samples = matrix.n_samples(),
        gene_sets = library.len(),
        "inputs loaded"
    );

    let (ranking, results) = run_gsea(&matrix, &phenotypes, &library, &params)?;

    print_ranked(&results);

    if let Some(out) = &cli.out {
        let file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
        write_results_tsv(&results, file)
            .with_context(|| format!("writing results to {}", out.display()))?;
        tracing::info!(path = %out.display(), "results written");
    }

    if results.is_empty() {
        tracing::warn!("no gene set was tested, nothing to plot");
        return Ok(());
    }
    plot_terms(&results, &ranking, &cli.plot, &cli.plot_dir)?;

    Ok(())
}
