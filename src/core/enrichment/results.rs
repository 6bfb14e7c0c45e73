use rustc_hash::FxHashMap;
use std::io::{BufWriter, Write};
use std::ops::Index;

use crate::core::enrichment::gsea::GseaParams;
use crate::error::{GseaError, Result};

////////////////
// Structures //
////////////////

/// Structure to store the enrichment result of a single gene set
///
/// ### Fields
///
/// * `term` - Name of the gene set
/// * `es` - Enrichment score
/// * `nes` - Normalised enrichment score; `None` if the null distribution had
///   no scores of the same sign
/// * `pval` - Nominal p-value
/// * `fdr` - FDR q-value (pooled over all tested gene sets)
/// * `fwer_pval` - Family-wise error rate p-value
/// * `padj` - Benjamini-Hochberg adjusted nominal p-value
/// * `size` - Overlap of the gene set with the ranking
/// * `set_size` - Size of the gene set in the library
/// * `tag_pct` - Fraction of the gene set in the leading edge
/// * `gene_pct` - Fraction of the ranking before (or after) the ES peak
/// * `leading_edge` - Genes of the leading edge subset in rank order
/// * `running_es` - Running enrichment score over the whole ranking
/// * `hits` - Sorted rank positions of the gene set members
#[derive(Clone, Debug)]
pub struct EnrichmentResult {
    pub term: String,
    pub es: f64,
    pub nes: Option<f64>,
    pub pval: f64,
    pub fdr: f64,
    pub fwer_pval: f64,
    pub padj: f64,
    pub size: usize,
    pub set_size: usize,
    pub tag_pct: f64,
    pub gene_pct: f64,
    pub leading_edge: Vec<String>,
    pub running_es: Vec<f64>,
    pub hits: Vec<usize>,
}

/// The results of an enrichment run
///
/// Results are kept in library order; `rank()` gives the significance order.
#[derive(Clone, Debug)]
pub struct GseaResults {
    results: Vec<EnrichmentResult>,
    index: FxHashMap<String, usize>,
    params: GseaParams,
}

impl GseaResults {
    /// Generate the results from the per set results and the used params
    pub fn new(results: Vec<EnrichmentResult>, params: GseaParams) -> Self {
        let index = results
            .iter()
            .enumerate()
            .map(|(i, r)| (r.term.clone(), i))
            .collect();
        Self {
            results,
            index,
            params,
        }
    }

    /// Results in library order
    pub fn results(&self) -> &[EnrichmentResult] {
        &self.results
    }

    /// Params the results were generated with
    pub fn params(&self) -> &GseaParams {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Get the result of a gene set
    ///
    /// ### Params
    ///
    /// * `name` - Name of the gene set
    ///
    /// ### Returns
    ///
    /// The `EnrichmentResult` or a `NotFound` error if the set was not tested
    /// (not in the library or removed by the size filter).
    pub fn lookup(&self, name: &str) -> Result<&EnrichmentResult> {
        self.index
            .get(name)
            .map(|&i| &self.results[i])
            .ok_or_else(|| GseaError::NotFound(format!("gene set '{}' has no result", name)))
    }

    /// Rank the tested terms
    ///
    /// Ascending nominal p-value, ties broken by descending |ES|, then by
    /// library order.
    pub fn rank(&self) -> RankedTerms {
        let mut order: Vec<usize> = (0..self.results.len()).collect();
        order.sort_by(|&a, &b| {
            let (ra, rb) = (&self.results[a], &self.results[b]);
            ra.pval
                .total_cmp(&rb.pval)
                .then_with(|| rb.es.abs().total_cmp(&ra.es.abs()))
        });
        RankedTerms {
            terms: order
                .into_iter()
                .map(|i| self.results[i].term.clone())
                .collect(),
        }
    }

    /// Results in ranked order
    pub fn ranked_results(&self) -> Vec<&EnrichmentResult> {
        self.rank()
            .iter()
            .filter_map(|t| self.index.get(t).map(|&i| &self.results[i]))
            .collect()
    }
}

/// Ordered term names with Python-style (negative) indexing
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RankedTerms {
    terms: Vec<String>,
}

impl RankedTerms {
    /// Resolve a possibly negative index; `-1` is the last term
    fn resolve(&self, idx: isize) -> Option<usize> {
        let n = self.terms.len() as isize;
        let i = if idx < 0 { n + idx } else { idx };
        if (0..n).contains(&i) {
            Some(i as usize)
        } else {
            None
        }
    }

    /// Get a term by position
    ///
    /// ### Params
    ///
    /// * `idx` - Position; negative values count from the end
    pub fn get(&self, idx: isize) -> Option<&str> {
        self.resolve(idx).map(|i| self.terms[i].as_str())
    }

    /// Like `get`, but out of range positions are a `NotFound` error
    pub fn term(&self, idx: isize) -> Result<&str> {
        self.get(idx).ok_or_else(|| {
            GseaError::NotFound(format!(
                "term index {} out of range for {} ranked terms",
                idx,
                self.terms.len()
            ))
        })
    }

    /// Position of a term in the ranking
    pub fn position(&self, name: &str) -> Result<usize> {
        self.terms
            .iter()
            .position(|t| t == name)
            .ok_or_else(|| GseaError::NotFound(format!("term '{}' is not ranked", name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.terms.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl Index<isize> for RankedTerms {
    type Output = str;

    fn index(&self, idx: isize) -> &str {
        match self.get(idx) {
            Some(t) => t,
            None => panic!(
                "term index {} out of range for {} ranked terms",
                idx,
                self.terms.len()
            ),
        }
    }
}

////////////
// Output //
////////////

/// Write the result table as tab-separated values in ranked order
///
/// ### Params
///
/// * `results` - The enrichment results
/// * `writer` - Destination
pub fn write_results_tsv<W: Write>(results: &GseaResults, writer: W) -> std::io::Result<()> {
    let mut w = BufWriter::new(writer);
    writeln!(
        w,
        "Term\tES\tNES\tNOM p-val\tFDR q-val\tFWER p-val\tBH p-adj\tTag %\tGene %\tLead_genes"
    )?;
    for r in results.ranked_results() {
        let nes = r.nes.map_or_else(|| "NA".to_string(), |v| format!("{:.6}", v));
        writeln!(
            w,
            "{}\t{:.6}\t{}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{}/{}\t{:.2}%\t{}",
            r.term,
            r.es,
            nes,
            r.pval,
            r.fdr,
            r.fwer_pval,
            r.padj,
            r.leading_edge.len(),
            r.size,
            r.gene_pct * 100.0,
            r.leading_edge.join(";")
        )?;
    }
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(term: &str, es: f64, pval: f64) -> EnrichmentResult {
        EnrichmentResult {
            term: term.to_string(),
            es,
            nes: Some(es * 2.0),
            pval,
            fdr: pval,
            fwer_pval: pval,
            padj: pval,
            size: 2,
            set_size: 3,
            tag_pct: 0.5,
            gene_pct: 0.25,
            leading_edge: vec!["G1".to_string()],
            running_es: vec![0.5, 0.0],
            hits: vec![0],
        }
    }

    fn results() -> GseaResults {
        GseaResults::new(
            vec![
                result("A", 0.3, 0.20),
                result("B", -0.8, 0.01),
                result("C", 0.6, 0.20),
                result("D", 0.9, 0.01),
            ],
            GseaParams::default(),
        )
    }

    #[test]
    fn test_rank_order() {
        let ranked = results().rank();
        let terms: Vec<&str> = ranked.iter().collect();
        assert_eq!(terms, vec!["D", "B", "C", "A"]);
    }

    #[test]
    fn test_negative_indexing() {
        let ranked = results().rank();
        assert_eq!(ranked.get(0), Some("D"));
        assert_eq!(ranked.get(-1), Some("A"));
        assert_eq!(ranked.get(-4), Some("D"));
        assert_eq!(ranked.get(-5), None);
        assert_eq!(ranked.get(4), None);
        assert_eq!(&ranked[-2], "C");
        assert!(matches!(ranked.term(10), Err(GseaError::NotFound(_))));
        assert_eq!(ranked.position("B").unwrap(), 1);
        assert!(ranked.position("Z").is_err());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_index_out_of_range_panics() {
        let ranked = results().rank();
        let _ = &ranked[7];
    }

    #[test]
    fn test_lookup() {
        let res = results();
        assert_eq!(res.lookup("C").unwrap().es, 0.6);
        let err = res.lookup("GOLUB_ALL_VS_AML_DN").unwrap_err();
        assert!(matches!(err, GseaError::NotFound(_)));
        assert!(err.to_string().contains("GOLUB_ALL_VS_AML_DN"));
    }

    #[test]
    fn test_empty_results_rank() {
        let res = GseaResults::new(Vec::new(), GseaParams::default());
        assert!(res.rank().is_empty());
        assert!(res.rank().term(0).is_err());
        assert!(res.rank().term(-1).is_err());
    }

    #[test]
    fn test_write_results_tsv() {
        let mut buf = Vec::new();
        write_results_tsv(&results(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("Term\tES\tNES"));
        assert!(lines[1].starts_with("D\t0.900000\t1.800000"));
        assert!(lines[4].ends_with("\t1/2\t25.00%\tG1"));
    }
}
