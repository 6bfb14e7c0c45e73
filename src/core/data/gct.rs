use faer::Mat;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::core::data::cls::PhenotypeAssignment;
use crate::error::{GseaError, Result};
use crate::utils::general::{first_duplicate, index_map};

////////////////
// Structures //
////////////////

/// Dense gene expression matrix
///
/// ### Fields
///
/// * `genes` - Unique gene identifiers (rows).
/// * `samples` - Sample names (columns).
/// * `values` - The expression values with shape genes x samples.
#[derive(Clone, Debug)]
pub struct ExpressionMatrix {
    genes: Vec<String>,
    samples: Vec<String>,
    values: Mat<f64>,
}

impl ExpressionMatrix {
    /// Generate a new expression matrix from row-major data
    ///
    /// ### Params
    ///
    /// * `genes` - Gene identifiers, one per row.
    /// * `samples` - Sample names, one per column.
    /// * `rows` - The expression values, one vector per gene.
    ///
    /// ### Returns
    ///
    /// The matrix or a `Data` error on ragged rows, duplicated genes or
    /// non-finite values.
    pub fn from_rows(genes: Vec<String>, samples: Vec<String>, rows: &[Vec<f64>]) -> Result<Self> {
        if genes.len() != rows.len() {
            return Err(GseaError::Data(format!(
                "{} gene identifiers for {} rows",
                genes.len(),
                rows.len()
            )));
        }
        if let Some(dup) = first_duplicate(&genes) {
            return Err(GseaError::Data(format!("duplicated gene identifier '{}'", dup)));
        }
        for (gene, row) in genes.iter().zip(rows) {
            if row.len() != samples.len() {
                return Err(GseaError::Data(format!(
                    "gene '{}' has {} values, expected {}",
                    gene,
                    row.len(),
                    samples.len()
                )));
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(GseaError::Data(format!(
                    "gene '{}' contains non-finite values",
                    gene
                )));
            }
        }

        let values = Mat::from_fn(genes.len(), samples.len(), |i, j| rows[i][j]);

        Ok(Self {
            genes,
            samples,
            values,
        })
    }

    /// Gene identifiers
    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    /// Sample names
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Expression value of gene `i` in sample `j`
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[(i, j)]
    }

    /// Copy out the expression values of a single gene
    pub fn row(&self, i: usize) -> Vec<f64> {
        (0..self.n_samples()).map(|j| self.values[(i, j)]).collect()
    }

    /// Lookup from gene identifier to row index
    pub fn gene_index(&self) -> FxHashMap<&str, usize> {
        index_map(&self.genes)
    }

    /// Check that the phenotype assignment is aligned with the columns
    ///
    /// ### Returns
    ///
    /// `Data` error if the number of labels differs from the sample count.
    pub fn validate_phenotypes(&self, phenotypes: &PhenotypeAssignment) -> Result<()> {
        if phenotypes.len() != self.n_samples() {
            return Err(GseaError::Data(format!(
                "{} phenotype labels for {} expression samples",
                phenotypes.len(),
                self.n_samples()
            )));
        }
        Ok(())
    }
}

/////////////
// Parsing //
/////////////

/// Check if a header cell is the GCT description column
fn is_description_column(cell: &str) -> bool {
    matches!(
        cell.trim().to_lowercase().as_str(),
        "description" | "desc"
    )
}

/// Read an expression file (GCT or plain tab-separated)
///
/// ### Params
///
/// * `path` - Path to the expression file
///
/// ### Returns
///
/// The `ExpressionMatrix`
pub fn read_expression<P: AsRef<Path>>(path: P) -> Result<ExpressionMatrix> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| GseaError::io(path, e))?;
    parse_expression(BufReader::new(file), path)
}

/// Parse an expression table from any buffered reader
///
/// Accepts the GCT layout (`#1.2` version line, `<rows> <cols>` dimension
/// line, header) or a plain tab-separated table whose first row is the
/// header. The first column holds the gene identifiers; a second column
/// named `Description` is skipped.
///
/// ### Params
///
/// * `reader` - The buffered reader
/// * `path` - Path used in error messages
///
/// ### Returns
///
/// The `ExpressionMatrix`
pub fn parse_expression<R: BufRead>(reader: R, path: &Path) -> Result<ExpressionMatrix> {
    let mut lines = reader.lines().enumerate().filter_map(|(i, l)| match l {
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(Ok((i + 1, line))),
        Err(e) => Some(Err(e)),
    });

    let mut next_line = || -> Result<Option<(usize, String)>> {
        lines.next().transpose().map_err(|e| GseaError::io(path, e))
    };

    let (mut line_no, mut line) =
        next_line()?.ok_or_else(|| GseaError::parse(path, 1, "empty expression file"))?;

    // GCT preamble
    let mut declared_dims: Option<(usize, usize)> = None;
    if line.trim_start().starts_with("#1.") {
        let (dim_no, dim_line) = next_line()?
            .ok_or_else(|| GseaError::parse(path, line_no + 1, "missing GCT dimension line"))?;
        let dims: Vec<&str> = dim_line.split_whitespace().collect();
        let parsed: Option<(usize, usize)> = match dims.as_slice() {
            [r, c, ..] => r.parse().ok().zip(c.parse().ok()),
            _ => None,
        };
        declared_dims = Some(parsed.ok_or_else(|| {
            GseaError::parse(path, dim_no, "GCT dimension line must be '<rows> <columns>'")
        })?);
        (line_no, line) =
            next_line()?.ok_or_else(|| GseaError::parse(path, dim_no + 1, "missing header"))?;
    }

    let header: Vec<&str> = line.split('\t').map(|s| s.trim_end_matches('\r')).collect();
    if header.len() < 2 {
        return Err(GseaError::parse(
            path,
            line_no,
            "header needs a gene column and at least one sample column",
        ));
    }
    let skip = if header.len() > 2 && is_description_column(header[1]) {
        2
    } else {
        1
    };
    let samples: Vec<String> = header[skip..].iter().map(|s| s.trim().to_string()).collect();
    if samples.is_empty() {
        return Err(GseaError::parse(path, line_no, "no sample columns in header"));
    }
    let n_cols = header.len();

    let mut genes: Vec<String> = Vec::new();
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut seen: FxHashMap<String, usize> = FxHashMap::default();

    while let Some((row_no, row_line)) = next_line()? {
        let cells: Vec<&str> = row_line
            .split('\t')
            .map(|s| s.trim_end_matches('\r'))
            .collect();
        if cells.len() != n_cols {
            return Err(GseaError::parse(
                path,
                row_no,
                format!("expected {} columns, found {}", n_cols, cells.len()),
            ));
        }
        let gene = cells[0].trim().to_string();
        if gene.is_empty() {
            return Err(GseaError::parse(path, row_no, "empty gene identifier"));
        }
        if let Some(first) = seen.insert(gene.clone(), row_no) {
            return Err(GseaError::parse(
                path,
                row_no,
                format!("gene '{}' already defined on line {}", gene, first),
            ));
        }

        let mut values = Vec::with_capacity(samples.len());
        for (col, cell) in cells[skip..].iter().enumerate() {
            let v: f64 = cell.trim().parse().map_err(|_| {
                GseaError::parse(
                    path,
                    row_no,
                    format!("non-numeric value '{}' in column '{}'", cell, samples[col]),
                )
            })?;
            if !v.is_finite() {
                return Err(GseaError::parse(
                    path,
                    row_no,
                    format!("non-finite value '{}' in column '{}'", cell, samples[col]),
                ));
            }
            values.push(v);
        }

        genes.push(gene);
        rows.push(values);
    }

    if genes.is_empty() {
        return Err(GseaError::parse(path, line_no + 1, "no expression rows"));
    }

    if let Some((n_rows, n_samples)) = declared_dims {
        if n_rows != genes.len() || n_samples != samples.len() {
            return Err(GseaError::parse(
                path,
                2,
                format!(
                    "GCT declares {}x{}, body has {}x{}",
                    n_rows,
                    n_samples,
                    genes.len(),
                    samples.len()
                ),
            ));
        }
    }

    ExpressionMatrix::from_rows(genes, samples, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(s: &str) -> Result<ExpressionMatrix> {
        parse_expression(Cursor::new(s), Path::new("test.gct"))
    }

    #[test]
    fn test_parse_plain_tsv_with_description() {
        let data = "NAME\tDescription\ts1\ts2\ts3\n\
                    G1\tna\t1.0\t2.0\t3.0\n\
                    G2\tna\t-1.5\t0\t4e-1\n";
        let mat = parse(data).unwrap();
        assert_eq!(mat.n_genes(), 2);
        assert_eq!(mat.n_samples(), 3);
        assert_eq!(mat.samples(), &["s1", "s2", "s3"]);
        assert_eq!(mat.row(1), vec![-1.5, 0.0, 0.4]);
        assert_eq!(mat.gene_index()["G2"], 1);
    }

    #[test]
    fn test_parse_gct() {
        let data = "#1.2\n2\t2\nNAME\tDescription\ta\tb\nG1\tx\t1\t2\nG2\ty\t3\t4\n";
        let mat = parse(data).unwrap();
        assert_eq!(mat.genes(), &["G1", "G2"]);
        assert_eq!(mat.get(1, 0), 3.0);
    }

    #[test]
    fn test_parse_without_description() {
        let mat = parse("gene\ta\tb\nG1\t1\t2\n").unwrap();
        assert_eq!(mat.n_samples(), 2);
        assert_eq!(mat.row(0), vec![1.0, 2.0]);
    }

    #[test]
    fn test_inconsistent_columns() {
        let err = parse("gene\ta\tb\nG1\t1\t2\nG2\t1\n").unwrap_err();
        match err {
            GseaError::Parse { line, msg, .. } => {
                assert_eq!(line, 3);
                assert!(msg.contains("expected 3 columns"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_non_numeric_value() {
        let err = parse("gene\ta\tb\nG1\t1\tfoo\n").unwrap_err();
        assert!(err.to_string().contains("non-numeric value 'foo' in column 'b'"));
    }

    #[test]
    fn test_duplicate_gene() {
        let err = parse("gene\ta\nG1\t1\nG1\t2\n").unwrap_err();
        assert!(err.to_string().contains("already defined"));
    }

    #[test]
    fn test_gct_dimension_mismatch() {
        let err = parse("#1.2\n3\t2\nNAME\tDescription\ta\tb\nG1\tx\t1\t2\n").unwrap_err();
        assert!(err.to_string().contains("GCT declares 3x2"));
    }

    #[test]
    fn test_validate_phenotypes() {
        let mat = parse("gene\ta\tb\nG1\t1\t2\n").unwrap();
        let ok = PhenotypeAssignment::new(vec!["x".into(), "y".into()], None).unwrap();
        let bad = PhenotypeAssignment::new(vec!["x".into(), "y".into(), "y".into()], None).unwrap();
        assert!(mat.validate_phenotypes(&ok).is_ok());
        assert!(matches!(
            mat.validate_phenotypes(&bad),
            Err(GseaError::Data(_))
        ));
    }
}
