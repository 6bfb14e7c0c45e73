use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{GseaError, Result};

////////////////
// Structures //
////////////////

/// Phenotype assignment of the samples
///
/// ### Fields
///
/// * `labels` - One label per sample column, in column order.
/// * `classes` - The two class names. The first one is the positive
///   phenotype (numerator of the ranking metrics).
#[derive(Clone, Debug, PartialEq)]
pub struct PhenotypeAssignment {
    labels: Vec<String>,
    classes: [String; 2],
}

impl PhenotypeAssignment {
    /// Generate a new phenotype assignment
    ///
    /// ### Params
    ///
    /// * `labels` - The sample labels.
    /// * `classes` - Optional class order. If `None`, the order of first
    ///   appearance in `labels` is used.
    ///
    /// ### Returns
    ///
    /// The assignment or a `Data` error if the labels do not contain exactly
    /// two distinct values or do not match the declared classes.
    pub fn new(labels: Vec<String>, classes: Option<[String; 2]>) -> Result<Self> {
        let seen = crate::utils::general::unique(&labels);
        if seen.len() != 2 {
            return Err(GseaError::Data(format!(
                "phenotype labels need exactly two distinct values, found {}: {:?}",
                seen.len(),
                seen
            )));
        }
        let classes = match classes {
            Some(c) => {
                if c[0] == c[1] {
                    return Err(GseaError::Data(format!(
                        "phenotype classes must differ, got '{}' twice",
                        c[0]
                    )));
                }
                if let Some(bad) = seen.iter().find(|l| **l != c[0] && **l != c[1]) {
                    return Err(GseaError::Data(format!(
                        "label '{}' is not one of the declared classes '{}' / '{}'",
                        bad, c[0], c[1]
                    )));
                }
                c
            }
            None => [seen[0].clone(), seen[1].clone()],
        };

        Ok(Self { labels, classes })
    }

    /// The per sample labels
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// The positive (first) and negative (second) phenotype names
    pub fn classes(&self) -> (&str, &str) {
        (&self.classes[0], &self.classes[1])
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Boolean mask with `true` for samples of the positive phenotype
    pub fn positive_mask(&self) -> Vec<bool> {
        self.labels.iter().map(|l| *l == self.classes[0]).collect()
    }
}

/////////////
// Parsing //
/////////////

/// Read a CLS phenotype file
///
/// ### Params
///
/// * `path` - Path to the .cls file
///
/// ### Returns
///
/// The `PhenotypeAssignment`
pub fn read_cls<P: AsRef<Path>>(path: P) -> Result<PhenotypeAssignment> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| GseaError::io(path, e))?;
    parse_cls(BufReader::new(file), path)
}

/// Parse a CLS phenotype file from any buffered reader
///
/// Expected layout (tokens separated by tabs or spaces):
///
/// ```text
/// 48 2 1
/// # ALL AML
/// ALL ALL ... AML AML
/// ```
///
/// The second line is optional; without it the classes are taken in the
/// order of their first appearance.
///
/// ### Params
///
/// * `reader` - The buffered reader
/// * `path` - Path used in error messages
///
/// ### Returns
///
/// The `PhenotypeAssignment`
pub fn parse_cls<R: BufRead>(reader: R, path: &Path) -> Result<PhenotypeAssignment> {
    let mut lines: Vec<(usize, String)> = Vec::with_capacity(3);
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| GseaError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        lines.push((i + 1, line));
    }

    let (header_no, header) = lines
        .first()
        .ok_or_else(|| GseaError::parse(path, 1, "empty phenotype file"))?;
    let dims: Vec<&str> = header.split_whitespace().collect();
    if dims.len() < 2 {
        return Err(GseaError::parse(
            path,
            *header_no,
            "header must be '<n_samples> <n_classes> 1'",
        ));
    }
    let n_samples: usize = dims[0].parse().map_err(|_| {
        GseaError::parse(path, *header_no, format!("invalid sample count '{}'", dims[0]))
    })?;
    let n_classes: usize = dims[1].parse().map_err(|_| {
        GseaError::parse(path, *header_no, format!("invalid class count '{}'", dims[1]))
    })?;
    if n_classes != 2 {
        return Err(GseaError::parse(
            path,
            *header_no,
            format!("expected exactly 2 classes, header declares {}", n_classes),
        ));
    }

    let mut declared: Option<[String; 2]> = None;
    let mut label_line = None;
    for (line_no, line) in lines.iter().skip(1) {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix('#') {
            let names: Vec<&str> = rest.split_whitespace().collect();
            if names.len() != 2 {
                return Err(GseaError::parse(
                    path,
                    *line_no,
                    format!("expected 2 class names, found {}", names.len()),
                ));
            }
            declared = Some([names[0].to_string(), names[1].to_string()]);
        } else if label_line.is_none() {
            label_line = Some((*line_no, line));
        } else {
            return Err(GseaError::parse(
                path,
                *line_no,
                "unexpected extra line after the sample labels",
            ));
        }
    }

    let (labels_no, labels_str) =
        label_line.ok_or_else(|| GseaError::parse(path, lines.len() + 1, "missing label line"))?;
    let mut labels: Vec<String> = labels_str.split_whitespace().map(String::from).collect();

    // numeric labels index into the declared class names
    if let Some(classes) = &declared {
        let is_name = |l: &String| *l == classes[0] || *l == classes[1];
        if !labels.iter().any(is_name) {
            let indices: Option<Vec<usize>> = labels.iter().map(|l| l.parse().ok()).collect();
            if let Some(indices) = indices.filter(|idx| idx.iter().all(|&i| i < 2)) {
                labels = indices.into_iter().map(|i| classes[i].clone()).collect();
            }
        }
    }

    if labels.len() != n_samples {
        return Err(GseaError::parse(
            path,
            labels_no,
            format!(
                "label count ({}) does not match the declared sample count ({})",
                labels.len(),
                n_samples
            ),
        ));
    }

    PhenotypeAssignment::new(labels, declared).map_err(|e| match e {
        GseaError::Data(msg) => GseaError::parse(path, labels_no, msg),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(s: &str) -> Result<PhenotypeAssignment> {
        parse_cls(Cursor::new(s), Path::new("test.cls"))
    }

    #[test]
    fn test_parse_cls_with_declared_classes() {
        let pheno = parse("6 2 1\n# ALL AML\nALL ALL AML ALL AML AML\n").unwrap();
        assert_eq!(pheno.len(), 6);
        assert_eq!(pheno.classes(), ("ALL", "AML"));
        assert_eq!(
            pheno.positive_mask(),
            vec![true, true, false, true, false, false]
        );
    }

    #[test]
    fn test_parse_cls_tabs_and_declared_order() {
        // declared order wins over first appearance
        let pheno = parse("4\t2\t1\n#\tAML\tALL\nALL\tAML\tALL\tAML\n").unwrap();
        assert_eq!(pheno.classes(), ("AML", "ALL"));
        assert_eq!(pheno.positive_mask(), vec![false, true, false, true]);
    }

    #[test]
    fn test_parse_cls_numeric_labels() {
        let pheno = parse("4 2 1\n# ALL AML\n0 0 1 1\n").unwrap();
        assert_eq!(pheno.labels(), &["ALL", "ALL", "AML", "AML"]);
        assert_eq!(pheno.classes(), ("ALL", "AML"));
    }

    #[test]
    fn test_parse_cls_without_class_line() {
        let pheno = parse("3 2 1\nB A A\n").unwrap();
        assert_eq!(pheno.classes(), ("B", "A"));
    }

    #[test]
    fn test_parse_cls_three_labels_fails() {
        let err = parse("3 2 1\n# A B\nA B C\n").unwrap_err();
        assert!(matches!(err, GseaError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_parse_cls_undeclared_label_fails() {
        let err = parse("4 2 1\n# A B\nA C A C\n").unwrap_err();
        assert!(matches!(err, GseaError::Parse { line: 3, .. }));
        assert!(err.to_string().contains("label 'C'"));
    }

    #[test]
    fn test_parse_cls_single_label_fails() {
        let err = parse("3 2 1\nA A A\n").unwrap_err();
        assert!(matches!(err, GseaError::Parse { .. }));
        assert!(err.to_string().contains("exactly two"));
    }

    #[test]
    fn test_parse_cls_count_mismatch() {
        let err = parse("5 2 1\n# A B\nA B A B\n").unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_parse_cls_bad_header() {
        assert!(parse("x 2 1\n# A B\nA B\n").is_err());
        assert!(parse("").is_err());
    }
}
