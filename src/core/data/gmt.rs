use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{GseaError, Result};
use crate::utils::general::unique;

////////////////
// Structures //
////////////////

/// A single gene set
///
/// ### Fields
///
/// * `name` - The (unique) name of the gene set.
/// * `description` - Free text description, usually an URL.
/// * `genes` - The member genes, de-duplicated, in file order.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneSet {
    pub name: String,
    pub description: String,
    pub genes: Vec<String>,
}

impl GeneSet {
    /// Generate a new gene set; duplicated genes are dropped
    pub fn new(name: impl Into<String>, description: impl Into<String>, genes: &[String]) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            genes: unique(genes),
        }
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }
}

/// Ordered collection of gene sets with lookup by name
#[derive(Clone, Debug, Default)]
pub struct GeneSetLibrary {
    sets: Vec<GeneSet>,
    index: FxHashMap<String, usize>,
}

impl GeneSetLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a gene set to the library
    ///
    /// ### Returns
    ///
    /// `Data` error if the name is already taken or the set has no genes.
    pub fn insert(&mut self, gene_set: GeneSet) -> Result<()> {
        if gene_set.is_empty() {
            return Err(GseaError::Data(format!(
                "gene set '{}' has no genes",
                gene_set.name
            )));
        }
        if self.index.contains_key(&gene_set.name) {
            return Err(GseaError::Data(format!(
                "duplicated gene set name '{}'",
                gene_set.name
            )));
        }
        self.index.insert(gene_set.name.clone(), self.sets.len());
        self.sets.push(gene_set);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&GeneSet> {
        self.index.get(name).map(|&i| &self.sets[i])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GeneSet> {
        self.sets.iter()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Name to genes mapping, mostly useful for comparisons
    pub fn to_map(&self) -> FxHashMap<&str, &[String]> {
        self.sets
            .iter()
            .map(|gs| (gs.name.as_str(), gs.genes.as_slice()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a GeneSetLibrary {
    type Item = &'a GeneSet;
    type IntoIter = std::slice::Iter<'a, GeneSet>;

    fn into_iter(self) -> Self::IntoIter {
        self.sets.iter()
    }
}

/////////////
// Parsing //
/////////////

/// Read a GMT gene set library
///
/// ### Params
///
/// * `path` - Path to the .gmt file
///
/// ### Returns
///
/// The `GeneSetLibrary`
pub fn read_gmt<P: AsRef<Path>>(path: P) -> Result<GeneSetLibrary> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| GseaError::io(path, e))?;
    parse_gmt(BufReader::new(file), path)
}

/// Parse a GMT library from any buffered reader
///
/// One gene set per line: `name<TAB>description<TAB>gene1<TAB>gene2...`.
/// Empty gene cells are ignored, blank lines skipped.
///
/// ### Params
///
/// * `reader` - The buffered reader
/// * `path` - Path used in error messages
///
/// ### Returns
///
/// The `GeneSetLibrary`
pub fn parse_gmt<R: BufRead>(reader: R, path: &Path) -> Result<GeneSetLibrary> {
    let mut library = GeneSetLibrary::new();

    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        let line = line.map_err(|e| GseaError::io(path, e))?;
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if line.trim().is_empty() {
            continue;
        }

        let mut fields = line.split('\t');
        let name = fields.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(GseaError::parse(path, line_no, "missing gene set name"));
        }
        let description = fields.next().unwrap_or_default().trim();
        let genes: Vec<String> = fields
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(String::from)
            .collect();

        library
            .insert(GeneSet::new(name, description, &genes))
            .map_err(|e| match e {
                GseaError::Data(msg) => GseaError::parse(path, line_no, msg),
                other => other,
            })?;
    }

    Ok(library)
}

/// Write a library in GMT format
///
/// ### Params
///
/// * `library` - The library to serialise
/// * `writer` - Destination
pub fn write_gmt<W: Write>(library: &GeneSetLibrary, writer: W) -> std::io::Result<()> {
    let mut w = BufWriter::new(writer);
    for gs in library {
        write!(w, "{}\t{}", gs.name, gs.description)?;
        for gene in &gs.genes {
            write!(w, "\t{}", gene)?;
        }
        writeln!(w)?;
    }
    w.flush()
}
