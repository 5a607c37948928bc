//! File input and CSV output at the pipeline boundary.
//!
//! Constraint trees, gene-tree files (newick lines or a nexus trees
//! block) and networks all arrive as text; paths ending in `.gz` are
//! decompressed transparently. BEAST-style `[&…]` annotations are
//! stripped before parsing, and a nexus TRANSLATE block, when present,
//! maps numeric tip ids back to taxon labels.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use phylotree::tree::Tree as PhyloTree;

use crate::errors::{CamusError, Result};
use crate::infer::NetworkRow;
use crate::support::SupportTable;

/// Gene-tree file layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneTreeFormat {
    /// One newick tree per non-empty line.
    Newick,
    /// A nexus file with named trees and an optional TRANSLATE block.
    Nexus,
}

/// Reads a whole file, gunzipping when the path ends in `.gz`.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    let mut raw = File::open(path)?;
    let mut content = String::new();
    if path.to_string_lossy().ends_with(".gz") {
        GzDecoder::new(raw).read_to_string(&mut content)?;
    } else {
        raw.read_to_string(&mut content)?;
    }
    Ok(content)
}

/// Reads the single rooted constraint tree.
///
/// Trailing whitespace is ignored; anything other than exactly one
/// `;`-terminated tree is an [`CamusError::InvalidFile`].
pub fn read_constraint_tree<P: AsRef<Path>>(path: P) -> Result<PhyloTree> {
    let newick = read_single_tree(path)?;
    PhyloTree::from_newick(&newick)
        .map_err(|e| CamusError::InvalidFormat(format!("constraint tree: {e}")))
}

/// Reads one `;`-terminated statement (constraint tree or network).
pub fn read_single_tree<P: AsRef<Path>>(path: P) -> Result<String> {
    let content = read_file(path)?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(CamusError::InvalidFile("file contains no tree".into()));
    }
    if trimmed.matches(';').count() != 1 || !trimmed.ends_with(';') {
        return Err(CamusError::InvalidFile(
            "expected exactly one ';'-terminated tree".into(),
        ));
    }
    Ok(strip_annotations(trimmed))
}

/// Reads the gene-tree multiset.
pub fn read_gene_trees<P: AsRef<Path>>(path: P, format: GeneTreeFormat) -> Result<Vec<PhyloTree>> {
    let content = read_file(path)?;
    let trees = match format {
        GeneTreeFormat::Newick => parse_newick_lines(&content)?,
        GeneTreeFormat::Nexus => parse_nexus_trees(&content)?,
    };
    if trees.is_empty() {
        return Err(CamusError::InvalidFile("no gene trees found".into()));
    }
    Ok(trees)
}

fn parse_newick_lines(content: &str) -> Result<Vec<PhyloTree>> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(idx, line)| {
            PhyloTree::from_newick(&strip_annotations(line)).map_err(|e| {
                CamusError::InvalidFormat(format!("gene tree on line {}: {e}", idx + 1))
            })
        })
        .collect()
}

/// Scans the TREES block of a nexus file: an optional TRANSLATE table
/// followed by `TREE <name> = <newick>` statements.
fn parse_nexus_trees(content: &str) -> Result<Vec<PhyloTree>> {
    let translate = parse_translate_block(content);
    content
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.to_ascii_uppercase().starts_with("TREE "))
        .take_while(|line| !line.to_ascii_uppercase().starts_with("END;"))
        .filter_map(|line| line.splitn(2, '=').nth(1))
        .map(|body| {
            let mut tree = PhyloTree::from_newick(&strip_annotations(body.trim()))
                .map_err(|e| CamusError::InvalidFormat(format!("nexus tree: {e}")))?;
            if !translate.is_empty() {
                rename_tips(&mut tree, &translate)?;
            }
            Ok(tree)
        })
        .collect()
}

/// Collects the TRANSLATE block, where each entry maps a numeric tip id
/// to a quoted taxon label:
/// ```text
/// TRANSLATE
///     1 'first_taxon',
///     2 'second_taxon',
///     ;
/// ```
fn parse_translate_block(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut in_block = false;
    for line in content.lines().map(str::trim) {
        if !in_block {
            in_block = line.to_ascii_uppercase().starts_with("TRANSLATE");
            continue;
        }
        if line.starts_with(';') {
            break;
        }
        let mut fields = line.trim_end_matches(',').split_whitespace();
        if let (Some(id), Some(label)) = (fields.next(), fields.next()) {
            map.insert(id.to_string(), label.trim_matches('\'').to_string());
        }
    }
    map
}

fn rename_tips(tree: &mut PhyloTree, translate: &HashMap<String, String>) -> Result<()> {
    for leaf_id in tree.get_leaves() {
        let node = tree.get_mut(&leaf_id)?;
        if let Some(label) = node.name.as_ref().and_then(|n| translate.get(n)) {
            node.name = Some(label.clone());
        }
    }
    Ok(())
}

/// Strips BEAST-style `[&…]` comment annotations, keeping everything else.
///
/// Plain `[…]` comments without the `&` marker are left alone. An
/// unterminated annotation swallows the rest of the line.
fn strip_annotations(newick: &str) -> String {
    let mut out = String::with_capacity(newick.len());
    let mut rest = newick;
    while let Some(start) = rest.find("[&") {
        out.push_str(&rest[..start]);
        match rest[start..].find(']') {
            Some(close) => rest = &rest[start + close + 1..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Writes the `infer` result table; newick fields force quoting, so this
/// goes through a real CSV writer.
pub fn write_results_csv<W: Write>(out: W, rows: &[NetworkRow]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer
        .write_record(["Number of Branches", "Quartet Satisfied Percent", "Extended Newick"])
        .map_err(csv_error)?;
    for row in rows {
        writer
            .write_record([
                row.n_reticulations.to_string(),
                format!("{:.4}", row.satisfied_percent()),
                row.newick.clone(),
            ])
            .map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the `score` support table: one row per gene, one column per
/// reticulation label.
pub fn write_support_csv<W: Write>(out: W, table: &SupportTable) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    let mut header = vec!["Gene".to_string()];
    header.extend(table.labels.iter().cloned());
    writer.write_record(&header).map_err(csv_error)?;
    for (idx, row) in table.rows.iter().enumerate() {
        let mut record = vec![format!("gene_{idx}")];
        record.extend(row.iter().map(|v| format!("{v}")));
        writer.write_record(&record).map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

fn csv_error(err: csv::Error) -> CamusError {
    CamusError::InvalidFile(format!("csv output: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_beast_annotations() {
        let input = "(A:[&rate=0.12]1.0,(B:[&rate=0.3]2.0,C:1.0));";
        assert_eq!(strip_annotations(input), "(A:1.0,(B:2.0,C:1.0));");
        // plain bracket comments without '&' are untouched
        assert_eq!(strip_annotations("(A,B)[x];"), "(A,B)[x];");
    }

    #[test]
    fn newick_lines_parse_per_line() {
        let trees = parse_newick_lines("(A,(B,C));\n\n((A,B),C);\n").unwrap();
        assert_eq!(trees.len(), 2);
        assert!(parse_newick_lines("(A,(B,C);\n").is_err());
    }

    #[test]
    fn nexus_trees_with_translate() {
        let content = "#NEXUS\nBegin trees;\n\tTranslate\n\t\t1 'Alpha',\n\t\t2 'Beta',\n\t\t3 'Gamma'\n\t\t;\nTREE one = (1,(2,3));\nTREE two = ((1,2),3);\nEND;\n";
        let trees = parse_nexus_trees(content).unwrap();
        assert_eq!(trees.len(), 2);
        let names: Vec<String> = trees[0]
            .get_leaves()
            .iter()
            .filter_map(|id| trees[0].get(id).unwrap().name.clone())
            .collect();
        assert!(names.contains(&"Alpha".to_string()));
        assert!(names.contains(&"Gamma".to_string()));
    }

    #[test]
    fn results_csv_quotes_newick() {
        let rows = vec![NetworkRow {
            n_reticulations: 0,
            satisfied_weight: 1,
            total_weight: 2,
            newick: "(A,(B,C));".to_string(),
            branches: Vec::new(),
        }];
        let mut buf = Vec::new();
        write_results_csv(&mut buf, &rows).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("Number of Branches,Quartet Satisfied Percent,Extended Newick"));
        assert!(text.contains("0,50.0000,\"(A,(B,C));\""));
    }

    #[test]
    fn support_csv_layout() {
        let table = SupportTable {
            labels: vec!["#H0".into(), "#H1".into()],
            rows: vec![vec![1.0, f64::NAN]],
        };
        let mut buf = Vec::new();
        write_support_csv(&mut buf, &table).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("Gene,#H0,#H1"));
        assert!(text.contains("gene_0,1,NaN"));
    }
}
