// ========================================================================================
//
//                              TEXT INPUT HELPERS
//
// ========================================================================================
//
// Line-oriented readers for the tab-separated inputs of the command line tool. Every
// reader accepts plain text or gzip (detected from the first two bytes, not from the
// extension). Blank lines and lines starting with '#' are skipped.

use crate::error::{LdError, Result};
use crate::ld::VariantDosages;
use ahash::AHashMap;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::collections::BTreeMap;
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Opens `path` for line reading, decompressing on the fly if it is gzip.
pub fn open_text(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let mut reader = BufReader::new(File::open(path)?);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    if is_gzip {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// Calls `visit` with the 1-based line number and the tab-separated fields of every
/// data line.
fn for_each_record<F>(path: &Path, mut visit: F) -> Result<()>
where
    F: FnMut(usize, &[&str]) -> Result<()>,
{
    let mut reader = open_text(path)?;
    let mut line = String::new();
    let mut line_number = 0usize;
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        line_number += 1;
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.trim().is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split('\t').map(str::trim).collect();
        visit(line_number, &fields)?;
    }
}

fn malformed(path: &Path, line_number: usize, message: &str) -> LdError {
    LdError::InvalidArgument(format!("{}:{line_number}: {message}", path.display()))
}

/// Reads one variant id per line (the first field of each line).
pub fn read_variant_list(path: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for_each_record(path, |_, fields| {
        ids.push(fields[0].to_string());
        Ok(())
    })?;
    Ok(ids)
}

/// Reads a headerless `variantA  variantB  r2` table and groups the pairs by A, in
/// the order each A first appears. Pairs with `r2 <= min_r2` are dropped.
pub fn read_pair_table(path: &Path, min_r2: f64) -> Result<Vec<(String, Vec<(String, f32)>)>> {
    let mut rows: Vec<(String, Vec<(String, f32)>)> = Vec::new();
    let mut row_of: AHashMap<String, usize> = AHashMap::new();
    let mut dropped = 0usize;

    for_each_record(path, |line_number, fields| {
        let [a, b, r2] = fields else {
            return Err(malformed(path, line_number, "expected 3 tab-separated fields"));
        };
        let r2: f32 = r2
            .parse()
            .map_err(|_| malformed(path, line_number, &format!("invalid r2 value '{r2}'")))?;
        if !(f64::from(r2) > min_r2) {
            dropped += 1;
            return Ok(());
        }
        let slot = match row_of.get(*a) {
            Some(slot) => *slot,
            None => {
                row_of.insert(a.to_string(), rows.len());
                rows.push((a.to_string(), Vec::new()));
                rows.len() - 1
            }
        };
        rows[slot].1.push((b.to_string(), r2));
        Ok(())
    })?;

    if dropped > 0 {
        log::info!("Dropped {dropped} pairs at or below r2 {min_r2}");
    }
    Ok(rows)
}

/// Reads `id  position  value...` rows. `NA`, `nan` and `.` are missing values.
pub fn read_dosages(path: &Path) -> Result<Vec<VariantDosages>> {
    let mut variants = Vec::new();
    for_each_record(path, |line_number, fields| {
        if fields.len() < 3 {
            return Err(malformed(
                path,
                line_number,
                "expected an id, a position and at least one value",
            ));
        }
        let position = fields[1].parse::<u64>().map_err(|_| {
            malformed(path, line_number, &format!("invalid position '{}'", fields[1]))
        })?;
        let values = fields[2..]
            .iter()
            .map(|field| parse_value(field))
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| malformed(path, line_number, "invalid dosage value"))?;
        variants.push(VariantDosages {
            id: fields[0].to_string(),
            position,
            values,
        });
        Ok(())
    })?;
    Ok(variants)
}

/// Names of the columns a results table is read through.
#[derive(Debug, Clone, Copy)]
pub struct ResultColumns<'a> {
    pub id: &'a str,
    pub p: &'a str,
    pub contig: Option<&'a str>,
    pub pheno: Option<&'a str>,
}

/// One retained line of a results table.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultLine {
    pub id: String,
    pub p: f64,
    pub line: String,
}

/// Lines sharing a contig and a phenotype, sorted by ascending p-value (ties by id).
#[derive(Debug, Clone, PartialEq)]
pub struct ResultGroup {
    pub contig: Option<String>,
    pub pheno: Option<String>,
    pub lines: Vec<ResultLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    pub header: String,
    pub groups: Vec<ResultGroup>,
}

/// Reads a tab-separated results table whose first line names the columns. Lines
/// with `p > max_p` are dropped, the rest are grouped by contig and phenotype (each
/// only when its column is given). Groups come out sorted by contig, then phenotype.
pub fn read_results(path: &Path, columns: ResultColumns<'_>, max_p: f64) -> Result<ResultTable> {
    struct Layout {
        id: usize,
        p: usize,
        contig: Option<usize>,
        pheno: Option<usize>,
    }

    let mut header: Option<(String, Layout)> = None;
    let mut groups: BTreeMap<(Option<String>, Option<String>), Vec<ResultLine>> = BTreeMap::new();
    let mut dropped = 0usize;

    for_each_record(path, |line_number, fields| {
        let Some((_, layout)) = &header else {
            let find = |name: &str| {
                fields.iter().position(|field| *field == name).ok_or_else(|| {
                    malformed(path, line_number, &format!("column '{name}' not found in the header"))
                })
            };
            let layout = Layout {
                id: find(columns.id)?,
                p: find(columns.p)?,
                contig: columns.contig.map(find).transpose()?,
                pheno: columns.pheno.map(find).transpose()?,
            };
            header = Some((fields.join("\t"), layout));
            return Ok(());
        };

        let field = |column: usize| {
            fields.get(column).copied().ok_or_else(|| {
                malformed(path, line_number, &format!("expected at least {} fields", column + 1))
            })
        };
        let raw_p = field(layout.p)?;
        let p: f64 = raw_p
            .parse()
            .map_err(|_| malformed(path, line_number, &format!("invalid p-value '{raw_p}'")))?;
        if !(p <= max_p) {
            dropped += 1;
            return Ok(());
        }

        let key = (
            layout.contig.map(field).transpose()?.map(str::to_string),
            layout.pheno.map(field).transpose()?.map(str::to_string),
        );
        groups.entry(key).or_default().push(ResultLine {
            id: field(layout.id)?.to_string(),
            p,
            line: fields.join("\t"),
        });
        Ok(())
    })?;

    let Some((header, _)) = header else {
        return Err(malformed(path, 0, "missing header line"));
    };
    if dropped > 0 {
        log::info!("Dropped {dropped} results above p {max_p}");
    }

    let groups = groups
        .into_iter()
        .map(|((contig, pheno), mut lines)| {
            lines.sort_by(|a, b| a.p.total_cmp(&b.p).then_with(|| a.id.cmp(&b.id)));
            ResultGroup {
                contig,
                pheno,
                lines,
            }
        })
        .collect();
    Ok(ResultTable { header, groups })
}

fn parse_value(field: &str) -> Option<f64> {
    match field {
        "NA" | "." => Some(f64::NAN),
        _ if field.eq_ignore_ascii_case("nan") => Some(f64::NAN),
        _ => field.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn gzip_is_detected_from_content() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("ids.txt");
        std::fs::write(&plain, "rs1\n# comment\n\nrs2\textra\n").unwrap();

        let gzipped = dir.path().join("ids.txt.data");
        let mut encoder = GzEncoder::new(File::create(&gzipped).unwrap(), Compression::fast());
        encoder.write_all(b"rs1\nrs2\n").unwrap();
        encoder.finish().unwrap();

        assert_eq!(read_variant_list(&plain).unwrap(), vec!["rs1", "rs2"]);
        assert_eq!(read_variant_list(&gzipped).unwrap(), vec!["rs1", "rs2"]);
    }

    #[test]
    fn pairs_are_grouped_by_first_variant() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairs.tsv");
        std::fs::write(
            &path,
            "b\ta\t0.5\na\tb\t0.5\nb\tc\t0.0000001\na\tc\t0.25\n",
        )
        .unwrap();

        let rows = read_pair_table(&path, 1e-6).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "b");
        assert_eq!(rows[0].1, vec![("a".to_string(), 0.5)]);
        assert_eq!(rows[1].1.len(), 2);
    }

    #[test]
    fn malformed_lines_name_their_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pairs.tsv");
        std::fs::write(&path, "a\tb\t0.5\na\tb\n").unwrap();
        let err = read_pair_table(&path, 1e-6).unwrap_err();
        assert!(err.to_string().contains(":2:"), "{err}");
    }

    #[test]
    fn dosages_accept_missing_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dosages.tsv");
        std::fs::write(&path, "v1\t100\t0\t1\tNA\nv2\t200\t0.5\tnan\t.\n").unwrap();

        let variants = read_dosages(&path).unwrap();
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].position, 100);
        assert!(variants[0].values[2].is_nan());
        assert!(variants[1].values[1].is_nan() && variants[1].values[2].is_nan());

        std::fs::write(&path, "v1\tabc\t0\n").unwrap();
        assert!(matches!(read_dosages(&path), Err(LdError::InvalidArgument(_))));
    }

    #[test]
    fn results_are_filtered_grouped_and_sorted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.tsv");
        std::fs::write(
            &path,
            "contig\tvariantId\tpheno\tp\n\
             2\trs5\tbmi\t1e-9\n\
             1\trs2\tbmi\t1e-7\n\
             1\trs1\tbmi\t1e-8\n\
             1\trs3\tbmi\t0.5\n\
             1\trs4\theight\t1e-7\n\
             1\trs0\tbmi\t1e-7\n",
        )
        .unwrap();

        let columns = ResultColumns {
            id: "variantId",
            p: "p",
            contig: Some("contig"),
            pheno: Some("pheno"),
        };
        let table = read_results(&path, columns, 1e-6).unwrap();
        assert_eq!(table.header, "contig\tvariantId\tpheno\tp");

        let keys: Vec<(Option<&str>, Option<&str>)> = table
            .groups
            .iter()
            .map(|group| (group.contig.as_deref(), group.pheno.as_deref()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (Some("1"), Some("bmi")),
                (Some("1"), Some("height")),
                (Some("2"), Some("bmi")),
            ]
        );
        let ids: Vec<&str> = table.groups[0].lines.iter().map(|line| line.id.as_str()).collect();
        assert_eq!(ids, vec!["rs1", "rs0", "rs2"]);
        assert_eq!(table.groups[0].lines[0].line, "1\trs1\tbmi\t1e-8");

        let ungrouped = ResultColumns {
            contig: None,
            pheno: None,
            ..columns
        };
        let table = read_results(&path, ungrouped, 1e-6).unwrap();
        assert_eq!(table.groups.len(), 1);
        assert_eq!(table.groups[0].lines.len(), 5);
    }

    #[test]
    fn results_need_their_columns_and_numeric_p_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("results.tsv");
        let columns = ResultColumns {
            id: "variantId",
            p: "p",
            contig: None,
            pheno: None,
        };

        std::fs::write(&path, "variantId\tpval\nrs1\t0.1\n").unwrap();
        let err = read_results(&path, columns, 1.0).unwrap_err();
        assert!(err.to_string().contains("'p'"), "{err}");

        std::fs::write(&path, "variantId\tp\nrs1\tlow\n").unwrap();
        let err = read_results(&path, columns, 1.0).unwrap_err();
        assert!(err.to_string().contains(":2:"), "{err}");

        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            read_results(&path, columns, 1.0),
            Err(LdError::InvalidArgument(_))
        ));
    }
}
