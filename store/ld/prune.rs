// ========================================================================================
//
//                                  LD PRUNING
//
// ========================================================================================
//
// ### Purpose ###
//
// Reduces a list of associated variants to a set of roughly independent ones. The
// variants are visited from the strongest association to the weakest. A variant is
// kept unless an earlier variant already marked it, and every visited variant marks
// the partners it has stored at or above the r2 threshold.
//
// A visited variant marks its partners whether or not it was kept itself, so a chain
// of partners is suppressed behind the first variant of the chain.

use crate::error::{LdError, Result};
use crate::ld::reader::LdMatrixReader;
use ahash::AHashSet;
use rayon::prelude::*;

/// Walks `ordered_ids` (most significant first) and returns the positions of the
/// variants that survive pruning, in visiting order.
///
/// Variants that the matrix does not know, or that have no stored row, cannot mark
/// anything but are still kept when nothing marked them.
pub fn prune<S: AsRef<str>>(
    ordered_ids: &[S],
    reader: &LdMatrixReader,
    min_r2: f64,
) -> Result<Vec<usize>> {
    check_threshold(min_r2)?;

    let mut inspected: AHashSet<String> = AHashSet::with_capacity(ordered_ids.len());
    let mut kept = Vec::new();
    for (position, id) in ordered_ids.iter().enumerate() {
        let id = id.as_ref();
        if inspected.insert(id.to_string()) {
            kept.push(position);
        }
        if let Some(partners) = reader.lookup_r2(id)? {
            inspected.extend(
                partners
                    .into_iter()
                    .filter(|(_, r2)| f64::from(*r2) >= min_r2)
                    .map(|(partner, _)| partner),
            );
        }
    }
    Ok(kept)
}

/// Prunes independent groups of variants (one per phenotype, say) against the same
/// matrix in parallel. The first error aborts the whole batch.
pub fn prune_groups<S: AsRef<str> + Sync>(
    groups: &[Vec<S>],
    reader: &LdMatrixReader,
    min_r2: f64,
) -> Result<Vec<Vec<usize>>> {
    check_threshold(min_r2)?;
    groups
        .par_iter()
        .map(|ids| prune(ids, reader, min_r2))
        .collect()
}

fn check_threshold(min_r2: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&min_r2) {
        return Err(LdError::InvalidArgument(format!(
            "Pruning r2 threshold must be within [0, 1], got {min_r2}."
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ld::writer::LdMatrixWriter;
    use crate::variant_index::VariantIndex;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// a: b 0.5, c 0.25. b: f 0.9. c: d 0.9. e and f have no row.
    fn write_matrix(path: &Path) {
        let index = Arc::new(VariantIndex::from_ids(["a", "b", "c", "d", "e", "f"]).unwrap());
        let writer = LdMatrixWriter::open(index, path, 6).unwrap();
        writer.add_variant(0, &[1, 2], &[0.5, 0.25]).unwrap();
        writer.add_variant(1, &[5], &[0.9]).unwrap();
        writer.add_variant(2, &[3], &[0.9]).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn partners_at_the_threshold_are_suppressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prune.tld");
        write_matrix(&path);
        let reader = LdMatrixReader::open(&path).unwrap();

        // b sits exactly at 0.5 and goes; c at 0.25 stays and then suppresses d.
        let order = ["a", "b", "c", "d", "e", "DUMMY"];
        let kept = prune(&order, &reader, 0.5).unwrap();
        let kept: Vec<&str> = kept.into_iter().map(|position| order[position]).collect();
        assert_eq!(kept, vec!["a", "c", "e", "DUMMY"]);
    }

    #[test]
    fn suppressed_variants_still_mark_their_partners() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prune.tld");
        write_matrix(&path);
        let reader = LdMatrixReader::open(&path).unwrap();

        assert_eq!(prune(&["a", "b", "f"], &reader, 0.5).unwrap(), vec![0]);
        // Walking in the other direction keeps the row-less variant first.
        assert_eq!(prune(&["f", "b", "a"], &reader, 0.5).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn groups_are_pruned_independently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prune.tld");
        write_matrix(&path);
        let reader = LdMatrixReader::open(&path).unwrap();

        let groups = vec![vec!["a", "b"], vec!["b", "a"], vec![]];
        let kept = prune_groups(&groups, &reader, 0.1).unwrap();
        assert_eq!(kept, vec![vec![0], vec![0, 1], vec![]]);
        assert!(matches!(
            prune_groups(&groups, &reader, 1.5),
            Err(LdError::InvalidArgument(_))
        ));
    }
}
