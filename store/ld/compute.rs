// ========================================================================================
//
//                       THE LD COMPUTATION COLLABORATOR
//
// ========================================================================================
//
// ### Purpose ###
//
// Produces the rows the matrix writer persists. Input is a position-sorted slice of
// variants, each carrying one allele probability per parent (NaN when missing). For
// every variant A, every other variant B within `max_distance` bp is paired with it and
// kept when its r2 is strictly above `min_r2`.
//
// ### Cancellation ###
//
// Workers share a `CancellationToken` passed to them explicitly. The first worker to
// fail cancels it, as does the optional wall-clock timeout, and the remaining workers
// stop at the next variant. A cancelled run reports the first real error if there was
// one, `Cancelled` otherwise.

use crate::config::StoreConfig;
use crate::error::{LdError, Result};
use crate::ld::writer::LdMatrixWriter;
use ahash::AHashSet;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rayon::prelude::*;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One variant's per-parent allele probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantDosages {
    pub id: String,
    pub position: u64,
    /// Values in [0, 1], one per parent; NaN marks a missing value.
    pub values: Vec<f64>,
}

/// A cooperative stop flag shared between workers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComputeSummary {
    pub variants: usize,
    pub rows: u64,
    pub pairs: u64,
    pub elapsed: Duration,
}

/// r2 between two variants over the parents where both are observed.
///
/// Returns `None` when the pair carries no linkage signal (`nAB * n == nA * nB`), when
/// no parent is observed for both, or when either allele is monomorphic.
pub fn r2(a: &[f64], b: &[f64]) -> Option<f64> {
    let (mut n, mut n_a, mut n_b, mut n_ab) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        if x.is_nan() || y.is_nan() {
            continue;
        }
        n += 1.0;
        n_a += x;
        n_b += y;
        n_ab += x * y;
    }

    if n == 0.0 || n_ab * n == n_a * n_b {
        return None;
    }

    let p_a = n_a / n;
    let p_b = n_b / n;
    let d = n_ab / n - p_a * p_b;
    let value = (d * d) / (p_a * (1.0 - p_a) * p_b * (1.0 - p_b));
    value.is_finite().then_some(value)
}

#[derive(Debug, Clone)]
pub struct LdComputer {
    max_distance: u32,
    min_r2: f64,
    threads: usize,
    timeout: Option<Duration>,
    token: CancellationToken,
}

impl LdComputer {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            max_distance: config.max_distance,
            min_r2: config.min_r2,
            threads: config.effective_threads(),
            timeout: config.timeout(),
            token: CancellationToken::new(),
        }
    }

    /// Uses `token` instead of a private one so the caller can cancel the run.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Computes every row and hands it to `writer`. All ids are registered in input
    /// order before any row is computed.
    ///
    /// # Errors
    /// * `InvalidArgument` if the variants are not sorted by position, carry
    ///   different numbers of values, or repeat an id.
    /// * `Cancelled` if the token was cancelled or the timeout elapsed.
    /// * Any error raised by the writer.
    pub fn compute(
        &self,
        variants: &[VariantDosages],
        writer: &LdMatrixWriter,
    ) -> Result<ComputeSummary> {
        validate_input(variants)?;
        let start = Instant::now();
        let deadline = self.timeout.map(|timeout| start + timeout);

        let index = writer.variant_index();
        let ids: Vec<u32> = variants.iter().map(|v| index.add(&v.id)).collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| LdError::InvalidArgument(format!("Cannot start worker pool: {e}")))?;

        log::info!(
            "Computing LD for {} variants (max distance {} bp, min r2 {}, {} threads)",
            variants.len(),
            self.max_distance,
            self.min_r2,
            self.threads
        );

        let pb = create_progress_bar(variants.len() as u64);
        let rows = AtomicU64::new(0);
        let pairs = AtomicU64::new(0);
        let first_error: Mutex<Option<LdError>> = Mutex::new(None);

        pool.install(|| {
            (0..variants.len()).into_par_iter().for_each(|a| {
                if self.token.is_cancelled() {
                    return;
                }
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    log::warn!("LD computation timed out after {:?}", start.elapsed());
                    self.token.cancel();
                    return;
                }

                let (partners, values) = self.row(variants, &ids, a);
                if let Err(e) = writer.add_variant(ids[a], &partners, &values) {
                    let mut slot = first_error.lock().unwrap_or_else(PoisonError::into_inner);
                    slot.get_or_insert(e);
                    self.token.cancel();
                    return;
                }
                if !partners.is_empty() {
                    rows.fetch_add(1, Ordering::Relaxed);
                    pairs.fetch_add(partners.len() as u64, Ordering::Relaxed);
                }
                pb.inc(1);
            })
        });
        pb.finish_and_clear();

        if let Some(e) = first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(e);
        }
        if self.token.is_cancelled() {
            return Err(LdError::Cancelled(format!(
                "LD computation stopped after {:?}",
                start.elapsed()
            )));
        }

        let summary = ComputeSummary {
            variants: variants.len(),
            rows: rows.into_inner(),
            pairs: pairs.into_inner(),
            elapsed: start.elapsed(),
        };
        log::info!(
            "Computed {} rows holding {} pairs in {:.2?}",
            summary.rows,
            summary.pairs,
            summary.elapsed
        );
        Ok(summary)
    }

    /// The stored partners of variant `a`: every other variant within the window whose
    /// r2 exceeds the threshold, in position order.
    fn row(&self, variants: &[VariantDosages], ids: &[u32], a: usize) -> (Vec<u32>, Vec<f32>) {
        let position = variants[a].position;
        let window = u64::from(self.max_distance);
        let lo = variants.partition_point(|v| v.position < position.saturating_sub(window));
        let hi = variants.partition_point(|v| v.position <= position.saturating_add(window));

        let mut partners = Vec::new();
        let mut values = Vec::new();
        for b in (lo..hi).filter(|b| *b != a) {
            if let Some(value) = r2(&variants[a].values, &variants[b].values) {
                if value > self.min_r2 {
                    partners.push(ids[b]);
                    values.push(value as f32);
                }
            }
        }
        (partners, values)
    }
}

fn validate_input(variants: &[VariantDosages]) -> Result<()> {
    if let Some(pair) = variants
        .windows(2)
        .find(|pair| pair[1].position < pair[0].position)
    {
        return Err(LdError::InvalidArgument(format!(
            "Variants must be sorted by position: '{}' ({}) follows '{}' ({}).",
            pair[1].id, pair[1].position, pair[0].id, pair[0].position
        )));
    }
    if let Some(first) = variants.first() {
        let width = first.values.len();
        if let Some(other) = variants.iter().find(|v| v.values.len() != width) {
            return Err(LdError::InvalidArgument(format!(
                "Variant '{}' has {} values, expected {width}.",
                other.id,
                other.values.len()
            )));
        }
    }
    let mut seen = AHashSet::with_capacity(variants.len());
    if let Some(duplicate) = variants.iter().find(|v| !seen.insert(v.id.as_str())) {
        return Err(LdError::InvalidArgument(format!(
            "Variant '{}' appears more than once.",
            duplicate.id
        )));
    }
    Ok(())
}

fn create_progress_bar(len: u64) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ld::reader::LdMatrixReader;
    use crate::variant_index::VariantIndex;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::path::Path;
    use tempfile::tempdir;

    fn variant(id: &str, position: u64, values: &[f64]) -> VariantDosages {
        VariantDosages {
            id: id.to_string(),
            position,
            values: values.to_vec(),
        }
    }

    fn config(max_distance: u32, min_r2: f64) -> StoreConfig {
        StoreConfig {
            max_distance,
            min_r2,
            threads: Some(2),
            ..StoreConfig::default()
        }
    }

    fn open_writer(path: &Path) -> LdMatrixWriter {
        LdMatrixWriter::open(Arc::new(VariantIndex::new()), path, 6).unwrap()
    }

    #[test]
    fn identical_variants_are_in_full_ld() {
        let a = [0.0, 1.0, 0.0, 1.0, 1.0, 0.0];
        assert_relative_eq!(r2(&a, &a).unwrap(), 1.0, epsilon = 1e-12);
        let flipped: Vec<f64> = a.iter().map(|x| 1.0 - x).collect();
        assert_relative_eq!(r2(&a, &flipped).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_values_and_monomorphic_variants() {
        let a = [0.0, 1.0, f64::NAN, 1.0, 0.0];
        let b = [0.0, 1.0, 1.0, f64::NAN, 0.0];
        // Only parents 0, 1 and 4 are observed for both.
        assert_relative_eq!(r2(&a, &b).unwrap(), 1.0, epsilon = 1e-12);

        let constant = [1.0, 1.0, 1.0, 1.0, 1.0];
        assert!(r2(&a, &constant).is_none());
        assert!(r2(&[f64::NAN; 3], &[0.5; 3]).is_none());
    }

    #[test]
    fn independent_variants_have_low_r2() {
        let mut rng = StdRng::seed_from_u64(7);
        let a: Vec<f64> = (0..5000).map(|_| f64::from(rng.gen_range(0..2u8))).collect();
        let b: Vec<f64> = (0..5000).map(|_| f64::from(rng.gen_range(0..2u8))).collect();
        assert!(r2(&a, &b).unwrap_or(0.0) < 0.01);
    }

    #[test]
    fn rows_respect_window_and_threshold() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ld.tld");
        let base = [0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0];
        let variants = vec![
            variant("v1", 100, &base),
            variant("v2", 150, &base),
            variant("v3", 1_000, &base),
            variant("v4", 1_040, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0]),
        ];

        let writer = open_writer(&path);
        let summary = LdComputer::new(&config(100, 0.5))
            .compute(&variants, &writer)
            .unwrap();
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.pairs, 2);
        writer.close().unwrap();

        let reader = LdMatrixReader::open(&path).unwrap();
        let v1 = reader.get_r2("v1").unwrap().unwrap();
        assert_eq!(v1.len(), 1);
        assert_relative_eq!(v1.get("v2").copied().unwrap(), 1.0, epsilon = 1e-6);
        assert!(reader.get_r2("v2").unwrap().unwrap().contains_key("v1"));
        // v3 is in range of v4 only, and v4 is monomorphic.
        assert!(reader.get_r2("v3").unwrap().is_none());
        assert_eq!(reader.variant_index().get_index("v4").unwrap(), 3);
    }

    #[test]
    fn unsorted_or_ragged_input_is_rejected() {
        let dir = tempdir().unwrap();
        let writer = open_writer(&dir.path().join("bad.tld"));
        let computer = LdComputer::new(&config(10, 0.1));

        let unsorted = vec![variant("a", 20, &[0.0]), variant("b", 10, &[1.0])];
        assert!(matches!(
            computer.compute(&unsorted, &writer),
            Err(LdError::InvalidArgument(_))
        ));
        let ragged = vec![variant("a", 10, &[0.0]), variant("b", 20, &[1.0, 0.0])];
        assert!(matches!(
            computer.compute(&ragged, &writer),
            Err(LdError::InvalidArgument(_))
        ));
        let repeated = vec![variant("a", 10, &[0.0]), variant("a", 20, &[1.0])];
        assert!(matches!(
            computer.compute(&repeated, &writer),
            Err(LdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn a_cancelled_token_stops_the_run() {
        let dir = tempdir().unwrap();
        let writer = open_writer(&dir.path().join("cancelled.tld"));
        let token = CancellationToken::new();
        token.cancel();

        let variants = vec![
            variant("a", 1, &[0.0, 1.0]),
            variant("b", 2, &[0.0, 1.0]),
        ];
        let result = LdComputer::new(&config(10, 0.1))
            .with_token(token.clone())
            .compute(&variants, &writer);
        assert!(matches!(result, Err(LdError::Cancelled(_))));
        assert_eq!(writer.row_count(), 0);
    }

    #[test]
    fn writer_errors_win_over_cancellation() {
        let dir = tempdir().unwrap();
        let writer = open_writer(&dir.path().join("dup.tld"));
        let variants = vec![
            variant("a", 1, &[0.0, 1.0, 0.0, 1.0]),
            variant("b", 2, &[0.0, 1.0, 0.0, 1.0]),
        ];
        let a = writer.variant_index().add("a");
        let b = writer.variant_index().add("b");
        writer.add_variant(a, &[b], &[0.9]).unwrap();

        let result = LdComputer::new(&config(10, 0.1)).compute(&variants, &writer);
        assert!(matches!(result, Err(LdError::InvalidArgument(_))));
    }
}
