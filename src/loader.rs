//! Endless batch generation over a pool of subjects.
//!
//! [`BatchGenerator`] is a plain [`Iterator`]: every call to `next` runs on
//! the caller's thread, preprocesses one slice of the pool and returns it as
//! a [`Batch`]. It never returns `None`; when the pool is exhausted a new
//! pass starts, reshuffled if enabled.
//!
//! ```ignore
//! let pool = brats_prep::dataset::discover_subjects("data/train")?;
//! let pre = SubjectPreprocessor::new([128, 128, 128], "nii.gz")?;
//! let options = GeneratorOptions::new(2).augment(true);
//! for batch in BatchGenerator::seeded(pool, pre, options, Some(0))?.take(10) {
//!     let batch = batch?;
//!     train_step(batch.images.view(), batch.labels.view());
//! }
//! ```

use crate::error::{Error, Result, SkippedSubject};
use crate::subject::{Subject, SubjectPreprocessor};
use crate::transforms::augment::{get_rng, AugmentParams, Augmenter};
use ndarray::{stack, Array3, Array4, Array5, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What to do when a subject of a slice fails to preprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Drop the subject, log it and list it in [`Batch::skipped`].
    ///
    /// A slice in which every subject fails yields [`Error::EmptyBatch`].
    #[default]
    Skip,
    /// Yield the first failure instead of the batch.
    Abort,
}

/// Batch generation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorOptions {
    /// Subjects per batch; the last batch of a pass may be smaller.
    pub batch_size: usize,
    /// Apply random flips and rotations.
    pub augment: bool,
    /// Reshuffle the pool at the start of every pass.
    pub shuffle: bool,
    /// Handling of subjects that fail to preprocess.
    pub failure_policy: FailurePolicy,
    /// Preprocess the subjects of a slice on the rayon pool.
    pub parallel: bool,
}

impl Default for GeneratorOptions {
    fn default() -> Self {
        Self::new(2)
    }
}

impl GeneratorOptions {
    /// Shuffled, unaugmented batches of `batch_size` subjects.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            augment: false,
            shuffle: true,
            failure_policy: FailurePolicy::Skip,
            parallel: false,
        }
    }

    /// Enable or disable augmentation.
    pub fn augment(mut self, augment: bool) -> Self {
        self.augment = augment;
        self
    }

    /// Enable or disable per-pass shuffling.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// Set the failure policy.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Enable or disable parallel preprocessing within a slice.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// One batch of preprocessed subjects.
#[derive(Debug)]
pub struct Batch {
    /// Images, `(B, D, H, W, 4)`.
    pub images: Array5<f32>,
    /// Labels, `(B, D, H, W)`.
    pub labels: Array4<u8>,
    /// Identifiers in batch order.
    pub subject_ids: Vec<String>,
    /// Pass the batch belongs to, starting at 0.
    pub pass: usize,
    /// Subjects of this slice dropped under [`FailurePolicy::Skip`].
    pub skipped: Vec<SkippedSubject>,
}

impl Batch {
    /// Number of subjects in the batch.
    pub fn len(&self) -> usize {
        self.subject_ids.len()
    }

    /// Always false; empty batches are never produced.
    pub fn is_empty(&self) -> bool {
        self.subject_ids.is_empty()
    }

    /// Consume the batch into `(images, labels)`.
    pub fn into_arrays(self) -> (Array5<f32>, Array4<u8>) {
        (self.images, self.labels)
    }
}

type Sample = (Array4<f32>, Array3<u8>);

/// Infinite iterator of [`Batch`]es over an owned subject pool.
pub struct BatchGenerator<R = ChaCha8Rng> {
    pool: Vec<Subject>,
    preprocessor: SubjectPreprocessor,
    options: GeneratorOptions,
    augmenter: Augmenter,
    rng: R,
    cursor: usize,
    pass: usize,
}

impl BatchGenerator<ChaCha8Rng> {
    /// Generator with a ChaCha8 source, seeded from entropy when `seed` is
    /// `None`.
    pub fn seeded(
        pool: Vec<Subject>,
        preprocessor: SubjectPreprocessor,
        options: GeneratorOptions,
        seed: Option<u64>,
    ) -> Result<Self> {
        Self::new(pool, preprocessor, options, get_rng(seed))
    }
}

impl<R: Rng> BatchGenerator<R> {
    /// Create a generator owning `pool` and drawing randomness from `rng`.
    ///
    /// Fails with [`Error::EmptyPool`] for an empty pool and
    /// [`Error::Configuration`] for a zero batch size.
    pub fn new(
        pool: Vec<Subject>,
        preprocessor: SubjectPreprocessor,
        options: GeneratorOptions,
        rng: R,
    ) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(Error::Configuration("batch size must be positive".into()));
        }
        if pool.is_empty() {
            return Err(Error::EmptyPool);
        }
        Ok(Self {
            pool,
            preprocessor,
            options,
            augmenter: Augmenter::default(),
            rng,
            cursor: 0,
            pass: 0,
        })
    }

    /// Replace the default augmenter.
    pub fn with_augmenter(mut self, augmenter: Augmenter) -> Self {
        self.augmenter = augmenter;
        self
    }

    /// Current pass number.
    pub fn pass(&self) -> usize {
        self.pass
    }

    /// Pool in its current order.
    pub fn pool(&self) -> &[Subject] {
        &self.pool
    }

    /// Generator settings.
    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    /// Produce the next batch.
    ///
    /// The cursor advances even when an error is returned, so the following
    /// call moves on to the next slice.
    pub fn next_batch(&mut self) -> Result<Batch> {
        if self.cursor == 0 && self.options.shuffle {
            self.pool.shuffle(&mut self.rng);
            debug!(pass = self.pass, "shuffled subject pool");
        }

        let pass = self.pass;
        let end = (self.cursor + self.options.batch_size).min(self.pool.len());
        let slice = self.pool[self.cursor..end].to_vec();
        self.cursor = end;
        if self.cursor == self.pool.len() {
            self.cursor = 0;
            self.pass += 1;
            debug!(pass, "pass complete");
        }

        // Drawn up front and in slot order so parallel runs match serial ones.
        let [d, h, _] = self.preprocessor.target_shape();
        let mut params = Vec::with_capacity(slice.len());
        for _ in &slice {
            params.push(
                self.options
                    .augment
                    .then(|| self.augmenter.sample((d, h), &mut self.rng)),
            );
        }

        let results = self.process(&slice, &params);
        assemble(pass, &slice, results, self.options.failure_policy)
    }

    fn process(&self, slice: &[Subject], params: &[Option<AugmentParams>]) -> Vec<Result<Sample>> {
        let preprocessor = &self.preprocessor;
        let work = |(subject, params): (&Subject, &Option<AugmentParams>)| -> Result<Sample> {
            let (image, label) = preprocessor.preprocess(subject)?;
            match params {
                Some(p) => p.apply(image, label),
                None => Ok((image, label)),
            }
        };

        if self.options.parallel {
            slice.par_iter().zip(params.par_iter()).map(work).collect()
        } else {
            slice.iter().zip(params.iter()).map(work).collect()
        }
    }
}

fn assemble(
    pass: usize,
    slice: &[Subject],
    results: Vec<Result<Sample>>,
    policy: FailurePolicy,
) -> Result<Batch> {
    let mut images = Vec::with_capacity(slice.len());
    let mut labels = Vec::with_capacity(slice.len());
    let mut subject_ids = Vec::with_capacity(slice.len());
    let mut skipped = Vec::new();

    for (subject, result) in slice.iter().zip(results) {
        match result {
            Ok((image, label)) => {
                images.push(image);
                labels.push(label);
                subject_ids.push(subject.id().to_string());
            }
            Err(error) => match policy {
                FailurePolicy::Abort => return Err(error),
                FailurePolicy::Skip => {
                    warn!(subject = %subject, pass, %error, "skipping subject");
                    skipped.push(SkippedSubject {
                        id: subject.id().to_string(),
                        error,
                    });
                }
            },
        }
    }

    if images.is_empty() {
        return Err(Error::EmptyBatch {
            pass,
            failures: skipped,
        });
    }

    let views: Vec<_> = images.iter().map(|a| a.view()).collect();
    let images = stack(Axis(0), &views)
        .map_err(|e| Error::shape(format!("cannot stack batch images: {e}")))?;
    let views: Vec<_> = labels.iter().map(|a| a.view()).collect();
    let labels = stack(Axis(0), &views)
        .map_err(|e| Error::shape(format!("cannot stack batch labels: {e}")))?;

    Ok(Batch {
        images,
        labels,
        subject_ids,
        pass,
        skipped,
    })
}

impl<R: Rng> Iterator for BatchGenerator<R> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nifti::{self, NiftiImage};
    use crate::subject::Modality;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    const SHAPE: (usize, usize, usize) = (4, 4, 3);

    fn write_subject(root: &Path, id: &str) -> Subject {
        let subject = Subject::from_dir(root.join(id)).unwrap();
        std::fs::create_dir_all(subject.dir()).unwrap();
        for m in Modality::ALL {
            let volume = Array3::from_shape_fn(SHAPE, |(i, j, k)| {
                (i * 7 + j * 3 + k + m.channel()) as f32
            });
            nifti::save(&NiftiImage::from_volume(volume), subject.modality_path(m, "nii")).unwrap();
        }
        let labels = Array3::from_shape_fn(SHAPE, |(i, j, _)| ((i + j) % 4) as u8);
        nifti::save(&NiftiImage::from_labels(labels), subject.label_path("nii")).unwrap();
        subject
    }

    fn pool(n: usize) -> (TempDir, Vec<Subject>) {
        let dir = tempdir().unwrap();
        let subjects = (0..n)
            .map(|i| write_subject(dir.path(), &format!("subject-{i}")))
            .collect();
        (dir, subjects)
    }

    fn preprocessor() -> SubjectPreprocessor {
        SubjectPreprocessor::new([4, 4, 4], "nii").unwrap()
    }

    fn broken(subject: &Subject) {
        std::fs::remove_file(subject.label_path("nii")).unwrap();
    }

    #[test]
    fn test_batch_sizes_per_pass() {
        let (_dir, subjects) = pool(7);
        let options = GeneratorOptions::new(3);
        let mut generator = BatchGenerator::seeded(subjects, preprocessor(), options, Some(0)).unwrap();

        let sizes: Vec<_> = (0..6)
            .map(|_| generator.next().unwrap().unwrap())
            .map(|b| (b.pass, b.len()))
            .collect();
        assert_eq!(sizes, [(0, 3), (0, 3), (0, 1), (1, 3), (1, 3), (1, 1)]);
        assert_eq!(generator.pass(), 2);
    }

    #[test]
    fn test_batch_arrays() {
        let (_dir, subjects) = pool(2);
        let options = GeneratorOptions::new(2).shuffle(false);
        let mut generator = BatchGenerator::seeded(subjects, preprocessor(), options, None).unwrap();

        let batch = generator.next_batch().unwrap();
        assert_eq!(batch.images.dim(), (2, 4, 4, 4, 4));
        assert_eq!(batch.labels.dim(), (2, 4, 4, 4));
        assert_eq!(batch.subject_ids, ["subject-0", "subject-1"]);
        assert!(batch.skipped.is_empty());
    }

    #[test]
    fn test_each_pass_covers_pool_once() {
        let (_dir, subjects) = pool(5);
        let options = GeneratorOptions::new(2);
        let generator = BatchGenerator::seeded(subjects, preprocessor(), options, Some(3)).unwrap();

        let mut seen: Vec<String> = generator
            .take(3)
            .flat_map(|b| b.unwrap().subject_ids)
            .collect();
        seen.sort();
        let expected: Vec<_> = (0..5).map(|i| format!("subject-{i}")).collect();
        assert_eq!(seen, expected);
    }

    fn pass_orders(subjects: Vec<Subject>, seed: u64, passes: usize) -> Vec<Vec<String>> {
        let n = subjects.len();
        let options = GeneratorOptions::new(n);
        BatchGenerator::seeded(subjects, preprocessor(), options, Some(seed))
            .unwrap()
            .take(passes)
            .map(|b| b.unwrap().subject_ids)
            .collect()
    }

    #[test]
    fn test_shuffle_differs_across_passes_and_reproduces() {
        let (_dir, subjects) = pool(7);
        let a = pass_orders(subjects.clone(), 11, 4);
        let b = pass_orders(subjects, 11, 4);
        assert_eq!(a, b);
        assert!(a.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_no_shuffle_keeps_pool_order() {
        let (_dir, subjects) = pool(4);
        let options = GeneratorOptions::new(4).shuffle(false);
        let mut generator = BatchGenerator::seeded(subjects, preprocessor(), options, Some(1)).unwrap();
        for _ in 0..2 {
            let ids = generator.next_batch().unwrap().subject_ids;
            assert_eq!(ids, ["subject-0", "subject-1", "subject-2", "subject-3"]);
        }
    }

    #[test]
    fn test_skip_policy_shrinks_batch() {
        let (_dir, subjects) = pool(3);
        broken(&subjects[1]);
        let options = GeneratorOptions::new(3).shuffle(false);
        let mut generator = BatchGenerator::seeded(subjects, preprocessor(), options, None).unwrap();

        let batch = generator.next_batch().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.images.shape()[0], 2);
        assert_eq!(batch.subject_ids, ["subject-0", "subject-2"]);
        assert_eq!(batch.skipped.len(), 1);
        assert_eq!(batch.skipped[0].id, "subject-1");
        assert!(batch.skipped[0].error.is_load());
    }

    #[test]
    fn test_skip_policy_survives_oversized_header() {
        let (_dir, subjects) = pool(2);
        let path = subjects[0].modality_path(Modality::T1ce, "nii");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[108..112].copy_from_slice(&1e30f32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let options = GeneratorOptions::new(2).shuffle(false);
        let mut generator = BatchGenerator::seeded(subjects, preprocessor(), options, None).unwrap();
        let batch = generator.next_batch().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.subject_ids, ["subject-1"]);
        assert_eq!(batch.skipped[0].id, "subject-0");
    }

    #[test]
    fn test_all_failed_slice_is_an_error() {
        let (_dir, subjects) = pool(3);
        broken(&subjects[0]);
        broken(&subjects[1]);
        let options = GeneratorOptions::new(2).shuffle(false);
        let mut generator = BatchGenerator::seeded(subjects, preprocessor(), options, None).unwrap();

        match generator.next_batch() {
            Err(Error::EmptyBatch { pass: 0, failures }) => assert_eq!(failures.len(), 2),
            other => panic!("expected empty batch error, got {other:?}"),
        }
        // The generator moves on past the failed slice.
        assert_eq!(generator.next_batch().unwrap().subject_ids, ["subject-2"]);
    }

    #[test]
    fn test_abort_policy_surfaces_error() {
        let (_dir, subjects) = pool(4);
        broken(&subjects[0]);
        let options = GeneratorOptions::new(2)
            .shuffle(false)
            .failure_policy(FailurePolicy::Abort);
        let mut generator = BatchGenerator::seeded(subjects, preprocessor(), options, None).unwrap();

        assert!(generator.next_batch().unwrap_err().is_load());
        assert_eq!(generator.next_batch().unwrap().len(), 2);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let (_dir, subjects) = pool(5);
        let run = |parallel| {
            let options = GeneratorOptions::new(5).augment(true).parallel(parallel);
            let mut generator =
                BatchGenerator::seeded(subjects.clone(), preprocessor(), options, Some(5)).unwrap();
            generator.next_batch().unwrap().into_arrays()
        };
        assert_eq!(run(false), run(true));
    }

    #[test]
    fn test_invalid_construction() {
        let options = GeneratorOptions::new(2);
        assert!(matches!(
            BatchGenerator::seeded(Vec::new(), preprocessor(), options, None),
            Err(Error::EmptyPool)
        ));

        let (_dir, subjects) = pool(1);
        assert!(matches!(
            BatchGenerator::seeded(subjects, preprocessor(), GeneratorOptions::new(0), None),
            Err(Error::Configuration(_))
        ));
    }
}
