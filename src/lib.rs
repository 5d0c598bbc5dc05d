//! Two-pass signature-based file carving engine.
//!
//! The carver recovers files from a disk image (or raw block device) purely
//! from byte-pattern evidence: a first streaming pass ([`dig`]) records the
//! absolute offset of every header and footer occurrence for every
//! configured file type, and a second sequential pass ([`carve`]) pairs
//! headers with footers and extracts the byte ranges in between, within a
//! bounded memory and open-file budget. An optional persistent coverage
//! map makes regions claimed by earlier carving sessions invisible to
//! later ones.

pub mod audit;
pub mod carve;
pub mod coverage;
pub mod dig;
pub mod image;
pub mod matcher;
pub mod spec;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Scan window used by both passes. Image files are processed in windows
/// of exactly this many bytes, with a small rewind between windows so a
/// pattern can never be split across a boundary.
pub const CHUNK: usize = 10 * 1024 * 1024;

// The chunk must stay a whole number of 512-byte device sectors.
const _: () = assert!(CHUNK % 512 == 0);

/// Errors surfaced by the carving engine.
///
/// Failures that occur while an image is being processed abort that image
/// only; the driver reports them and moves on to the next image. Failures
/// before the first image opens (configuration, output directory) are
/// fatal to the process.
#[derive(Debug, Error)]
pub enum CarverError {
    #[error("no file types specified in configuration")]
    NoSearchSpec,

    #[error("configuration defines more than {0} file types")]
    TooManyTypes(usize),

    #[error("couldn't open {path}: {source}")]
    FileOpen { path: PathBuf, source: io::Error },

    #[error("read error on {path}: {source}")]
    FileRead { path: PathBuf, source: io::Error },

    #[error("write error on {path}: {source}")]
    FileWrite { path: PathBuf, source: io::Error },

    #[error("close error on {path}: {source}")]
    FileClose { path: PathBuf, source: io::Error },

    #[error("coverage blockmap {path} is truncated or inconsistent")]
    FatalRead { path: PathBuf },

    #[error("{0}")]
    GeneralAbort(String),

    #[error("interrupted by signal {0}")]
    Interrupted(i32),
}

pub type Result<T> = std::result::Result<T, CarverError>;

/// Run options shared by every subsystem, assembled from the command line.
#[derive(Debug, Clone)]
pub struct CarverOptions {
    pub output_dir: PathBuf,
    pub config_file: PathBuf,
    /// Directory holding coverage blockmap files; defaults to `output_dir`.
    pub coverage_dir: PathBuf,
    /// Bytes to skip at the start of every image.
    pub skip: u64,
    pub verbose: bool,
    /// Omit filename extensions on carved files.
    pub no_suffix: bool,
    /// Carve FORWARD types even when no footer was found (chopped at the
    /// maximum carve length).
    pub carve_missing_footers: bool,
    /// Record only non-overlapping header/footer matches.
    pub no_search_overlap: bool,
    /// Reserved option surface; no behaviour is attached to it.
    pub ignore_embedded: bool,
    /// Emit the per-image header/footer database artifact. Disables the
    /// footer-pruning optimisation in pass 1.
    pub generate_hfd: bool,
    pub update_coverage: bool,
    pub coverage_block_size: u32,
    pub use_coverage: bool,
    pub organize_subdirectories: bool,
    pub max_files_per_subdir: u64,
    pub block_aligned_only: bool,
    pub aligned_block_size: u64,
    /// Produce the audit log without writing any carved file.
    pub preview: bool,
}

impl Default for CarverOptions {
    fn default() -> Self {
        CarverOptions {
            output_dir: PathBuf::from("carver-output"),
            config_file: PathBuf::from("carver.conf"),
            coverage_dir: PathBuf::from("carver-output"),
            skip: 0,
            verbose: false,
            no_suffix: false,
            carve_missing_footers: false,
            no_search_overlap: false,
            ignore_embedded: false,
            generate_hfd: false,
            update_coverage: false,
            coverage_block_size: 0,
            use_coverage: false,
            organize_subdirectories: true,
            max_files_per_subdir: 1000,
            block_aligned_only: false,
            aligned_block_size: 0,
            preview: false,
        }
    }
}

/// The carving engine: options, catalogue, the process-wide read buffer
/// and the monotonic output-file counter.
///
/// One `Carver` processes any number of images in sequence. The offset
/// database is cleared between images; the output numbering and the
/// per-rule subdirectory bucketing deliberately are not, so a batch run
/// never reuses a filename.
pub struct Carver {
    pub(crate) opts: CarverOptions,
    pub(crate) catalog: spec::Catalog,
    pub(crate) files_written: u64,
    /// Single reusable read buffer of exactly [`CHUNK`] bytes, shared by
    /// both passes.
    pub(crate) buf: Vec<u8>,
}

impl Carver {
    pub fn new(opts: CarverOptions, catalog: spec::Catalog) -> Carver {
        Carver {
            opts,
            catalog,
            files_written: 0,
            buf: vec![0u8; CHUNK],
        }
    }

    /// Runs both passes over one image: dig the header/footer offsets,
    /// then plan and execute the carves.
    pub fn process_image(
        &mut self,
        audit: &mut audit::AuditLog,
        image: &std::path::Path,
    ) -> Result<()> {
        let dug = self.dig_image(audit, image)?;
        self.carve_image(audit, image, dug)
    }

    /// Total carved files planned so far, across all images.
    pub fn files_written(&self) -> u64 {
        self.files_written
    }
}

/// Cooperative shutdown flag, set from the signal handler and observed at
/// least once per scan window and between match iterations.
pub mod signal {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CAUGHT: AtomicUsize = AtomicUsize::new(0);

    /// Records a delivered termination signal. Async-signal-safe.
    pub fn raise(signum: i32) {
        CAUGHT.store(signum as usize, Ordering::SeqCst);
    }

    /// The signal observed so far, if any.
    pub fn caught() -> Option<i32> {
        match CAUGHT.load(Ordering::SeqCst) {
            0 => None,
            s => Some(s as i32),
        }
    }

    /// Bails out of an engine loop when a signal has been delivered.
    pub fn check() -> crate::Result<()> {
        match caught() {
            Some(s) => Err(crate::CarverError::Interrupted(s)),
            None => Ok(()),
        }
    }
}

/// Basename helper used by audit lines and artifact names.
pub(crate) fn base_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
