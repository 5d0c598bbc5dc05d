//! Audit log and the optional header/footer database artifact.
//!
//! The audit file records, for every carved file, one line per physical
//! fragment. It opens once per process, before the first image, and the
//! output directory is required to be empty (or creatable) so that a run
//! can never silently mix its results with older evidence.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::info;

use crate::coverage::{Fragment, LogicalImage};
use crate::image::ImageSource;
use crate::spec::Catalog;
use crate::{base_name, CarverError, CarverOptions, Result};

/// The open `audit.txt` for this run.
pub struct AuditLog {
    file: File,
    path: PathBuf,
}

impl AuditLog {
    /// Verifies the output directory, creates `audit.txt` and writes the
    /// run header.
    pub fn open(opts: &CarverOptions, invocation: &str) -> Result<AuditLog> {
        ensure_empty_directory(&opts.output_dir)?;

        let path = opts.output_dir.join("audit.txt");
        let file = File::create(&path).map_err(|source| CarverError::FileOpen {
            path: path.clone(),
            source,
        })?;

        let mut audit = AuditLog { file, path };
        audit.write(&format!(
            "\n{} version {} audit file\nStarted at {}\nCommand line:\n{}\n\nOutput directory: {}\nConfiguration file: {}\n",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            Local::now().format("%a %b %e %T %Y"),
            invocation,
            opts.output_dir.display(),
            opts.config_file.display(),
        ))?;
        Ok(audit)
    }

    /// Initial entries for one image: target banner, skip notice, column
    /// header.
    pub fn begin_image(&mut self, image: &Path, skip: u64) -> Result<()> {
        info!("opening target \"{}\"", image.display());
        self.write(&format!("\nOpening target \"{}\"\n\n", image.display()))?;
        if skip > 0 {
            self.write(&format!(
                "Skipped the first {} bytes of {}...\n",
                skip,
                image.display()
            ))?;
        }
        self.write("The following files were carved:\n")?;
        self.write("File\t\t  Start\t\t\tChop\t\tLength\t\tExtracted From\n")
    }

    /// One audit line for one physical fragment of a carved file.
    pub fn fragment(
        &mut self,
        filename: &Path,
        frag: &Fragment,
        chopped: bool,
        image: &Path,
    ) -> Result<()> {
        let marker = if chopped { "YES   " } else { "NO    " };
        self.write(&format!(
            "{}{:>13}\t\t{}{:>13}\t\t{}\n",
            base_name(filename),
            frag.start,
            marker,
            frag.len(),
            base_name(image)
        ))
    }

    /// Mirrors an error diagnostic into the audit file.
    pub fn note(&mut self, message: &str) -> Result<()> {
        self.write(&format!("{}\n", message))
    }

    /// Writes the completion trailer and closes the file.
    pub fn close(mut self) -> Result<()> {
        self.write(&format!(
            "\n\nCompleted at {}\n",
            Local::now().format("%a %b %e %T %Y")
        ))?;
        self.file
            .sync_all()
            .map_err(|source| CarverError::FileClose {
                path: self.path.clone(),
                source,
            })
    }

    fn write(&mut self, text: &str) -> Result<()> {
        self.file
            .write_all(text.as_bytes())
            .map_err(|source| CarverError::FileWrite {
                path: self.path.clone(),
                source,
            })
    }
}

/// The directory must exist empty or be creatable; anything else aborts
/// the run before the first image opens.
fn ensure_empty_directory(dir: &Path) -> Result<()> {
    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(CarverError::GeneralAbort(format!(
                    "output directory {} is not empty; refusing to mix evidence",
                    dir.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(dir).map_err(|source| CarverError::FileOpen {
                path: dir.to_path_buf(),
                source,
            })
        }
        Err(source) => Err(CarverError::FileOpen {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

/// Writes `<outdir>/<image_base>.hfd`: for every rule with a real suffix,
/// the suffix, the header count and each header position, then the footer
/// count and each footer position, one value per line. Offsets are
/// translated to physical addresses through the coverage facade.
pub fn write_hfd<S: ImageSource>(
    opts: &CarverOptions,
    catalog: &Catalog,
    image: &Path,
    view: &LogicalImage<S>,
) -> Result<()> {
    let path = opts
        .output_dir
        .join(format!("{}.hfd", base_name(image)));
    info!("writing header/footer database {}", path.display());

    let file = File::create(&path).map_err(|source| CarverError::FileWrite {
        path: path.clone(),
        source,
    })?;
    let mut out = std::io::BufWriter::new(file);

    let mut emit = |text: String| -> Result<()> {
        out.write_all(text.as_bytes())
            .map_err(|source| CarverError::FileWrite {
                path: path.clone(),
                source,
            })
    };

    for spec in &catalog.specs {
        let Some(suffix) = &spec.suffix else {
            continue;
        };
        emit(format!("{}\n", suffix))?;
        emit(format!("{}\n", spec.offsets.headers.len()))?;
        for &h in &spec.offsets.headers {
            emit(format!("{}\n", view.to_physical(h)))?;
        }
        emit(format!("{}\n", spec.offsets.footers.len()))?;
        for &f in &spec.offsets.footers {
            emit(format!("{}\n", view.to_physical(f)))?;
        }
    }

    out.flush().map_err(|source| CarverError::FileWrite {
        path: path.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_a_non_empty_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("leftover.txt"), b"x").unwrap();
        assert!(matches!(
            ensure_empty_directory(dir.path()),
            Err(CarverError::GeneralAbort(_))
        ));
    }

    #[test]
    fn creates_a_missing_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out");
        ensure_empty_directory(&target).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn audit_lines_have_the_expected_columns() {
        let dir = tempfile::tempdir().unwrap();
        let opts = CarverOptions {
            output_dir: dir.path().join("out"),
            ..Default::default()
        };

        let mut audit = AuditLog::open(&opts, "exhume_carver -o out img.dd").unwrap();
        audit.begin_image(Path::new("img.dd"), 0).unwrap();
        audit
            .fragment(
                Path::new("out/00000000.jpg"),
                &Fragment { start: 2, stop: 1025 },
                true,
                Path::new("/evidence/img.dd"),
            )
            .unwrap();
        audit.close().unwrap();

        let text = fs::read_to_string(dir.path().join("out/audit.txt")).unwrap();
        assert!(text.contains("The following files were carved:"));
        let line = text
            .lines()
            .find(|l| l.starts_with("00000000.jpg"))
            .unwrap();
        assert!(line.contains("YES"));
        assert!(line.contains("1024"));
        assert!(line.ends_with("img.dd"));
        assert!(line.contains(&format!("{:>13}", 2)));
    }
}
