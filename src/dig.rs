//! Pass 1: stream the image and record every header and footer offset.
//!
//! The image is read through the coverage facade in [`CHUNK`]-sized
//! windows. Every rule's header pattern is searched across the whole
//! window; footer patterns are searched only while an outstanding header
//! could still pair with one (unless the header/footer database artifact
//! is requested, which needs every footer). Between windows the stream is
//! rewound by one byte less than the longest pattern so a match can never
//! straddle a window boundary.

use std::io::SeekFrom;
use std::path::Path;

use log::{debug, info};

use crate::audit::AuditLog;
use crate::coverage::{CoverageMap, LogicalImage};
use crate::image::{Image, ImageSource};
use crate::spec::Catalog;
use crate::{signal, Carver, CarverError, CarverOptions, Result, CHUNK};

/// What pass 1 hands to pass 2: the measured image size (after the skip
/// prefix) and the coverage map, ready to wrap a fresh image handle.
pub(crate) struct DigState {
    pub image_size: u64,
    pub map: Option<CoverageMap>,
}

impl Carver {
    /// Builds the header/footer offset database for one image.
    pub(crate) fn dig_image(
        &mut self,
        audit: &mut AuditLog,
        image_path: &Path,
    ) -> Result<DigState> {
        audit.begin_image(image_path, self.opts.skip)?;

        if self.catalog.is_empty() {
            return Err(CarverError::NoSearchSpec);
        }
        // a failed earlier image must not leak offsets into this one
        self.catalog.clear_offsets();
        let longest = self.catalog.longest_needle();

        let mut image = Image::open(image_path).map_err(|source| CarverError::FileOpen {
            path: image_path.to_path_buf(),
            source,
        })?;

        let total = image.size().map_err(|source| CarverError::FileRead {
            path: image_path.to_path_buf(),
            source,
        })?;
        if self.opts.skip > total {
            return Err(CarverError::FileRead {
                path: image_path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "skip prefix is larger than the image",
                ),
            });
        }
        if self.opts.skip > 0 {
            image
                .seek(SeekFrom::Start(self.opts.skip))
                .map_err(|source| CarverError::FileRead {
                    path: image_path.to_path_buf(),
                    source,
                })?;
        }
        let image_size = total - self.opts.skip;
        debug!("total file size is {} bytes", image_size);

        let map = CoverageMap::setup(&self.opts, image_path, image_size)?;
        let mut view =
            LogicalImage::new(image, map).map_err(|source| CarverError::FileRead {
                path: image_path.to_path_buf(),
                source,
            })?;

        info!("image file pass 1/2");
        loop {
            signal::check()?;

            let n = view
                .read(&mut self.buf)
                .map_err(|source| CarverError::FileRead {
                    path: image_path.to_path_buf(),
                    source,
                })?;
            debug!("read {} bytes from image file", n);
            if n < longest {
                break;
            }

            let window_start = view.tell() - n as u64;
            dig_buffer(
                &self.opts,
                &mut self.catalog,
                &self.buf[..n],
                window_start,
                &view,
            )?;

            // rewind so patterns straddling the window boundary are seen
            // again at the start of the next window
            if longest > 1 {
                view.seek_cur(-((longest - 1) as i64))
                    .map_err(|source| CarverError::FileRead {
                        path: image_path.to_path_buf(),
                        source,
                    })?;
            }

            if n < CHUNK {
                // the tail window was already short; the next read would
                // only replay the rewound bytes
                break;
            }
        }

        let (_, map) = view.into_parts();
        Ok(DigState { image_size, map })
    }
}

/// Searches one window for every rule's header and (when viable) footer
/// occurrences, appending absolute logical offsets in scan order.
fn dig_buffer(
    opts: &CarverOptions,
    catalog: &mut Catalog,
    buf: &[u8],
    offset: u64,
    view: &LogicalImage<Image>,
) -> Result<()> {
    for spec in catalog.specs.iter_mut() {
        // header search over the whole window
        let mut from = 0usize;
        loop {
            signal::check()?;
            let Some(at) = spec.header.find(buf, from) else {
                break;
            };
            let location = offset + at as u64;
            debug!(
                "a {} header was found at {}",
                spec.suffix_label(),
                view.to_physical(location)
            );
            spec.offsets.headers.push(location);
            from = if opts.no_search_overlap {
                at + spec.header.len()
            } else {
                at + 1
            };
        }

        let Some(footer) = &spec.footer else {
            continue;
        };

        // Footers are only useful while some already-seen header is still
        // within the maximum carve distance of this window; finding every
        // footer is required when the header/footer database is generated.
        let viable = match spec.offsets.headers.last() {
            Some(&last) => last >= offset || offset - last < spec.max_length,
            None => false,
        };
        if !viable && !opts.generate_hfd {
            continue;
        }

        let mut from = 0usize;
        loop {
            signal::check()?;
            let Some(at) = footer.find(buf, from) else {
                break;
            };
            let location = offset + at as u64;
            debug!(
                "a {} footer was found at {}",
                spec.suffix_label(),
                view.to_physical(location)
            );
            spec.offsets.footers.push(location);
            from = if opts.no_search_overlap {
                at + footer.len()
            } else {
                at + 1
            };
        }
    }

    Ok(())
}
