//! Coverage blockmap and the gap-compacted logical view of an image.
//!
//! The blockmap is a small persistent file recording, for every
//! fixed-size block of an image, how many carved files cover it. A
//! companion in-memory bit view (one bit per block, set iff the on-disk
//! counter was non-zero when the session started) lets the engine treat
//! covered blocks as if they did not exist: [`LogicalImage`] exposes the
//! image as a contiguous stream of only-uncovered bytes, and translates
//! logical positions back to physical addresses when audit entries and
//! the header/footer database are written.
//!
//! On-disk format, little-endian 32-bit words: `word[0]` is the block
//! size, `word[1..=N]` the per-block counters, `N = ceil(image_size /
//! block_size)`. The bit view is never written during a run; counter
//! updates happen only at the terminal close of a carved file.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};

use crate::image::ImageSource;
use crate::{base_name, CarverError, CarverOptions, Result};

/// One physically contiguous extent of a carved file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub start: u64,
    pub stop: u64,
}

impl Fragment {
    pub fn len(&self) -> u64 {
        self.stop - self.start + 1
    }
}

/// An open coverage blockmap.
pub struct CoverageMap {
    path: PathBuf,
    file: File,
    block_size: u32,
    num_blocks: u64,
    /// Bit view; populated only when the map guides carving.
    bitmap: Vec<u8>,
    update: bool,
    use_map: bool,
}

impl CoverageMap {
    /// Opens (or creates) the blockmap for `image_path` according to the
    /// run options. Returns `None` when no coverage mode is active.
    ///
    /// In use mode the file must already exist and its counters are
    /// loaded into the bit view; in update mode a missing file is created
    /// zeroed, and an existing one must agree on the block size.
    pub fn setup(
        opts: &CarverOptions,
        image_path: &Path,
        image_size: u64,
    ) -> Result<Option<CoverageMap>> {
        if !opts.update_coverage && !opts.use_coverage {
            return Ok(None);
        }

        let path = opts
            .coverage_dir
            .join(format!("{}.map", base_name(image_path)));
        debug!("coverage blockmap is {}", path.display());

        let existing = File::open(&path).ok();

        let mut block_size = opts.coverage_block_size;
        let mut bitmap = Vec::new();

        if let Some(file) = &existing {
            let mut reader = BufReader::new(file.try_clone().map_err(|source| {
                CarverError::FileOpen {
                    path: path.clone(),
                    source,
                }
            })?);

            let stored = reader
                .read_u32::<LittleEndian>()
                .map_err(|_| CarverError::FatalRead { path: path.clone() })?;

            if opts.use_coverage && !opts.update_coverage {
                block_size = stored;
            } else if stored != opts.coverage_block_size {
                return Err(CarverError::GeneralAbort(format!(
                    "block size {} does not match block size {} in {}",
                    opts.coverage_block_size,
                    stored,
                    path.display()
                )));
            }
            if block_size == 0 {
                return Err(CarverError::FatalRead { path: path.clone() });
            }

            let num_blocks = image_size.div_ceil(block_size as u64);

            if opts.use_coverage {
                info!("reading existing coverage blockmap {}", path.display());
                bitmap = vec![0u8; num_blocks.div_ceil(8) as usize];
                for block in 0..num_blocks {
                    let entry = reader
                        .read_u32::<LittleEndian>()
                        .map_err(|_| CarverError::FatalRead { path: path.clone() })?;
                    if entry != 0 {
                        bitmap[(block / 8) as usize] |= 1 << (block % 8);
                    }
                }
            }
        } else if opts.use_coverage {
            return Err(CarverError::GeneralAbort(format!(
                "coverage-guided carving requires that the blockmap file {} exist",
                path.display()
            )));
        }

        if block_size == 0 {
            return Err(CarverError::GeneralAbort(
                "coverage blockmap requires a non-zero block size".into(),
            ));
        }
        let num_blocks = image_size.div_ceil(block_size as u64);

        let file = if opts.update_coverage {
            // reopen read/write; seed a brand-new map with zero counters
            let fresh = existing.is_none();
            drop(existing);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|source| CarverError::FileWrite {
                    path: path.clone(),
                    source,
                })?;
            if fresh {
                info!("writing empty coverage blockmap {}", path.display());
                let mut writer = BufWriter::new(&file);
                writer
                    .write_u32::<LittleEndian>(block_size)
                    .and_then(|_| {
                        for _ in 0..num_blocks {
                            writer.write_u32::<LittleEndian>(0)?;
                        }
                        writer.flush()
                    })
                    .map_err(|source| CarverError::FileWrite {
                        path: path.clone(),
                        source,
                    })?;
            }
            file
        } else {
            match existing {
                Some(file) => file,
                // use mode without a map file already bailed out above
                None => {
                    return Err(CarverError::GeneralAbort(format!(
                        "coverage blockmap file {} disappeared before it could be opened",
                        path.display()
                    )))
                }
            }
        };

        Ok(Some(CoverageMap {
            path,
            file,
            block_size,
            num_blocks,
            bitmap,
            update: opts.update_coverage,
            use_map: opts.use_coverage,
        }))
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// True when the map guides carving (bit view active).
    pub fn guides_carving(&self) -> bool {
        self.use_map
    }

    fn covered(&self, block: u64) -> bool {
        if block >= self.num_blocks {
            return false;
        }
        self.bitmap[(block / 8) as usize] & (1 << (block % 8)) != 0
    }

    /// Increments the on-disk counter of every block intersected by
    /// `frag`. Called once per fragment at the terminal close of a carved
    /// file; the bit view is deliberately left untouched.
    pub fn record(&mut self, frag: &Fragment) -> Result<()> {
        if !self.update {
            return Ok(());
        }
        let bs = self.block_size as u64;
        for block in frag.start / bs..=frag.stop / bs {
            self.increment(block)?;
        }
        Ok(())
    }

    fn increment(&mut self, block: u64) -> Result<()> {
        // word 0 is the block size, counters start one word in
        let pos = (block + 1) * 4;
        self.file
            .seek(SeekFrom::Start(pos))
            .and_then(|_| self.file.read_u32::<LittleEndian>())
            .map_err(|_| CarverError::FatalRead {
                path: self.path.clone(),
            })
            .and_then(|entry| {
                self.file
                    .seek(SeekFrom::Start(pos))
                    .and_then(|_| self.file.write_u32::<LittleEndian>(entry + 1))
                    .map_err(|source| CarverError::FileWrite {
                        path: self.path.clone(),
                        source,
                    })
            })
    }
}

/// The logical (gap-compacted) view over an image source.
///
/// When no coverage map guides carving, every operation is a
/// pass-through. Otherwise reads, relative seeks and position reports
/// silently skip blocks whose coverage bit is set. The logical position
/// is maintained as a running counter; the single bitmap walk happens
/// when the view is built around an already-positioned stream.
pub struct LogicalImage<S: ImageSource> {
    source: S,
    map: Option<CoverageMap>,
    physical_pos: u64,
    logical_pos: u64,
}

impl<S: ImageSource> LogicalImage<S> {
    pub fn new(mut source: S, map: Option<CoverageMap>) -> io::Result<LogicalImage<S>> {
        let physical_pos = source.tell()?;
        let logical_pos = match &map {
            Some(m) if m.guides_carving() => logical_of_physical(m, physical_pos),
            _ => physical_pos,
        };
        Ok(LogicalImage {
            source,
            map,
            physical_pos,
            logical_pos,
        })
    }

    /// Releases the underlying source and map, e.g. between the two
    /// passes.
    pub fn into_parts(self) -> (S, Option<CoverageMap>) {
        (self.source, self.map)
    }

    pub fn map_mut(&mut self) -> Option<&mut CoverageMap> {
        self.map.as_mut()
    }

    fn guide(&self) -> Option<&CoverageMap> {
        self.map.as_ref().filter(|m| m.guides_carving())
    }

    /// Logical position: physical position minus every covered byte at or
    /// before it.
    pub fn tell(&self) -> u64 {
        self.logical_pos
    }

    /// Reads up to `buf.len()` logical bytes, skipping covered blocks.
    /// Short reads at the image end are reported faithfully.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(map) = self.map.as_ref().filter(|m| m.guides_carving()) else {
            let n = self.source.read(buf)?;
            self.physical_pos += n as u64;
            self.logical_pos += n as u64;
            return Ok(n);
        };

        let bs = map.block_size as u64;
        let nb = map.num_blocks;
        let mut curpos = self.physical_pos;
        let mut total = 0usize;

        while total < buf.len() {
            let block = curpos / bs;

            if block >= nb {
                let n = self.source.read(&mut buf[total..])?;
                curpos += n as u64;
                total += n;
                break;
            }

            if map.covered(block) {
                let skip = bs - curpos % bs;
                self.source.seek(SeekFrom::Current(skip as i64))?;
                curpos += skip;
                continue;
            }

            // accumulate a run of uncovered blocks and read it at once
            let mut run = 0u64;
            let mut b = block;
            while b < nb && !map.covered(b) && run < (buf.len() - total) as u64 {
                run += bs - (curpos + run) % bs;
                b += 1;
            }
            let run = run.min((buf.len() - total) as u64) as usize;

            let n = self.source.read(&mut buf[total..total + run])?;
            curpos += n as u64;
            total += n;
            if n < run {
                break;
            }
        }

        self.physical_pos = curpos;
        self.logical_pos += total as u64;
        Ok(total)
    }

    /// Advances the logical position by `delta` bytes (sign-bearing),
    /// seeking over covered blocks so that exactly `|delta|` uncovered
    /// bytes are traversed.
    pub fn seek_cur(&mut self, delta: i64) -> io::Result<()> {
        let Some(map) = self.map.as_ref().filter(|m| m.guides_carving()) else {
            self.source.seek(SeekFrom::Current(delta))?;
            self.physical_pos = self.physical_pos.wrapping_add_signed(delta);
            self.logical_pos = self.logical_pos.wrapping_add_signed(delta);
            return Ok(());
        };
        let bs = map.block_size as u64;
        let nb = map.num_blocks;

        let mut phys = self.physical_pos;

        if delta >= 0 {
            let mut remaining = delta as u64;
            while remaining > 0 {
                let block = phys / bs;
                if block >= nb {
                    phys += remaining;
                    break;
                }
                let to_boundary = bs - phys % bs;
                if map.covered(block) {
                    phys += to_boundary;
                } else {
                    let step = to_boundary.min(remaining);
                    phys += step;
                    remaining -= step;
                }
            }
            self.logical_pos += delta as u64;
        } else {
            let mut remaining = delta.unsigned_abs();
            while remaining > 0 && phys > 0 {
                let block = (phys - 1) / bs;
                let boundary = block * bs;
                if block < nb && map.covered(block) {
                    phys = boundary;
                } else {
                    let step = (phys - boundary).min(remaining);
                    phys -= step;
                    remaining -= step;
                }
            }
            self.logical_pos -= delta.unsigned_abs() - remaining;
        }

        let phys_delta = phys as i64 - self.physical_pos as i64;
        self.source.seek(SeekFrom::Current(phys_delta))?;
        self.physical_pos = phys;
        Ok(())
    }

    /// Maps a logical offset back to the physical address of the
    /// uncovered byte it denotes. Used for audit entries and the
    /// header/footer database.
    pub fn to_physical(&self, logical: u64) -> u64 {
        match self.guide() {
            Some(map) => physical_of_logical(map, logical),
            None => logical,
        }
    }

    /// Expands a logical `[start, stop]` range into the physically
    /// contiguous fragments it occupies.
    pub fn fragments(&self, start: u64, stop: u64) -> Vec<Fragment> {
        let Some(map) = self.guide() else {
            return vec![Fragment { start, stop }];
        };

        let bs = map.block_size as u64;
        let nb = map.num_blocks;
        let needed = stop - start + 1;

        let mut curpos = physical_of_logical(map, start);
        let mut frags = Vec::new();
        let mut total = 0u64;

        while total < needed {
            let mut block = curpos / bs;

            while block < nb && map.covered(block) {
                curpos += bs - curpos % bs;
                block += 1;
            }

            let mut more = 0u64;
            while block < nb && !map.covered(block) && total + more < needed {
                more += bs - (curpos + more) % bs;
                block += 1;
            }
            if block >= nb {
                // past the mapped range everything is uncovered
                more = more.max(needed - total);
            }
            if total + more > needed {
                more = needed - total;
            }
            if more == 0 {
                break;
            }

            frags.push(Fragment {
                start: curpos,
                stop: curpos + more - 1,
            });
            curpos += more;
            total += more;
        }

        frags
    }
}

/// Covered bytes at or before `physical`, subtracted out.
fn logical_of_physical(map: &CoverageMap, physical: u64) -> u64 {
    let bs = map.block_size as u64;
    let mut decrease = 0u64;
    let end_block = physical / bs;
    for block in 0..end_block {
        if map.covered(block) {
            decrease += bs;
        }
    }
    if map.covered(end_block) {
        decrease += physical % bs;
    }
    physical - decrease
}

/// Physical address reached after traversing `logical` uncovered bytes
/// from the start of the image; the result always lands on an uncovered
/// byte.
fn physical_of_logical(map: &CoverageMap, logical: u64) -> u64 {
    let bs = map.block_size as u64;
    let nb = map.num_blocks;
    let mut phys = 0u64;
    let mut remaining = logical;
    let mut block = 0u64;

    while block < nb {
        if map.covered(block) {
            phys = (block + 1) * bs;
            block += 1;
            continue;
        }
        if remaining < bs {
            return phys + remaining;
        }
        remaining -= bs;
        phys += bs;
        block += 1;
    }
    phys + remaining
}
