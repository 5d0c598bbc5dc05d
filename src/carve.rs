//! Pass 2: pair headers with footers, then extract everything in one
//! sequential sweep.
//!
//! Planning walks every rule's discovered headers in declaration order
//! and derives a stop offset according to the rule's search semantics,
//! producing one [`CarveTask`] per surviving header. Tasks are threaded
//! into per-window work queues so the executor can touch each image
//! window exactly once: a task whose bytes span several windows gets a
//! `Start` entry, any number of `Continue` entries and a final `Stop`
//! entry. Output files open lazily and close either terminally (last
//! byte written, audit emitted, coverage counters bumped) or temporarily
//! when the open-file budget is exceeded.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::SeekFrom;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{debug, info};

use crate::audit::{self, AuditLog};
use crate::coverage::LogicalImage;
use crate::dig::DigState;
use crate::image::{Image, ImageSource};
use crate::matcher::hex_notation;
use crate::spec::SearchMode;
use crate::{signal, Carver, CarverError, Result, CHUNK};

/// Output handles allowed open at once during the carving sweep.
#[cfg(unix)]
pub const OPEN_BUDGET: usize = 512;
#[cfg(not(unix))]
pub const OPEN_BUDGET: usize = 20;

/// One scheduled extraction: destination, inclusive logical byte range,
/// and the lazily managed output handle.
struct CarveTask {
    filename: PathBuf,
    start: u64,
    stop: u64,
    /// Length was capped by the rule's maximum rather than ended by a
    /// footer.
    chopped: bool,
    sink: Sink,
}

/// Output handle state. `Simulated` marks a preview-mode task that is
/// logically open but has no file behind it.
enum Sink {
    Closed,
    Open(fs::File),
    Simulated,
}

impl Sink {
    fn is_closed(&self) -> bool {
        matches!(self, Sink::Closed)
    }
}

/// What the executor must do with a task in the current window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    /// Task starts and ends inside this window.
    StartStop,
    /// First bytes of the task are in this window.
    Start,
    /// Last bytes of the task are in this window.
    Stop,
    /// The whole window belongs to the task.
    Continue,
}

type TaskRef = Rc<RefCell<CarveTask>>;

/// The planned workload for one image: per-window FIFO queues plus the
/// flat task list in planning order.
struct CarvePlan {
    queues: Vec<VecDeque<(TaskRef, Op)>>,
    planned: usize,
}

impl Carver {
    /// Executes pass 2 for one image using the offsets dug by pass 1.
    pub(crate) fn carve_image(
        &mut self,
        audit: &mut AuditLog,
        image_path: &Path,
        dug: DigState,
    ) -> Result<()> {
        let DigState { image_size, map } = dug;

        // absolute offset one past the last carvable byte
        let end_pos = self.opts.skip + image_size;

        let mut plan = self.build_plan(end_pos)?;
        self.report_workload(plan.planned);

        if self.opts.preview {
            info!("preview mode: generating audit log only, no files will be carved");
        }

        let mut image = Image::open(image_path).map_err(|source| CarverError::FileOpen {
            path: image_path.to_path_buf(),
            source,
        })?;
        if self.opts.skip > 0 {
            image
                .seek(SeekFrom::Start(self.opts.skip))
                .map_err(|source| CarverError::FileRead {
                    path: image_path.to_path_buf(),
                    source,
                })?;
        }
        let mut view =
            LogicalImage::new(image, map).map_err(|source| CarverError::FileRead {
                path: image_path.to_path_buf(),
                source,
            })?;

        info!("image file pass 2/2");
        let mut open_files = 0usize;

        'sweep: loop {
            signal::check()?;

            // big-seek optimisation: jump over windows with no work
            let mut pos = view.tell();
            let mut big_seek = 0u64;
            while plan.queues[(pos / CHUNK as u64) as usize].is_empty() {
                // step to the next window boundary (the first window after
                // a skip prefix may be short)
                let step = CHUNK as u64 - pos % CHUNK as u64;
                big_seek += step;
                pos += step;
                if pos > end_pos {
                    break 'sweep;
                }
            }
            if big_seek > 0 {
                view.seek_cur(big_seek as i64)
                    .map_err(|source| CarverError::FileRead {
                        path: image_path.to_path_buf(),
                        source,
                    })?;
            }

            // read up to the next window boundary, or just measure the
            // window in preview mode
            let window_len = (CHUNK as u64 - pos % CHUNK as u64) as usize;
            let n = if self.opts.preview {
                view.seek_cur(window_len as i64)
                    .map_err(|source| CarverError::FileRead {
                        path: image_path.to_path_buf(),
                        source,
                    })?;
                (view.tell() - pos) as usize
            } else {
                view.read(&mut self.buf[..window_len])
                    .map_err(|source| CarverError::FileRead {
                        path: image_path.to_path_buf(),
                        source,
                    })?
            };
            if n == 0 {
                break;
            }

            let window_base = view.tell() - n as u64;
            let queue = &mut plan.queues[(window_base / CHUNK as u64) as usize];

            for (task, op) in queue.drain(..) {
                let mut carve = task.borrow_mut();

                // open lazily, and reopen a sink recycled under budget
                // pressure
                if matches!(op, Op::Start | Op::StartStop) || carve.sink.is_closed() {
                    if self.opts.preview {
                        carve.sink = Sink::Simulated;
                    } else {
                        debug!("opening {}", carve.filename.display());
                        let file = OpenOptions::new()
                            .append(true)
                            .create(true)
                            .open(&carve.filename)
                            .map_err(|source| CarverError::FileWrite {
                                path: carve.filename.clone(),
                                source,
                            })?;
                        carve.sink = Sink::Open(file);
                    }
                    open_files += 1;
                }

                let (offset, length) = match op {
                    Op::Continue => (0usize, n),
                    Op::StartStop => (
                        (carve.start - window_base) as usize,
                        (carve.stop - carve.start + 1) as usize,
                    ),
                    Op::Start => {
                        let offset = (carve.start - window_base) as usize;
                        let wanted = carve.stop - carve.start + 1;
                        (offset, wanted.min((CHUNK - offset) as u64) as usize)
                    }
                    Op::Stop => (0usize, (carve.stop - window_base + 1) as usize),
                };
                // a gap-compacted stream can end before a clamped stop
                let length = length.min(n.saturating_sub(offset));

                if let Sink::Open(file) = &mut carve.sink {
                    file.write_all(&self.buf[offset..offset + length])
                        .map_err(|source| CarverError::FileWrite {
                            path: carve.filename.clone(),
                            source,
                        })?;
                }

                // close terminally, or temporarily when too many sinks
                // are open
                let terminal = matches!(op, Op::Stop | Op::StartStop);
                if terminal || open_files >= OPEN_BUDGET {
                    if !carve.sink.is_closed() {
                        debug!("closing {}", carve.filename.display());
                        carve.sink = Sink::Closed;
                        open_files -= 1;
                    }

                    if terminal {
                        for frag in view.fragments(carve.start, carve.stop) {
                            audit.fragment(&carve.filename, &frag, carve.chopped, image_path)?;
                            if let Some(map) = view.map_mut() {
                                map.record(&frag)?;
                            }
                        }
                    }
                }
            }
        }

        if self.opts.generate_hfd {
            audit::write_hfd(&self.opts, &self.catalog, image_path, &view)?;
        }

        self.catalog.clear_offsets();
        info!("processing of image file complete");
        Ok(())
    }

    /// Pairs headers to footers per the rule semantics and threads the
    /// surviving tasks into per-window queues. `end_pos` is the absolute
    /// offset one past the last carvable byte.
    fn build_plan(&mut self, end_pos: u64) -> Result<CarvePlan> {
        let num_queues = 2 + (end_pos / CHUNK as u64) as usize;
        let mut queues: Vec<VecDeque<(TaskRef, Op)>> = Vec::with_capacity(num_queues);
        queues.resize_with(num_queues, VecDeque::new);
        let mut planned = 0usize;

        for rule_index in 0..self.catalog.specs.len() {
            // footers are sorted, so a footer known to precede one header
            // also precedes every later header of the rule
            let mut footer_cursor = 0usize;

            for header_index in 0..self.catalog.specs[rule_index].offsets.headers.len() {
                let spec = &self.catalog.specs[rule_index];
                let start = spec.offsets.headers[header_index];

                if self.opts.block_aligned_only && start % self.opts.aligned_block_size != 0 {
                    continue;
                }

                let footers = &spec.offsets.footers;
                while footer_cursor < footers.len() && footers[footer_cursor] <= start {
                    footer_cursor += 1;
                }

                let max_stop = start + spec.max_length - 1;
                let mut chopped = false;
                let stop = match (&spec.footer, spec.mode) {
                    (None, _) => {
                        // no footer for this type: carve the maximum and
                        // admit we never saw the real end
                        chopped = true;
                        Some(max_stop)
                    }
                    (Some(footer), SearchMode::Forward) => {
                        match footers.get(footer_cursor) {
                            Some(&f) if f + footer.len() as u64 - 1 <= max_stop => {
                                Some(f + footer.len() as u64 - 1)
                            }
                            _ if self.opts.carve_missing_footers => {
                                chopped = true;
                                Some(max_stop)
                            }
                            _ => None,
                        }
                    }
                    (Some(_), SearchMode::ForwardNext) => match footers.get(footer_cursor) {
                        Some(&f) if f - 1 <= max_stop => Some(f - 1),
                        _ => {
                            chopped = true;
                            Some(max_stop)
                        }
                    },
                    (Some(footer), SearchMode::Reverse) => {
                        let mut best = None;
                        for &f in &footers[footer_cursor..] {
                            if f - start > spec.max_length {
                                break;
                            }
                            best = Some(f + footer.len() as u64 - 1);
                        }
                        best
                    }
                };

                let Some(stop) = stop else {
                    continue;
                };
                let stop = stop.min(end_pos - 1);

                let filename = self.output_filename(rule_index)?;
                planned += 1;

                let task = Rc::new(RefCell::new(CarveTask {
                    filename,
                    start,
                    stop,
                    chopped,
                    sink: Sink::Closed,
                }));

                let header_window = (start / CHUNK as u64) as usize;
                let footer_window = (stop / CHUNK as u64) as usize;
                if header_window == footer_window {
                    queues[header_window].push_back((task, Op::StartStop));
                } else {
                    queues[header_window].push_back((Rc::clone(&task), Op::Start));
                    queues[footer_window].push_back((Rc::clone(&task), Op::Stop));
                    for window in header_window + 1..footer_window {
                        queues[window].push_back((Rc::clone(&task), Op::Continue));
                    }
                }
            }
        }

        Ok(CarvePlan { queues, planned })
    }

    /// Next output path for a carve of rule `rule_index`, advancing the
    /// global file counter and the rule's subdirectory bucket.
    fn output_filename(&mut self, rule_index: usize) -> Result<PathBuf> {
        let spec = &mut self.catalog.specs[rule_index];

        let dir = if self.opts.organize_subdirectories {
            let dir = self.opts.output_dir.join(format!(
                "{}-{}-{}",
                spec.suffix_label(),
                rule_index,
                spec.organize_dir_seq
            ));
            if !self.opts.preview {
                fs::create_dir_all(&dir).map_err(|source| CarverError::FileWrite {
                    path: dir.clone(),
                    source,
                })?;
            }
            dir
        } else {
            self.opts.output_dir.clone()
        };

        let name = match &spec.suffix {
            Some(suffix) if !self.opts.no_suffix => {
                format!("{:08}.{}", self.files_written, suffix)
            }
            _ => format!("{:08}", self.files_written),
        };

        self.files_written += 1;
        spec.files_to_carve += 1;
        if spec.files_to_carve % self.opts.max_files_per_subdir == 0 {
            spec.organize_dir_seq += 1;
        }

        Ok(dir.join(name))
    }

    /// Logs one line per rule summarising the planned workload.
    fn report_workload(&self, planned: usize) {
        info!("carve lists built, workload ({} files):", planned);
        for spec in &self.catalog.specs {
            let footer = match &spec.footer {
                Some(f) => hex_notation(f.bytes()),
                None => "NONE".to_string(),
            };
            info!(
                "{} with header \"{}\" and footer \"{}\" --> {} files",
                spec.suffix_label(),
                hex_notation(spec.header.bytes()),
                footer,
                spec.files_to_carve
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Catalog;
    use crate::CarverOptions;

    /// Builds a carver with synthetic pass-1 offsets and returns the
    /// planned tasks in planning order.
    fn plan(
        config: &str,
        headers: &[u64],
        footers: &[u64],
        image_size: u64,
        opts: CarverOptions,
    ) -> Vec<(PathBuf, u64, u64, bool)> {
        let opts = CarverOptions {
            preview: true, // keep the planner from touching the filesystem
            ..opts
        };
        let mut catalog = Catalog::parse(config).unwrap();
        catalog.specs[0].offsets.headers = headers.to_vec();
        catalog.specs[0].offsets.footers = footers.to_vec();

        let mut carver = Carver::new(opts, catalog);
        let plan = carver.build_plan(image_size).unwrap();

        // walk the queues in window order collecting unique tasks
        let mut seen = Vec::new();
        for queue in &plan.queues {
            for (task, op) in queue {
                if matches!(op, Op::Start | Op::StartStop) {
                    let t = task.borrow();
                    seen.push((t.filename.clone(), t.start, t.stop, t.chopped));
                }
            }
        }
        seen
    }

    #[test]
    fn forward_includes_the_footer() {
        let tasks = plan("x y 100 HD FT\n", &[10], &[40], 1000, Default::default());
        assert_eq!(tasks.len(), 1);
        let (_, start, stop, chopped) = &tasks[0];
        assert_eq!((*start, *stop), (10, 41));
        assert!(!chopped);
    }

    #[test]
    fn forward_without_footer_is_discarded_unless_requested() {
        let none = plan("x y 100 HD FT\n", &[10], &[], 1000, Default::default());
        assert!(none.is_empty());

        let forced = plan(
            "x y 100 HD FT\n",
            &[10],
            &[],
            1000,
            CarverOptions {
                carve_missing_footers: true,
                ..Default::default()
            },
        );
        assert_eq!(forced.len(), 1);
        let (_, start, stop, chopped) = &forced[0];
        assert_eq!((*start, *stop), (10, 109));
        assert!(chopped);
    }

    #[test]
    fn forward_too_distant_footer_counts_as_missing() {
        // footer ends past max_length from the header
        let none = plan("x y 20 HD FT\n", &[10], &[40], 1000, Default::default());
        assert!(none.is_empty());

        let forced = plan(
            "x y 20 HD FT\n",
            &[10],
            &[40],
            1000,
            CarverOptions {
                carve_missing_footers: true,
                ..Default::default()
            },
        );
        let (_, start, stop, chopped) = &forced[0];
        assert_eq!((*start, *stop), (10, 29));
        assert!(chopped);
    }

    #[test]
    fn forward_next_excludes_the_footer_and_falls_back() {
        let tasks = plan("x y 100 HD FT NEXT\n", &[10], &[40], 1000, Default::default());
        let (_, start, stop, chopped) = &tasks[0];
        assert_eq!((*start, *stop), (10, 39));
        assert!(!chopped);

        let fallback = plan("x y 100 HD FT NEXT\n", &[10], &[], 1000, Default::default());
        let (_, start, stop, chopped) = &fallback[0];
        assert_eq!((*start, *stop), (10, 109));
        assert!(chopped);
    }

    #[test]
    fn reverse_takes_the_farthest_footer_within_reach() {
        // footers at 20, 40, 60 with max_length 45: 60 - 10 > 45, so 40
        // wins; footer length 2 is included
        let tasks = plan(
            "x y 45 HD FT REVERSE\n",
            &[10],
            &[20, 40, 60],
            1000,
            Default::default(),
        );
        let (_, start, stop, chopped) = &tasks[0];
        assert_eq!((*start, *stop), (10, 41));
        assert!(!chopped);

        let none = plan("x y 45 HD FT REVERSE\n", &[10], &[], 1000, Default::default());
        assert!(none.is_empty());
    }

    #[test]
    fn headers_pair_with_strictly_later_footers() {
        // overlapping-header scenario: AB at 0,2,4,6 / BA at 1,3,5
        let tasks = plan(
            "x y 4 AB BA\n",
            &[0, 2, 4, 6],
            &[1, 3, 5],
            8, // the image is just "ABABABAB"
            CarverOptions {
                carve_missing_footers: true,
                ..Default::default()
            },
        );
        let pairs: Vec<(u64, u64, bool)> =
            tasks.iter().map(|(_, s, e, c)| (*s, *e, *c)).collect();
        assert_eq!(
            pairs,
            vec![
                (0, 2, false),
                (2, 4, false),
                (4, 6, false),
                (6, 7, true), // no footer after 6: 2-byte chopped carve
            ]
        );
    }

    #[test]
    fn block_aligned_filter_drops_unaligned_headers() {
        let tasks = plan(
            "x y 100 HD FT\n",
            &[100, 512],
            &[700],
            100000,
            CarverOptions {
                block_aligned_only: true,
                aligned_block_size: 512,
                carve_missing_footers: true,
                ..Default::default()
            },
        );
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].1, 512);
    }

    #[test]
    fn stop_is_clamped_to_the_image_end() {
        let tasks = plan(
            "x y 1000 HD\n",
            &[50],
            &[],
            100, // image ends at offset 99
            Default::default(),
        );
        let (_, start, stop, chopped) = &tasks[0];
        assert_eq!((*start, *stop), (50, 99));
        assert!(chopped);
    }

    #[test]
    fn filenames_are_monotonic_and_zero_padded() {
        let tasks = plan(
            "jpg y 30 HD FT\n",
            &[0, 100, 200],
            &[10, 110, 210],
            1000,
            CarverOptions {
                organize_subdirectories: false,
                ..Default::default()
            },
        );
        let names: Vec<String> = tasks
            .iter()
            .map(|(p, ..)| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["00000000.jpg", "00000001.jpg", "00000002.jpg"]);
    }

    #[test]
    fn organised_outputs_bucket_by_rule_and_sequence() {
        let opts = CarverOptions {
            max_files_per_subdir: 2,
            ..Default::default()
        };
        let tasks = plan(
            "jpg y 30 HD FT\n",
            &[0, 100, 200],
            &[10, 110, 210],
            1000,
            opts,
        );
        let dirs: Vec<String> = tasks
            .iter()
            .map(|(p, ..)| {
                p.parent()
                    .unwrap()
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        // the bucket advances after the second planned file
        assert_eq!(dirs, vec!["jpg-0-0", "jpg-0-0", "jpg-0-1"]);
    }

    #[test]
    fn task_windows_get_start_continue_stop_entries() {
        let chunk = CHUNK as u64;
        let mut catalog = Catalog::parse("x y 99999999999 HD FT\n").unwrap();
        catalog.specs[0].offsets.headers = vec![10];
        catalog.specs[0].offsets.footers = vec![3 * chunk + 100];

        let mut carver = Carver::new(
            CarverOptions {
                preview: true,
                ..Default::default()
            },
            catalog,
        );
        let plan = carver.build_plan(4 * chunk).unwrap();

        let ops: Vec<Vec<Op>> = plan
            .queues
            .iter()
            .map(|q| q.iter().map(|(_, op)| *op).collect())
            .collect();
        assert_eq!(ops[0], vec![Op::Start]);
        assert_eq!(ops[1], vec![Op::Continue]);
        assert_eq!(ops[2], vec![Op::Continue]);
        assert_eq!(ops[3], vec![Op::Stop]);
    }
}
