use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use log::{error, info, LevelFilter};

use exhume_carver::audit::AuditLog;
use exhume_carver::spec::Catalog;
use exhume_carver::{Carver, CarverError, CarverOptions};

fn main() {
    let matches = Command::new("exhume_carver")
        .version(env!("CARGO_PKG_VERSION"))
        .author("ForensicXlab")
        .about("Carves files from a disk image based on file headers and footers.")
        .arg(
            Arg::new("missing_footers")
                .short('b')
                .action(ArgAction::SetTrue)
                .help("Carve files even if defined footers aren't discovered within the maximum carve size for the file type"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .value_name("file")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("carver.conf")
                .help("Choose configuration file"),
        )
        .arg(
            Arg::new("hfd")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Generate a header/footer database; discovers all footers, so performance suffers"),
        )
        .arg(
            Arg::new("file_list")
                .short('i')
                .value_name("file")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Read names of disk images from the specified file, one per line"),
        )
        .arg(
            Arg::new("coverage_update")
                .short('m')
                .value_name("blocksize")
                .value_parser(clap::value_parser!(u32).range(1..))
                .help("Generate/update the carve coverage blockmap file using this block size"),
        )
        .arg(
            Arg::new("no_suffix")
                .short('n')
                .action(ArgAction::SetTrue)
                .help("Don't add extensions to extracted files"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .value_name("dir")
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("carver-output")
                .help("Set output directory for carved files"),
        )
        .arg(
            Arg::new("flat")
                .short('O')
                .action(ArgAction::SetTrue)
                .help("Don't organize carved files into per-type subdirectories"),
        )
        .arg(
            Arg::new("preview")
                .short('p')
                .action(ArgAction::SetTrue)
                .help("Preview: the audit log indicates which files would have been carved, but none are written"),
        )
        .arg(
            Arg::new("aligned")
                .short('q')
                .value_name("clustersize")
                .value_parser(clap::value_parser!(u64).range(1..))
                .help("Carve only when the header is cluster-aligned"),
        )
        .arg(
            Arg::new("no_overlap")
                .short('r')
                .action(ArgAction::SetTrue)
                .help("Find only the first of overlapping headers/footers"),
        )
        .arg(
            Arg::new("skip")
                .short('s')
                .value_name("num")
                .value_parser(clap::value_parser!(u64))
                .help("Skip n bytes in each disk image before carving"),
        )
        .arg(
            Arg::new("coverage_dir")
                .short('t')
                .value_name("dir")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Set the directory for coverage blockmap files"),
        )
        .arg(
            Arg::new("coverage_use")
                .short('u')
                .action(ArgAction::SetTrue)
                .help("Use the carve coverage blockmap when carving; carve only sections whose blockmap entries are 0"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Verbose mode"),
        )
        .arg(
            Arg::new("images")
                .value_name("imgfile")
                .num_args(0..)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    env_logger::Builder::from_default_env()
        .filter_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .init();

    let output_dir: PathBuf = matches.get_one::<PathBuf>("output").cloned().unwrap_or_default();
    let coverage_update = matches.get_one::<u32>("coverage_update").copied();
    let aligned = matches.get_one::<u64>("aligned").copied();
    let opts = CarverOptions {
        coverage_dir: matches
            .get_one::<PathBuf>("coverage_dir")
            .cloned()
            .unwrap_or_else(|| output_dir.clone()),
        output_dir,
        config_file: matches.get_one::<PathBuf>("config").cloned().unwrap_or_default(),
        skip: matches.get_one::<u64>("skip").copied().unwrap_or(0),
        verbose,
        no_suffix: matches.get_flag("no_suffix"),
        carve_missing_footers: matches.get_flag("missing_footers"),
        no_search_overlap: matches.get_flag("no_overlap"),
        ignore_embedded: false,
        generate_hfd: matches.get_flag("hfd"),
        update_coverage: coverage_update.is_some(),
        coverage_block_size: coverage_update.unwrap_or(0),
        use_coverage: matches.get_flag("coverage_use"),
        organize_subdirectories: !matches.get_flag("flat"),
        max_files_per_subdir: 1000,
        block_aligned_only: aligned.is_some(),
        aligned_block_size: aligned.unwrap_or(0),
        preview: matches.get_flag("preview"),
    };

    let positional: Vec<PathBuf> = matches
        .get_many::<PathBuf>("images")
        .map(|v| v.cloned().collect())
        .unwrap_or_default();
    let file_list = matches.get_one::<PathBuf>("file_list").cloned();

    register_signal_handlers();

    let invocation: String = std::env::args().collect::<Vec<_>>().join(" ");
    if let Err(err) = run(opts, positional, file_list, &invocation) {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

fn run(
    opts: CarverOptions,
    positional: Vec<PathBuf>,
    file_list: Option<PathBuf>,
    invocation: &str,
) -> anyhow::Result<()> {
    let images = match file_list {
        Some(list) => {
            info!("batch mode: reading list of images from {}", list.display());
            let text = fs::read_to_string(&list)
                .with_context(|| format!("couldn't read image list {}", list.display()))?;
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(PathBuf::from)
                .collect()
        }
        None => positional,
    };
    if images.is_empty() {
        bail!("no image files specified");
    }

    let catalog = Catalog::load(&opts.config_file)?;

    // the audit file and output directory are prepared before any image
    // opens; failures here are fatal to the whole run
    let mut audit = AuditLog::open(&opts, invocation)?;

    let started = Instant::now();
    let mut failed = false;
    let mut interrupted = false;
    let mut carver = Carver::new(opts, catalog);

    for image in &images {
        match carver.process_image(&mut audit, image) {
            Ok(()) => {}
            Err(CarverError::Interrupted(signum)) => {
                error!("caught signal {}, program is terminating early", signum);
                let _ = audit.note(&format!(
                    "Caught signal {}. Program is terminating early.",
                    signum
                ));
                interrupted = true;
                break;
            }
            Err(err) => {
                // per-image failure: report it and move to the next image
                failed = true;
                error!("{}: {}", image.display(), err);
                let _ = audit.note(&format!("ERROR: {}: {}", image.display(), err));
            }
        }
    }

    if interrupted {
        let _ = audit.close();
        std::process::exit(1);
    }

    info!(
        "carving done, files carved = {}, elapsed = {} seconds",
        carver.files_written(),
        started.elapsed().as_secs()
    );
    audit.close()?;

    if failed {
        bail!("one or more images could not be processed");
    }
    Ok(())
}

#[cfg(unix)]
fn register_signal_handlers() {
    extern "C" fn handle(signum: libc::c_int) {
        exhume_carver::signal::raise(signum);
    }

    let handler = handle as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn register_signal_handlers() {}
