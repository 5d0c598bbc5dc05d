//! End-to-end carving scenarios over small synthetic images.

use std::fs;
use std::path::{Path, PathBuf};

use exhume_carver::audit::AuditLog;
use exhume_carver::spec::Catalog;
use exhume_carver::{Carver, CarverOptions};

struct Run {
    _dir: tempfile::TempDir,
    out: PathBuf,
    image: PathBuf,
    files_written: u64,
}

/// Carves `data` with the given rules and returns the run layout.
fn carve(config: &str, data: &[u8], tweak: impl FnOnce(&mut CarverOptions)) -> Run {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.dd");
    fs::write(&image, data).unwrap();

    let out = dir.path().join("out");
    let coverage_dir = dir.path().join("maps");
    fs::create_dir_all(&coverage_dir).unwrap();

    let mut opts = CarverOptions {
        output_dir: out.clone(),
        coverage_dir: coverage_dir.clone(),
        organize_subdirectories: false,
        ..Default::default()
    };
    tweak(&mut opts);

    let catalog = Catalog::parse(config).unwrap();
    let mut audit = AuditLog::open(&opts, "test-run").unwrap();
    let mut carver = Carver::new(opts, catalog);
    carver.process_image(&mut audit, &image).unwrap();
    audit.close().unwrap();

    Run {
        _dir: dir,
        out,
        image,
        files_written: carver.files_written(),
    }
}

fn audit_text(run: &Run) -> String {
    fs::read_to_string(run.out.join("audit.txt")).unwrap()
}

/// Carved payload files under the output directory, sorted by path.
fn carved_files(run: &Run) -> Vec<PathBuf> {
    fn walk(dir: &Path, into: &mut Vec<PathBuf>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, into);
            } else {
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                if name != "audit.txt" && !name.ends_with(".hfd") {
                    into.push(path);
                }
            }
        }
    }
    let mut files = Vec::new();
    walk(&run.out, &mut files);
    files.sort();
    files
}

fn audit_carve_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|l| l.starts_with("00") && (l.contains("YES") || l.contains("NO")))
        .map(str::to_string)
        .collect()
}

/// Writes a coverage blockmap file by hand: block size, then counters.
fn write_map(run_dir: &Path, image: &Path, block_size: u32, counters: &[u32]) -> PathBuf {
    let name = format!("{}.map", image.file_name().unwrap().to_string_lossy());
    let path = run_dir.join(name);
    let mut bytes = block_size.to_le_bytes().to_vec();
    for c in counters {
        bytes.extend_from_slice(&c.to_le_bytes());
    }
    fs::write(&path, bytes).unwrap();
    path
}

fn read_map(path: &Path) -> Vec<u32> {
    fs::read(path)
        .unwrap()
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
        .collect()
}

/// A JPEG header with no footer match is discarded by default.
#[test]
fn forward_without_footer_carves_nothing() {
    let mut data = vec![0u8, 0u8];
    data.extend_from_slice(b"\xff\xd8\xff\xe0");
    data.extend(std::iter::repeat(0x41u8).take(1022));
    data.extend_from_slice(b"\xff\x00");

    let run = carve("jpg y 1024 \\xff\\xd8\\xff\\xe0 \\xff\\xd9\n", &data, |_| {});
    assert!(carved_files(&run).is_empty());
    assert!(audit_carve_lines(&audit_text(&run)).is_empty());
    assert_eq!(run.files_written, 0);
}

/// The same image with missing-footer carving enabled yields one chopped
/// file of exactly the maximum carve length.
#[test]
fn forward_missing_footer_carves_chopped_maximum() {
    let mut data = vec![0u8, 0u8];
    data.extend_from_slice(b"\xff\xd8\xff\xe0");
    data.extend(std::iter::repeat(0x41u8).take(1022));
    data.extend_from_slice(b"\xff\x00");

    let run = carve("jpg y 1024 \\xff\\xd8\\xff\\xe0 \\xff\\xd9\n", &data, |o| {
        o.carve_missing_footers = true;
    });

    let files = carved_files(&run);
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_name().unwrap(), "00000000.jpg");

    let payload = fs::read(&files[0]).unwrap();
    assert_eq!(payload.len(), 1024);
    assert_eq!(payload, &data[2..2 + 1024]);

    let lines = audit_carve_lines(&audit_text(&run));
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("YES"));
    assert!(lines[0].contains(&format!("{:>13}", 2)));
    assert!(lines[0].contains(&format!("{:>13}", 1024)));
}

/// Overlapping headers each get their own carve; the tail header without
/// a footer becomes a two-byte chopped file at the image end.
#[test]
fn overlapping_headers_pair_in_order() {
    let run = carve("x y 4 AB BA\n", b"ABABABAB", |o| {
        o.carve_missing_footers = true;
    });

    let files = carved_files(&run);
    let contents: Vec<Vec<u8>> = files.iter().map(|f| fs::read(f).unwrap()).collect();
    assert_eq!(
        contents,
        vec![
            b"ABA".to_vec(),
            b"ABA".to_vec(),
            b"ABA".to_vec(),
            b"AB".to_vec(),
        ]
    );

    let names: Vec<_> = files
        .iter()
        .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec!["00000000.x", "00000001.x", "00000002.x", "00000003.x"]
    );
}

/// REVERSE picks the farthest footer within the maximum carve distance.
#[test]
fn reverse_takes_the_farthest_footer() {
    let run = carve("x y 15 H F REVERSE\n", b"H....F...F...F....", |_| {});

    let files = carved_files(&run);
    assert_eq!(files.len(), 1);
    let payload = fs::read(&files[0]).unwrap();
    assert_eq!(payload, b"H....F...F...F");
}

/// Only cluster-aligned headers survive the block-aligned filter.
#[test]
fn block_aligned_filter() {
    let mut data = vec![0u8; 1024];
    data[100..102].copy_from_slice(b"HD");
    data[512..514].copy_from_slice(b"HD");

    let run = carve("x y 16 HD\n", &data, |o| {
        o.block_aligned_only = true;
        o.aligned_block_size = 512;
    });

    let files = carved_files(&run);
    assert_eq!(files.len(), 1);
    let lines = audit_carve_lines(&audit_text(&run));
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains(&format!("{:>13}", 512)));
}

/// Preview mode produces the audit log but writes no carved file.
#[test]
fn preview_produces_audit_only() {
    let run = carve("x y 4 AB BA\n", b"ABABABAB", |o| {
        o.preview = true;
    });
    assert!(carved_files(&run).is_empty());
    assert_eq!(audit_carve_lines(&audit_text(&run)).len(), 3);
}

/// With a coverage map guiding carving, covered blocks vanish from the
/// logical stream and audit offsets come back as physical addresses.
#[test]
fn coverage_map_guides_carving() {
    // 16 bytes, 4-byte blocks; blocks 0 and 1 already claimed
    let data = b"AAAABBBBHDR.FTR.";

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.dd");
    fs::write(&image, data).unwrap();
    let out = dir.path().join("out");
    let maps = dir.path().join("maps");
    fs::create_dir_all(&maps).unwrap();
    let map_path = write_map(&maps, &image, 4, &[1, 1, 0, 0]);

    let opts = CarverOptions {
        output_dir: out.clone(),
        coverage_dir: maps,
        organize_subdirectories: false,
        use_coverage: true,
        update_coverage: true,
        coverage_block_size: 4,
        ..Default::default()
    };
    let catalog = Catalog::parse("t y 16 HDR FTR\n").unwrap();
    let mut audit = AuditLog::open(&opts, "test-run").unwrap();
    let mut carver = Carver::new(opts, catalog);
    carver.process_image(&mut audit, &image).unwrap();
    audit.close().unwrap();

    // carved payload is the logical range, headers seen at logical 0
    let carved = fs::read(out.join("00000000.t")).unwrap();
    assert_eq!(carved, b"HDR.FTR");

    // audit reports the physical fragment, past the covered blocks
    let text = fs::read_to_string(out.join("audit.txt")).unwrap();
    let line = text
        .lines()
        .find(|l| l.starts_with("00000000.t"))
        .unwrap();
    assert!(line.contains(&format!("{:>13}", 8)));
    assert!(line.contains(&format!("{:>13}", 7)));

    // every newly touched block gained exactly one count
    assert_eq!(read_map(&map_path), vec![4, 1, 1, 1, 1]);
}

/// A carve spanning a covered block splits into fragments whose
/// concatenation is exactly the carved payload.
#[test]
fn fragments_reassemble_across_covered_blocks() {
    // block 1 of three 4-byte blocks is covered
    let data = b"HDR.XXXX.FTR";

    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("image.dd");
    fs::write(&image, data).unwrap();
    let out = dir.path().join("out");
    let maps = dir.path().join("maps");
    fs::create_dir_all(&maps).unwrap();
    write_map(&maps, &image, 4, &[0, 1, 0]);

    let opts = CarverOptions {
        output_dir: out.clone(),
        coverage_dir: maps,
        organize_subdirectories: false,
        use_coverage: true,
        ..Default::default()
    };
    let catalog = Catalog::parse("t y 16 HDR FTR\n").unwrap();
    let mut audit = AuditLog::open(&opts, "test-run").unwrap();
    let mut carver = Carver::new(opts, catalog);
    carver.process_image(&mut audit, &image).unwrap();
    audit.close().unwrap();

    let carved = fs::read(out.join("00000000.t")).unwrap();
    assert_eq!(carved, b"HDR..FTR");

    // two audit lines, one per physical fragment, lengths summing to the
    // logical carve length
    let text = fs::read_to_string(out.join("audit.txt")).unwrap();
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("00000000.t"))
        .collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains(&format!("{:>13}", 0)));
    assert!(lines[0].contains(&format!("{:>13}", 4)));
    assert!(lines[1].contains(&format!("{:>13}", 8)));
    assert!(lines[1].contains(&format!("{:>13}", 4)));

    // fragment payloads concatenate to the carved file
    let mut reassembled = data[0..4].to_vec();
    reassembled.extend_from_slice(&data[8..12]);
    assert_eq!(reassembled, carved);
}

/// The header/footer database round-trips every discovered offset.
#[test]
fn hfd_records_all_offsets() {
    let run = carve("x y 4 AB BA\n", b"ABABABAB", |o| {
        o.generate_hfd = true;
    });

    let hfd = fs::read_to_string(
        run.out
            .join(format!("{}.hfd", run.image.file_name().unwrap().to_string_lossy())),
    )
    .unwrap();

    let lines: Vec<&str> = hfd.lines().collect();
    assert_eq!(lines, vec!["x", "4", "0", "2", "4", "6", "3", "1", "3", "5"]);
}

/// Output numbering keeps counting across images in a batch.
#[test]
fn batch_numbering_is_globally_monotonic() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.dd");
    let second = dir.path().join("second.dd");
    fs::write(&first, b"AB..BA").unwrap();
    fs::write(&second, b"AB..BA").unwrap();
    let out = dir.path().join("out");

    let opts = CarverOptions {
        output_dir: out.clone(),
        coverage_dir: dir.path().to_path_buf(),
        organize_subdirectories: false,
        ..Default::default()
    };
    let catalog = Catalog::parse("x y 8 AB BA\n").unwrap();
    let mut audit = AuditLog::open(&opts, "test-run").unwrap();
    let mut carver = Carver::new(opts, catalog);
    carver.process_image(&mut audit, &first).unwrap();
    carver.process_image(&mut audit, &second).unwrap();
    audit.close().unwrap();

    assert!(out.join("00000000.x").is_file());
    assert!(out.join("00000001.x").is_file());
    assert_eq!(carver.files_written(), 2);
}

/// A carve spanning several scan windows is reassembled byte-for-byte.
#[test]
fn multi_window_carves_are_exact() {
    // windows are 10 MiB; build a 21 MiB image with one file crossing
    // two window boundaries
    let chunk = exhume_carver::CHUNK;
    let mut data = vec![0u8; 2 * chunk + chunk / 2];
    let start = chunk - 7;
    let footer_at = 2 * chunk + 11;
    data[start..start + 2].copy_from_slice(b"HD");
    for (i, b) in data[start + 2..footer_at].iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    data[footer_at..footer_at + 2].copy_from_slice(b"FT");

    let run = carve("x y 99999999 HD FT\n", &data, |_| {});

    let files = carved_files(&run);
    assert_eq!(files.len(), 1);
    let payload = fs::read(&files[0]).unwrap();
    assert_eq!(payload.len(), footer_at + 2 - start);
    assert_eq!(payload, &data[start..footer_at + 2]);
}
