//! Signature catalogue: the in-memory table of file-type rules.
//!
//! Rules are loaded once from a line-oriented configuration file and live
//! for the duration of the program. Each rule compiles its header and
//! footer patterns (see [`crate::matcher`]) up front; the per-rule offset
//! database is re-populated by pass 1 for every image and cleared between
//! images.

use std::fs;
use std::path::Path;

use log::warn;

use crate::matcher::{Pattern, DEFAULT_WILDCARD};
use crate::{CarverError, Result};

/// Upper bound on the number of configured file types.
pub const MAX_FILE_TYPES: usize = 100;

/// Sentinel suffix meaning "carve without a filename extension".
pub const NO_EXTENSION_SUFFIX: &str = "NONE";

/// Footer pairing semantics for a rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchMode {
    /// Stop at the first footer after the header; footer included.
    Forward,
    /// Stop at the first footer after the header; footer excluded, and a
    /// missing or too-distant footer falls back to the maximum length.
    ForwardNext,
    /// Stop at the farthest footer within the maximum length; footer
    /// included.
    Reverse,
}

/// Absolute image offsets discovered by pass 1, one pair of sequences per
/// rule. The sequential scan appends in non-decreasing order, so both
/// sequences are always sorted.
#[derive(Clone, Debug, Default)]
pub struct OffsetDb {
    pub headers: Vec<u64>,
    pub footers: Vec<u64>,
}

impl OffsetDb {
    pub fn clear(&mut self) {
        self.headers.clear();
        self.footers.clear();
    }
}

/// One file-type rule from the configuration.
pub struct SearchSpec {
    /// Extension for carved files; `None` is the "no extension" sentinel.
    pub suffix: Option<String>,
    pub case_sensitive: bool,
    /// Maximum number of bytes to carve from a header.
    pub max_length: u64,
    pub header: Pattern,
    pub footer: Option<Pattern>,
    pub mode: SearchMode,
    pub offsets: OffsetDb,
    /// Files planned for this rule so far; persists across images so that
    /// output numbering and bucketing never restart mid-batch.
    pub files_to_carve: u64,
    /// Current organisation-subdirectory sequence number for this rule.
    pub organize_dir_seq: u64,
}

impl SearchSpec {
    /// Suffix as displayed in reports and used for subdirectory names.
    pub fn suffix_label(&self) -> &str {
        self.suffix.as_deref().unwrap_or(NO_EXTENSION_SUFFIX)
    }

    pub fn footer_len(&self) -> usize {
        self.footer.as_ref().map_or(0, |f| f.len())
    }
}

/// The loaded catalogue, in declaration order. Order matters: it fixes the
/// deterministic numbering of carved files.
pub struct Catalog {
    pub specs: Vec<SearchSpec>,
    /// Wildcard byte in effect after parsing (the `wildcard` directive can
    /// change it mid-file for subsequent rules).
    pub wildcard: u8,
}

impl Catalog {
    /// Reads and parses a configuration file.
    pub fn load(path: &Path) -> Result<Catalog> {
        let text = fs::read_to_string(path).map_err(|source| CarverError::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Catalog::parse(&text)
    }

    /// Parses configuration text. Grammar per line:
    /// `suffix case(y/n) max_length header [footer] [mode]`, `#` comments,
    /// and the `wildcard <char>` directive.
    pub fn parse(text: &str) -> Result<Catalog> {
        let mut specs: Vec<SearchSpec> = Vec::new();
        let mut wildcard = DEFAULT_WILDCARD;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();

            if fields[0].eq_ignore_ascii_case("wildcard") {
                match fields.get(1) {
                    Some(tok) => {
                        let translated =
                            translate(tok).map_err(|reason| config_error(line_no, &reason))?;
                        if translated.len() > 1 {
                            warn!(
                                "line {}: wildcard must be a single character, using the first",
                                line_no
                            );
                        }
                        if let Some(&b) = translated.first() {
                            wildcard = b;
                        }
                    }
                    None => {
                        warn!("line {}: empty wildcard directive ignored", line_no);
                    }
                }
                continue;
            }

            if fields.len() < 4 || fields.len() > 6 {
                return Err(config_error(
                    line_no,
                    &format!("expected 4 to 6 fields, found {}", fields.len()),
                ));
            }
            if specs.len() >= MAX_FILE_TYPES {
                return Err(CarverError::TooManyTypes(MAX_FILE_TYPES));
            }

            let suffix = if fields[0].eq_ignore_ascii_case(NO_EXTENSION_SUFFIX) {
                None
            } else {
                Some(fields[0].to_string())
            };

            let case_sensitive = {
                let c = fields[1].to_ascii_lowercase();
                c == "y" || c == "yes"
            };

            let max_length: u64 = fields[2]
                .parse()
                .map_err(|_| config_error(line_no, "invalid maximum carve length"))?;
            if max_length == 0 {
                return Err(config_error(line_no, "maximum carve length must be positive"));
            }

            let header_bytes =
                translate(fields[3]).map_err(|reason| config_error(line_no, &reason))?;
            if header_bytes.is_empty() {
                return Err(config_error(line_no, "header pattern is empty"));
            }
            let header = Pattern::new(header_bytes, case_sensitive, wildcard);

            let footer = match fields.get(4) {
                Some(tok) if !tok.is_empty() => {
                    let bytes =
                        translate(tok).map_err(|reason| config_error(line_no, &reason))?;
                    if bytes.is_empty() {
                        None
                    } else {
                        Some(Pattern::new(bytes, case_sensitive, wildcard))
                    }
                }
                _ => None,
            };

            let mode = match fields.get(5) {
                Some(tok) if tok.eq_ignore_ascii_case("reverse") => SearchMode::Reverse,
                Some(tok)
                    if tok.eq_ignore_ascii_case("next")
                        || tok.eq_ignore_ascii_case("forward_next") =>
                {
                    SearchMode::ForwardNext
                }
                _ => SearchMode::Forward,
            };

            specs.push(SearchSpec {
                suffix,
                case_sensitive,
                max_length,
                header,
                footer,
                mode,
                offsets: OffsetDb::default(),
                files_to_carve: 0,
                organize_dir_seq: 0,
            });
        }

        Ok(Catalog { specs, wildcard })
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Longest header or footer across all rules; the dig loop rewinds by
    /// one less than this between windows.
    pub fn longest_needle(&self) -> usize {
        self.specs
            .iter()
            .map(|s| s.header.len().max(s.footer_len()))
            .max()
            .unwrap_or(0)
    }

    /// Clears every rule's offset database between images.
    pub fn clear_offsets(&mut self) {
        for spec in &mut self.specs {
            spec.offsets.clear();
        }
    }
}

fn config_error(line: usize, reason: &str) -> CarverError {
    CarverError::GeneralAbort(format!("configuration line {}: {}", line, reason))
}

/// Translates a header/footer literal into raw bytes.
///
/// Recognised escapes: `\xHH`, `\r`, `\n`, `\t`, `\s` (space) and `\\`.
/// Any other backslash sequence is kept literally. The wildcard byte is
/// stored as-is; the matcher gives it its meaning.
fn translate(token: &str) -> std::result::Result<Vec<u8>, String> {
    let raw = token.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;

    while i < raw.len() {
        if raw[i] != b'\\' || i + 1 == raw.len() {
            out.push(raw[i]);
            i += 1;
            continue;
        }
        match raw[i + 1] {
            b'x' => {
                if i + 3 >= raw.len() {
                    return Err(format!("truncated \\x escape in \"{}\"", token));
                }
                let hex = std::str::from_utf8(&raw[i + 2..i + 4])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| format!("invalid \\x escape in \"{}\"", token))?;
                out.push(hex);
                i += 4;
            }
            b'r' => {
                out.push(b'\r');
                i += 2;
            }
            b'n' => {
                out.push(b'\n');
                i += 2;
            }
            b't' => {
                out.push(b'\t');
                i += 2;
            }
            b's' => {
                out.push(b' ');
                i += 2;
            }
            b'\\' => {
                out.push(b'\\');
                i += 2;
            }
            other => {
                out.push(b'\\');
                out.push(other);
                i += 2;
            }
        }
    }
    Ok(out)
}
