//! File-level checks run before a single chunk exists.
//!
//! Every problem found is reported, not just the first; only a file that cannot
//! be opened stops the checks early. Checksum and content scan share one
//! streaming pass so large files are read once for both.

use md5::Context;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

/// A reason to reject a file. All of them are fatal for the upload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationIssue {
    #[error("file not found: {0}")]
    Missing(String),

    #[error("file cannot be read: {0}")]
    Unreadable(String),

    #[error("file is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("{origin} content type '{mime}' is not allowed")]
    MimeNotAllowed { mime: String, origin: &'static str },

    #[error("header cannot be parsed: {0}")]
    BadHeader(String),

    #[error("missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("line {line}: rejected content ({pattern})")]
    UnsafeContent { line: u64, pattern: &'static str },
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub size: u64,
    /// MD5 computed while scanning, lower-case hex. Empty if the file was unreadable.
    pub checksum: String,
    pub detected_mime: String,
}

impl ValidationReport {
    fn rejected(issue: ValidationIssue, detected_mime: String) -> Self {
        ValidationReport {
            valid: false,
            errors: vec![issue],
            size: 0,
            checksum: String::new(),
            detected_mime,
        }
    }

    pub fn reasons(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }
}

const UNSAFE_PATTERNS: [(&str, &str); 6] = [
    ("script tag", r"(?i)<\s*/?\s*script\b"),
    ("javascript url", r"(?i)\bjavascript\s*:"),
    ("path traversal", r"\.\./|\.\.\\"),
    (
        "sql injection",
        r"(?i);\s*(drop|delete|truncate|alter)\s+(table|database)\b|\bunion\s+(all\s+)?select\b|'\s*or\s+'1'\s*=\s*'1",
    ),
    (
        "formula injection",
        r#"(?i)(^|[,;\t])\s*"?[=@+\-]\s*[a-z]+\s*[(|]"#,
    ),
    ("binary content", r"\x00"),
];

pub struct FileValidator {
    max_file_size: u64,
    required_columns: Vec<String>,
    allowed_mime_types: Vec<String>,
    patterns: Vec<(&'static str, Regex)>,
}

fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

impl FileValidator {
    pub fn new(
        max_file_size: u64,
        required_columns: Vec<String>,
        allowed_mime_types: Vec<String>,
    ) -> Result<Self, regex::Error> {
        let patterns = UNSAFE_PATTERNS
            .iter()
            .map(|(name, pattern)| Ok((*name, Regex::new(pattern)?)))
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(FileValidator {
            max_file_size,
            required_columns,
            allowed_mime_types: allowed_mime_types
                .iter()
                .map(|m| normalize_mime(m))
                .collect(),
            patterns,
        })
    }

    fn mime_allowed(&self, mime: &str) -> bool {
        self.allowed_mime_types.iter().any(|m| m == mime)
    }

    pub fn validate(
        &self,
        file_path: &Path,
        declared_checksum: Option<&str>,
        declared_mime: &str,
        original_name: &str,
    ) -> ValidationReport {
        let guessed = mime_guess::from_path(original_name).first();
        let detected_mime = guessed
            .as_ref()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        if !file_path.exists() {
            return ValidationReport::rejected(
                ValidationIssue::Missing(file_path.display().to_string()),
                detected_mime,
            );
        }
        let file = match File::open(file_path) {
            Ok(file) => file,
            Err(e) => {
                return ValidationReport::rejected(
                    ValidationIssue::Unreadable(e.to_string()),
                    detected_mime,
                )
            }
        };

        let mut errors = Vec::new();
        let size = file.metadata().map(|m| m.len()).unwrap_or_default();
        if size > self.max_file_size {
            errors.push(ValidationIssue::TooLarge {
                size,
                max: self.max_file_size,
            });
        }

        let (checksum, scan_issues) = match self.scan(file) {
            Ok(result) => result,
            Err(e) => {
                errors.push(ValidationIssue::Unreadable(e.to_string()));
                (String::new(), Vec::new())
            }
        };
        if let Some(expected) = declared_checksum.map(str::trim) {
            if !checksum.is_empty() && !expected.eq_ignore_ascii_case(&checksum) {
                errors.push(ValidationIssue::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: checksum.clone(),
                });
            }
        }

        let declared = normalize_mime(declared_mime);
        if !self.mime_allowed(&declared) {
            errors.push(ValidationIssue::MimeNotAllowed {
                mime: declared,
                origin: "declared",
            });
        }
        if guessed.is_some() && !self.mime_allowed(&detected_mime) {
            errors.push(ValidationIssue::MimeNotAllowed {
                mime: detected_mime.clone(),
                origin: "detected",
            });
        }

        // A zero-byte file has no header to check; it ingests as zero rows.
        if size > 0 {
            if let Some(issue) = self.check_header(file_path) {
                errors.push(issue);
            }
        }

        errors.extend(scan_issues);

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            size,
            checksum,
            detected_mime,
        }
    }

    /// Hashes the file and runs the content patterns over each line.
    /// Each pattern is reported at most once, at its first hit.
    fn scan(&self, file: File) -> std::io::Result<(String, Vec<ValidationIssue>)> {
        let mut reader = BufReader::new(file);
        let mut hasher = Context::new();
        let mut line = Vec::new();
        let mut line_no = 0u64;
        let mut hits: Vec<ValidationIssue> = Vec::new();
        let mut seen = vec![false; self.patterns.len()];

        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            line_no += 1;
            hasher.consume(&line);

            let text = String::from_utf8_lossy(&line);
            for (i, (name, re)) in self.patterns.iter().enumerate() {
                if !seen[i] && re.is_match(&text) {
                    seen[i] = true;
                    hits.push(ValidationIssue::UnsafeContent {
                        line: line_no,
                        pattern: *name,
                    });
                }
            }
        }

        Ok((format!("{:x}", hasher.finalize()), hits))
    }

    fn check_header(&self, file_path: &Path) -> Option<ValidationIssue> {
        let mut reader = match csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(file_path)
        {
            Ok(reader) => reader,
            Err(e) => return Some(ValidationIssue::BadHeader(e.to_string())),
        };
        let headers = match reader.headers() {
            Ok(headers) => headers,
            Err(e) => return Some(ValidationIssue::BadHeader(e.to_string())),
        };
        let titles: Vec<String> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
            .collect();

        let missing: Vec<String> = self
            .required_columns
            .iter()
            .filter(|required| !titles.contains(&required.trim().to_lowercase()))
            .cloned()
            .collect();
        if missing.is_empty() {
            None
        } else {
            Some(ValidationIssue::MissingColumns(missing))
        }
    }
}

/// MD5 of a file, lower-case hex.
pub fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Context::new();
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        hasher.consume(buf);
        let len = buf.len();
        reader.consume(len);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
