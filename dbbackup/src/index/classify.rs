//! Filename classification for capture output and archive parts.
//!
//! Classification is a pure function of the file name so that re-running it
//! over an existing file list always yields the same assignment.

use super::FileType;
use lazy_static::lazy_static;
use regex::Regex;

/// Suffixes appended by the supported encryption tools.
pub const ENCRYPT_SUFFIXES: [&str; 2] = [".enc", ".xb"];

lazy_static! {
    static ref PART_RE: Regex = Regex::new(r"\.part_\d+$").unwrap();
    static ref SCHEMA_RE: Regex =
        Regex::new(r"-schema(-create|-view|-triggers|-post)?\.sql(\.gz|\.zst)?$").unwrap();
    static ref SQL_RE: Regex = Regex::new(r"\.sql(\.gz|\.zst)?$").unwrap();
    static ref DB_CREATE_RE: Regex =
        Regex::new(r"^([^.]+)-schema-create\.sql(?:\.gz|\.zst)?$").unwrap();
    static ref TABLE_SCHEMA_RE: Regex =
        Regex::new(r"^([^.]+)\.([^.]+)-schema(?:-view|-triggers|-post)?\.sql(?:\.gz|\.zst)?$")
            .unwrap();
    static ref TABLE_DATA_RE: Regex =
        Regex::new(r"^([^.]+)\.([^.]+)(?:\.\d+)?\.sql(?:\.gz|\.zst)?$").unwrap();
    static ref TABLE_META_RE: Regex = Regex::new(r"^([^.]+)\.([^.]+)-metadata$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub file_type: FileType,
    pub database: Option<String>,
    pub table: Option<String>,
}

/// Drop a trailing encryption suffix, if any.
pub fn strip_encrypt_suffix(name: &str) -> &str {
    for suffix in ENCRYPT_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return stripped;
        }
    }
    name
}

/// Assign exactly one type to a file name, in fixed priority order.
pub fn classify_type(name: &str) -> FileType {
    let name = strip_encrypt_suffix(base_name(name));
    if name.ends_with(".index") {
        FileType::Index
    } else if name.ends_with(".priv") {
        FileType::Priv
    } else if PART_RE.is_match(name) {
        FileType::Part
    } else if name.ends_with(".tar") || name.ends_with(".tar.zst") {
        FileType::Tar
    } else if name == "metadata" || name.ends_with("-metadata") {
        FileType::Metadata
    } else if SCHEMA_RE.is_match(name) {
        FileType::Schema
    } else if SQL_RE.is_match(name) {
        FileType::Data
    } else {
        FileType::Other
    }
}

/// Type plus the database/table a mydumper-style file belongs to.
pub fn classify(name: &str) -> Classified {
    let file_type = classify_type(name);
    let base = strip_encrypt_suffix(base_name(name));

    let (database, table) = match file_type {
        FileType::Schema => {
            if let Some(c) = DB_CREATE_RE.captures(base) {
                (Some(c[1].to_string()), None)
            } else if let Some(c) = TABLE_SCHEMA_RE.captures(base) {
                (Some(c[1].to_string()), Some(c[2].to_string()))
            } else {
                (None, None)
            }
        }
        FileType::Data => match TABLE_DATA_RE.captures(base) {
            Some(c) => (Some(c[1].to_string()), Some(c[2].to_string())),
            None => (None, None),
        },
        FileType::Metadata => match TABLE_META_RE.captures(base) {
            Some(c) => (Some(c[1].to_string()), Some(c[2].to_string())),
            None => (None, None),
        },
        _ => (None, None),
    };

    Classified {
        file_type,
        database,
        table,
    }
}

fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}
