//! LIST / NLST response parser.
//!
//! Supports two `LIST` formats, chosen per line from the first token:
//! 1. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 2. **MS-DOS / IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//!
//! Lines matching neither (e.g. `total 12`) are skipped, as are `.` and `..`.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::types::{DirectoryEntry, EntryKind, ListOptions, SortField, SortOrder};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNIX_PERMS: Regex = Regex::new(r"^[dlcbps-][rwxsStT-]{9}[+@.]?$").unwrap();
    static ref DOS_DATE: Regex = Regex::new(r"^\d{2}-\d{2}-\d{2}(\d{2})?$").unwrap();
    static ref UNIX_LINE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-])([rwxsStT-]{9})[+@.]?\s+    # type + permissions
        \d+\s+                                   # link count
        (\S+)\s+                                 # owner
        (?:(\S+)\s+)?                            # group (some servers omit it)
        (\d+)\s+                                 # size
        ([A-Za-z]{3}\s+\d{1,2}\s+(?:\d{1,2}:\d{2}|\d{4}))\s+   # date
        (.+)$                                    # name (possibly with -> target)
        "
    )
    .unwrap();
    static ref DOS_LINE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-\d{2}(?:\d{2})?)\s+        # date
        (\d{1,2}:\d{2}\s*(?:[AaPp][Mm])?)\s+     # time
        (<DIR>|\d+)\s+                           # size or <DIR>
        (.+)$                                    # name
        "
    )
    .unwrap();
}

/// Parse a full LIST response body.
pub fn parse_listing(raw: &str, show_hidden: bool) -> Vec<DirectoryEntry> {
    parse_listing_at(raw, show_hidden, Utc::now())
}

/// Like `parse_listing`, resolving year-less dates against `now`.
pub fn parse_listing_at(raw: &str, show_hidden: bool, now: DateTime<Utc>) -> Vec<DirectoryEntry> {
    raw.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| parse_line(line, now))
        .filter(|e| e.name != "." && e.name != "..")
        .filter(|e| show_hidden || !e.hidden)
        .collect()
}

/// Parse a single listing line, `None` if the format is not recognised.
pub fn parse_line(line: &str, now: DateTime<Utc>) -> Option<DirectoryEntry> {
    let first = line.split_whitespace().next()?;
    if UNIX_PERMS.is_match(first) {
        parse_unix(line, now)
    } else if DOS_DATE.is_match(first) {
        parse_dos(line)
    } else {
        None
    }
}

/// Parse an NLST body: one name per line.
pub fn parse_name_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|l| l.trim_end_matches('\r').trim())
        .filter(|l| !l.is_empty() && *l != "." && *l != "..")
        .map(str::to_string)
        .collect()
}

// ─── Unix-style parser ───────────────────────────────────────────────

/// ```text
/// drwxr-xr-x   2 user group  4096 Jan  1 12:00 dirname
/// -rw-r--r--   1 user group  1234 Jan  1  2025 file.txt
/// lrwxrwxrwx   1 user group    42 Jan  1 12:00 link -> target
/// ```
fn parse_unix(line: &str, now: DateTime<Utc>) -> Option<DirectoryEntry> {
    let caps = UNIX_LINE.captures(line)?;

    let type_char = caps.get(1)?.as_str();
    let perms = caps.get(2)?.as_str();
    let owner = caps.get(3).map(|m| m.as_str().to_string());
    let group = caps.get(4).map(|m| m.as_str().to_string());
    let size = caps.get(5)?.as_str().parse::<u64>().ok()?;
    let modified = parse_unix_date(caps.get(6)?.as_str(), now);
    let name_raw = caps.get(7)?.as_str();

    let kind = match type_char {
        "d" => EntryKind::Directory,
        "l" => EntryKind::Symlink,
        "-" => EntryKind::File,
        _ => EntryKind::Unknown,
    };

    let (name, link_target) = match (kind, name_raw.split_once(" -> ")) {
        (EntryKind::Symlink, Some((name, target))) => (name.to_string(), Some(target.to_string())),
        _ => (name_raw.to_string(), None),
    };

    Some(DirectoryEntry {
        hidden: name.starts_with('.'),
        name,
        kind,
        size,
        modified,
        permissions: Some(perms.to_string()),
        mode: mode_bits(perms),
        owner,
        group,
        link_target,
        raw: line.to_string(),
    })
}

/// Parse "Jan  1 12:00" (year inferred) or "Jan  1  2025".
fn parse_unix_date(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalised.contains(':') {
        // No year: the most recent one that does not lie in the future.
        let this_year = now.year();
        for year in [this_year, this_year - 1] {
            let candidate = NaiveDateTime::parse_from_str(
                &format!("{} {}", year, normalised),
                "%Y %b %d %H:%M",
            )
            .ok()
            .map(|dt| Utc.from_utc_datetime(&dt));
            match candidate {
                // Allow a day of clock skew between client and server.
                Some(dt) if dt <= now + chrono::Duration::days(1) => return Some(dt),
                _ => continue,
            }
        }
        return None;
    }

    let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

/// Decode a 9-character `rwxrwxrwx` string (with s/S/t/T) into mode bits.
pub fn mode_bits(perms: &str) -> Option<u32> {
    let bytes = perms.as_bytes();
    if bytes.len() != 9 {
        return None;
    }
    let mut mode = 0u32;
    for (i, &c) in bytes.iter().enumerate() {
        let bit = 1 << (8 - i);
        // setuid / setgid / sticky, depending on the triad.
        let special = match i {
            2 => 0o4000,
            5 => 0o2000,
            _ => 0o1000,
        };
        match (i % 3, c) {
            (_, b'-') => {}
            (0, b'r') | (1, b'w') | (2, b'x') => mode |= bit,
            (2, b's') if i != 8 => mode |= bit | special,
            (2, b'S') if i != 8 => mode |= special,
            (2, b't') if i == 8 => mode |= bit | special,
            (2, b'T') if i == 8 => mode |= special,
            _ => return None,
        }
    }
    Some(mode)
}

// ─── MS-DOS / IIS-style parser ───────────────────────────────────────

/// ```text
/// 01-01-26  12:00AM       1234 file.txt
/// 01-01-26  12:00PM      <DIR> Directory Name
/// ```
fn parse_dos(line: &str) -> Option<DirectoryEntry> {
    let caps = DOS_LINE.captures(line)?;

    let date_str = caps.get(1)?.as_str();
    let time_str = caps.get(2)?.as_str();
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str().to_string();

    let (kind, size) = if size_or_dir == "<DIR>" {
        (EntryKind::Directory, 0)
    } else {
        (EntryKind::File, size_or_dir.parse::<u64>().ok()?)
    };

    Some(DirectoryEntry {
        hidden: name.starts_with('.'),
        name,
        kind,
        size,
        modified: parse_dos_date(date_str, time_str),
        permissions: None,
        mode: None,
        owner: None,
        group: None,
        link_target: None,
        raw: line.to_string(),
    })
}

fn parse_dos_date(date: &str, time: &str) -> Option<DateTime<Utc>> {
    let time: String = time.split_whitespace().collect::<String>().to_uppercase();
    let year_fmt = if date.len() == 10 { "%Y" } else { "%y" };
    let combined = format!("{} {}", date, time);
    for time_fmt in ["%I:%M%p", "%H:%M"] {
        let fmt = format!("%m-%d-{} {}", year_fmt, time_fmt);
        if let Ok(dt) = NaiveDateTime::parse_from_str(&combined, &fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }
    None
}

// ─── Filter / sort ───────────────────────────────────────────────────

/// Apply the glob filter and sort order from `options`. Hidden entries
/// are dropped earlier, in `parse_listing`.
pub fn apply_options(mut entries: Vec<DirectoryEntry>, options: &ListOptions) -> FtpResult<Vec<DirectoryEntry>> {
    if let Some(ref pattern) = options.filter {
        let pat = glob::Pattern::new(pattern)
            .map_err(|e| FtpError::invalid_argument(format!("Invalid filter '{}': {}", pattern, e)))?;
        entries.retain(|e| pat.matches(&e.name));
    }

    if let Some(field) = options.sort_by {
        let order = options.sort_order.unwrap_or(SortOrder::Asc);
        entries.sort_by(|a, b| {
            let ord = match field {
                SortField::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
                SortField::Size => a.size.cmp(&b.size),
                SortField::Modified => a.modified.cmp(&b.modified),
                SortField::Kind => a.kind.cmp(&b.kind),
            }
            .then_with(|| a.name.cmp(&b.name));
            match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
    }
    Ok(entries)
}
