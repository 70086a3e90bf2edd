//! Criteria evaluation.
//!
//! Criteria describe what stays hot. A file is kept only when it satisfies
//! every enabled criterion of its root; anything else is evicted. A root
//! with no enabled criteria keeps nothing (see `EMPTY_CRITERIA_DECISION`).
//!
//! Operands are validated when a criterion is written, so evaluation is pure
//! and total over compiled criteria.

use crate::error::Error;
use crate::probe::{FileKind, FileMetadata};
use crate::storage::models::CriterionRow;
use glob::{MatchOptions, Pattern};
use std::fmt;
use std::str::FromStr;

/// Decision when a root has zero enabled criteria. The rule "keep only what
/// matches all criteria" over an empty set keeps nothing.
pub const EMPTY_CRITERIA_DECISION: Decision = Decision::Evict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Evict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionKind {
    Mtime,
    Atime,
    Ctime,
    Size,
    Name,
    Iname,
    Type,
    Perm,
    Owner,
    Group,
}

impl FromStr for CriterionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MTIME" => Ok(CriterionKind::Mtime),
            "ATIME" => Ok(CriterionKind::Atime),
            "CTIME" => Ok(CriterionKind::Ctime),
            "SIZE" => Ok(CriterionKind::Size),
            "NAME" => Ok(CriterionKind::Name),
            "INAME" => Ok(CriterionKind::Iname),
            "TYPE" => Ok(CriterionKind::Type),
            "PERM" => Ok(CriterionKind::Perm),
            "OWNER" => Ok(CriterionKind::Owner),
            "GROUP" => Ok(CriterionKind::Group),
            other => Err(Error::InvalidCriterion(format!("unknown kind '{}'", other))),
        }
    }
}

impl fmt::Display for CriterionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CriterionKind::Mtime => "MTIME",
            CriterionKind::Atime => "ATIME",
            CriterionKind::Ctime => "CTIME",
            CriterionKind::Size => "SIZE",
            CriterionKind::Name => "NAME",
            CriterionKind::Iname => "INAME",
            CriterionKind::Type => "TYPE",
            CriterionKind::Perm => "PERM",
            CriterionKind::Owner => "OWNER",
            CriterionKind::Group => "GROUP",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    /// Every bit of the operand is set (permissions only).
    HasAll,
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            "=" | "==" => Ok(Operator::Eq),
            "!=" => Ok(Operator::Ne),
            "&" => Ok(Operator::HasAll),
            other => Err(Error::InvalidCriterion(format!("unknown operator '{}'", other))),
        }
    }
}

impl Operator {
    fn is_ordering(self) -> bool {
        matches!(self, Operator::Lt | Operator::Le | Operator::Gt | Operator::Ge)
    }

    fn compare<T: PartialOrd>(self, lhs: T, rhs: T) -> bool {
        match self {
            Operator::Lt => lhs < rhs,
            Operator::Le => lhs <= rhs,
            Operator::Gt => lhs > rhs,
            Operator::Ge => lhs >= rhs,
            Operator::Eq => lhs == rhs,
            Operator::Ne => lhs != rhs,
            Operator::HasAll => false,
        }
    }
}

/// User or group reference: numeric id or name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Id(u32),
    Name(String),
}

/// A validated criterion, one variant per kind.
#[derive(Debug, Clone)]
pub enum Criterion {
    /// Age of the timestamp, in minutes.
    Mtime(Operator, i64),
    Atime(Operator, i64),
    Ctime(Operator, i64),
    Size(Operator, u64),
    Name(Operator, Pattern),
    Iname(Operator, Pattern),
    Type(Operator, FileKind),
    Perm(Operator, u32),
    Owner(Operator, Principal),
    Group(Operator, Principal),
}

impl Criterion {
    /// Validate and compile a criterion. Malformed operands are rejected here,
    /// never at evaluation time.
    pub fn parse(kind: &str, op: &str, value: &str) -> Result<Criterion, Error> {
        let kind: CriterionKind = kind.parse()?;
        let op: Operator = op.parse()?;
        let value = value.trim();

        let require = |allowed: &[Operator]| -> Result<(), Error> {
            if allowed.contains(&op) {
                Ok(())
            } else {
                Err(Error::InvalidCriterion(format!(
                    "operator {:?} is not valid for {}",
                    op, kind
                )))
            }
        };
        let equality = [Operator::Eq, Operator::Ne];

        let criterion = match kind {
            CriterionKind::Mtime | CriterionKind::Atime | CriterionKind::Ctime => {
                if !(op.is_ordering() || equality.contains(&op)) {
                    return Err(Error::InvalidCriterion(format!(
                        "operator {:?} is not valid for {}",
                        op, kind
                    )));
                }
                let minutes = parse_minutes(value)?;
                match kind {
                    CriterionKind::Mtime => Criterion::Mtime(op, minutes),
                    CriterionKind::Atime => Criterion::Atime(op, minutes),
                    _ => Criterion::Ctime(op, minutes),
                }
            }
            CriterionKind::Size => {
                if op == Operator::HasAll {
                    return Err(Error::InvalidCriterion(
                        "operator & is not valid for SIZE".to_string(),
                    ));
                }
                Criterion::Size(op, parse_size(value)?)
            }
            CriterionKind::Name | CriterionKind::Iname => {
                require(&equality)?;
                let pattern = Pattern::new(value).map_err(|e| {
                    Error::InvalidCriterion(format!("bad glob '{}': {}", value, e))
                })?;
                if kind == CriterionKind::Name {
                    Criterion::Name(op, pattern)
                } else {
                    Criterion::Iname(op, pattern)
                }
            }
            CriterionKind::Type => {
                require(&equality)?;
                Criterion::Type(op, parse_file_kind(value)?)
            }
            CriterionKind::Perm => {
                require(&[Operator::Eq, Operator::Ne, Operator::HasAll])?;
                let mode = u32::from_str_radix(value, 8).map_err(|_| {
                    Error::InvalidCriterion(format!("bad octal permissions '{}'", value))
                })?;
                if mode > 0o7777 {
                    return Err(Error::InvalidCriterion(format!(
                        "permissions '{}' out of range",
                        value
                    )));
                }
                Criterion::Perm(op, mode)
            }
            CriterionKind::Owner | CriterionKind::Group => {
                require(&equality)?;
                if value.is_empty() {
                    return Err(Error::InvalidCriterion(format!("empty {} operand", kind)));
                }
                let principal = match value.parse::<u32>() {
                    Ok(id) => Principal::Id(id),
                    Err(_) => Principal::Name(value.to_string()),
                };
                if kind == CriterionKind::Owner {
                    Criterion::Owner(op, principal)
                } else {
                    Criterion::Group(op, principal)
                }
            }
        };

        Ok(criterion)
    }

    pub fn kind(&self) -> CriterionKind {
        match self {
            Criterion::Mtime(..) => CriterionKind::Mtime,
            Criterion::Atime(..) => CriterionKind::Atime,
            Criterion::Ctime(..) => CriterionKind::Ctime,
            Criterion::Size(..) => CriterionKind::Size,
            Criterion::Name(..) => CriterionKind::Name,
            Criterion::Iname(..) => CriterionKind::Iname,
            Criterion::Type(..) => CriterionKind::Type,
            Criterion::Perm(..) => CriterionKind::Perm,
            Criterion::Owner(..) => CriterionKind::Owner,
            Criterion::Group(..) => CriterionKind::Group,
        }
    }

    /// Whether `meta` satisfies this criterion at instant `now` (unix secs).
    pub fn matches(&self, meta: &FileMetadata, now: i64) -> bool {
        match self {
            Criterion::Mtime(op, minutes) => match_age(*op, now, meta.mtime, *minutes),
            Criterion::Atime(op, minutes) => match_age(*op, now, meta.effective_atime, *minutes),
            Criterion::Ctime(op, minutes) => match_age(*op, now, meta.ctime, *minutes),
            Criterion::Size(op, bytes) => op.compare(meta.size, *bytes),
            Criterion::Name(op, pattern) => {
                let hit = pattern.matches_with(&meta.file_name, MatchOptions::new());
                apply_equality(*op, hit)
            }
            Criterion::Iname(op, pattern) => {
                let options = MatchOptions {
                    case_sensitive: false,
                    ..MatchOptions::new()
                };
                apply_equality(*op, pattern.matches_with(&meta.file_name, options))
            }
            Criterion::Type(op, kind) => apply_equality(*op, meta.kind == *kind),
            Criterion::Perm(op, mode) => match op {
                Operator::HasAll => (meta.mode & *mode) == *mode,
                _ => apply_equality(*op, meta.mode == *mode),
            },
            Criterion::Owner(op, principal) => {
                apply_equality(*op, match_principal(principal, meta.uid, meta.owner.as_deref()))
            }
            Criterion::Group(op, principal) => {
                apply_equality(*op, match_principal(principal, meta.gid, meta.group.as_deref()))
            }
        }
    }
}

/// Compile the enabled rows of a root. Any malformed row fails the whole set:
/// silently dropping a criterion could evict files meant to stay hot.
pub fn compile(rows: &[CriterionRow]) -> Result<Vec<Criterion>, Error> {
    rows.iter()
        .filter(|row| row.enabled)
        .map(|row| {
            Criterion::parse(&row.kind, &row.op, &row.value).map_err(|e| {
                Error::InvalidCriterion(format!("criterion {}: {}", row.id, e))
            })
        })
        .collect()
}

/// KEEP only when every criterion matches; zero criteria evicts.
pub fn evaluate(meta: &FileMetadata, criteria: &[Criterion], now: i64) -> Decision {
    if criteria.is_empty() {
        return EMPTY_CRITERIA_DECISION;
    }
    if criteria.iter().all(|c| c.matches(meta, now)) {
        Decision::Keep
    } else {
        Decision::Evict
    }
}

/// First criterion `meta` fails, for logging eviction reasons.
pub fn first_unmet<'a>(
    meta: &FileMetadata,
    criteria: &'a [Criterion],
    now: i64,
) -> Option<&'a Criterion> {
    criteria.iter().find(|c| !c.matches(meta, now))
}

fn match_age(op: Operator, now: i64, timestamp: i64, minutes: i64) -> bool {
    let age_secs = now.saturating_sub(timestamp);
    let limit_secs = minutes.saturating_mul(60);
    op.compare(age_secs, limit_secs)
}

fn apply_equality(op: Operator, hit: bool) -> bool {
    match op {
        Operator::Ne => !hit,
        _ => hit,
    }
}

fn match_principal(principal: &Principal, id: u32, name: Option<&str>) -> bool {
    match principal {
        Principal::Id(expected) => *expected == id,
        Principal::Name(expected) => name == Some(expected.as_str()),
    }
}

fn parse_minutes(value: &str) -> Result<i64, Error> {
    match value.parse::<i64>() {
        Ok(m) if m >= 0 => Ok(m),
        _ => Err(Error::InvalidCriterion(format!(
            "'{}' is not a non-negative number of minutes",
            value
        ))),
    }
}

/// Parse a size operand. Suffixes: c (bytes), k, M, G (binary multiples);
/// no suffix means bytes.
pub fn parse_size(value: &str) -> Result<u64, Error> {
    let invalid = || Error::InvalidCriterion(format!("bad size '{}'", value));
    let (digits, multiplier) = match value.chars().last() {
        Some('c') => (&value[..value.len() - 1], 1u64),
        Some('k') => (&value[..value.len() - 1], 1024),
        Some('M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (value, 1),
        _ => return Err(invalid()),
    };
    let number: u64 = digits.parse().map_err(|_| invalid())?;
    number.checked_mul(multiplier).ok_or_else(invalid)
}

fn parse_file_kind(value: &str) -> Result<FileKind, Error> {
    match value {
        "f" | "file" => Ok(FileKind::File),
        "d" | "directory" => Ok(FileKind::Directory),
        "l" | "symlink" => Ok(FileKind::Symlink),
        other => Err(Error::InvalidCriterion(format!("unknown file type '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const NOW: i64 = 1_700_000_000;

    fn meta(name: &str) -> FileMetadata {
        FileMetadata {
            path: PathBuf::from(format!("/hot/{}", name)),
            file_name: name.to_string(),
            kind: FileKind::File,
            size: 4096,
            mtime: NOW - 600,
            atime: NOW - 120,
            ctime: NOW - 600,
            effective_atime: NOW - 120,
            uid: 1000,
            gid: 100,
            owner: Some("alice".to_string()),
            group: Some("users".to_string()),
            mode: 0o644,
        }
    }

    fn c(kind: &str, op: &str, value: &str) -> Criterion {
        Criterion::parse(kind, op, value).unwrap()
    }

    #[test]
    fn test_zero_criteria_evicts() {
        assert_eq!(evaluate(&meta("a.txt"), &[], NOW), Decision::Evict);
    }

    #[test]
    fn test_all_criteria_must_match() {
        let criteria = vec![
            c("atime", "<", "3"),
            c("size", ">", "1k"),
            c("name", "=", "*.txt"),
        ];
        assert_eq!(evaluate(&meta("a.txt"), &criteria, NOW), Decision::Keep);
        // Fails only the name criterion: N-1 of N matched
        assert_eq!(evaluate(&meta("a.bin"), &criteria, NOW), Decision::Evict);
        assert_eq!(
            first_unmet(&meta("a.bin"), &criteria, NOW).map(|c| c.kind()),
            Some(CriterionKind::Name)
        );
    }

    #[test]
    fn test_age_in_minutes() {
        let m = meta("a.txt");
        // atime is 120s old
        assert!(c("atime", "<", "3").matches(&m, NOW));
        assert!(!c("atime", "<", "2").matches(&m, NOW));
        assert!(c("atime", "<=", "2").matches(&m, NOW));
        assert!(c("mtime", ">", "9").matches(&m, NOW));
        assert!(!c("mtime", ">", "10").matches(&m, NOW));
    }

    #[test]
    fn test_never_opened_is_always_old() {
        let mut m = meta("a.txt");
        m.effective_atime = i64::MIN;
        assert!(!c("atime", "<", "525600").matches(&m, NOW));
    }

    #[test]
    fn test_size_suffixes() {
        assert_eq!(parse_size("100c").unwrap(), 100);
        assert_eq!(parse_size("2k").unwrap(), 2048);
        assert_eq!(parse_size("3M").unwrap(), 3 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("77").unwrap(), 77);
        assert!(parse_size("12x").is_err());
        assert!(parse_size("k").is_err());
        assert!(c("size", "=", "4k").matches(&meta("a"), NOW));
    }

    #[test]
    fn test_iname_is_case_insensitive() {
        let m = meta("Report.PDF");
        assert!(!c("name", "=", "*.pdf").matches(&m, NOW));
        assert!(c("iname", "=", "*.pdf").matches(&m, NOW));
        assert!(c("iname", "!=", "*.doc").matches(&m, NOW));
    }

    #[test]
    fn test_type_perm_owner_group() {
        let m = meta("a");
        assert!(c("type", "=", "f").matches(&m, NOW));
        assert!(c("type", "!=", "d").matches(&m, NOW));
        assert!(c("perm", "=", "644").matches(&m, NOW));
        assert!(c("perm", "&", "600").matches(&m, NOW));
        assert!(!c("perm", "&", "700").matches(&m, NOW));
        assert!(c("owner", "=", "alice").matches(&m, NOW));
        assert!(c("owner", "=", "1000").matches(&m, NOW));
        assert!(c("group", "!=", "wheel").matches(&m, NOW));
    }

    #[test]
    fn test_malformed_operands_rejected_at_parse() {
        assert!(Criterion::parse("mtime", "<", "three").is_err());
        assert!(Criterion::parse("mtime", "<", "-5").is_err());
        assert!(Criterion::parse("size", "<", "big").is_err());
        assert!(Criterion::parse("perm", "=", "999").is_err());
        assert!(Criterion::parse("name", "<", "*.txt").is_err());
        assert!(Criterion::parse("type", "=", "socket").is_err());
        assert!(Criterion::parse("colour", "=", "red").is_err());
        assert!(Criterion::parse("mtime", "~", "3").is_err());
    }

    #[test]
    fn test_compile_skips_disabled_and_fails_closed() {
        let row = |id, kind: &str, value: &str, enabled| CriterionRow {
            id,
            root_id: 1,
            kind: kind.to_string(),
            op: "<".to_string(),
            value: value.to_string(),
            enabled,
        };
        let compiled = compile(&[row(1, "atime", "3", true), row(2, "mtime", "x", false)]).unwrap();
        assert_eq!(compiled.len(), 1);

        assert!(compile(&[row(1, "atime", "3", true), row(2, "mtime", "x", true)]).is_err());
    }
}
