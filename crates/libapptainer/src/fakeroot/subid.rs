//! `/etc/subuid` and `/etc/subgid` handling.
//!
//! Lines are `user:start:count`, where `user` is a name or a numeric uid. A
//! leading `!` marks an entry disabled by the administrator. Unparsable
//! lines are kept verbatim on rewrite.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

pub const SUBUID_FILE: &str = "/etc/subuid";
pub const SUBGID_FILE: &str = "/etc/subgid";

/// Size of a mapping range allocated by `config fakeroot --add`.
pub const RANGE_COUNT: u32 = 65536;
const START_MIN: u32 = 100_000;
const START_MAX: u32 = u32::MAX - RANGE_COUNT;

#[derive(Debug, thiserror::Error)]
pub enum SubidError {
    #[error("failed to read {path:?}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no mapping entry found in {path:?} for {user}")]
    NotFound { path: PathBuf, user: String },
    #[error("mapping entry for {user} in {path:?} is invalid: {reason}")]
    Invalid {
        path: PathBuf,
        user: String,
        reason: String,
    },
    #[error("your fakeroot mapping has been disabled by the administrator")]
    Disabled,
    #[error("no free range left in {0:?}")]
    Exhausted(PathBuf),
}

type Result<T> = std::result::Result<T, SubidError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubidEntry {
    pub user: String,
    pub start: u32,
    pub count: u32,
    pub disabled: bool,
}

impl SubidEntry {
    fn render(&self) -> String {
        let bang = if self.disabled { "!" } else { "" };
        format!("{bang}{}:{}:{}", self.user, self.start, self.count)
    }

    fn end(&self) -> u64 {
        self.start as u64 + self.count as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry(SubidEntry),
    Raw(String),
}

/// A single ID range to map into a user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// Who a lookup is for. Entries may name the user or its numeric uid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubidUser {
    pub name: String,
    pub uid: u32,
}

impl SubidUser {
    fn matches(&self, entry: &SubidEntry) -> bool {
        entry.user == self.name || entry.user == self.uid.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubidFile {
    path: PathBuf,
    lines: Vec<Line>,
}

fn parse_line(line: &str) -> Option<SubidEntry> {
    let (disabled, rest) = match line.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let mut fields = rest.split(':');
    let user = fields.next()?.trim();
    let start = fields.next()?.trim().parse().ok()?;
    let count = fields.next()?.trim().parse().ok()?;
    if user.is_empty() || fields.next().is_some() {
        return None;
    }
    Some(SubidEntry {
        user: user.to_string(),
        start,
        count,
        disabled,
    })
}

impl SubidFile {
    pub fn parse(path: &Path, content: &str) -> Self {
        let lines = content
            .lines()
            .map(|l| match parse_line(l) {
                Some(entry) => Line::Entry(entry),
                None => {
                    if !l.trim().is_empty() && !l.starts_with('#') {
                        tracing::debug!(?path, line = l, "skipping malformed mapping entry");
                    }
                    Line::Raw(l.to_string())
                }
            })
            .collect();
        Self {
            path: path.to_path_buf(),
            lines,
        }
    }

    /// Loads `path`, a missing file is an empty one.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(path, &content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::parse(path, "")),
            Err(source) => Err(SubidError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn save(&self) -> Result<()> {
        let write_err = |source| SubidError::Write {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&self.path)
            .map_err(write_err)?;
        file.write_all(self.render().as_bytes()).map_err(write_err)?;
        file.sync_all().map_err(write_err)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry(e) => out.push_str(&e.render()),
                Line::Raw(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }

    fn entries(&self) -> impl Iterator<Item = &SubidEntry> {
        self.lines.iter().filter_map(|l| match l {
            Line::Entry(e) => Some(e),
            Line::Raw(_) => None,
        })
    }

    fn entries_mut(&mut self) -> impl Iterator<Item = &mut SubidEntry> {
        self.lines.iter_mut().filter_map(|l| match l {
            Line::Entry(e) => Some(e),
            Line::Raw(_) => None,
        })
    }

    /// Returns the single usable entry of `user`.
    pub fn user_entry(&self, user: &SubidUser) -> Result<&SubidEntry> {
        let mut found = self.entries().filter(|e| user.matches(e));
        let Some(entry) = found.next() else {
            return Err(SubidError::NotFound {
                path: self.path.clone(),
                user: user.name.clone(),
            });
        };
        let invalid = |reason: &str| SubidError::Invalid {
            path: self.path.clone(),
            user: user.name.clone(),
            reason: reason.to_string(),
        };
        if found.next().is_some() {
            return Err(invalid("multiple entries"));
        }
        if entry.count < RANGE_COUNT {
            return Err(invalid(&format!("range count is lower than {RANGE_COUNT}")));
        }
        if entry.start > START_MAX {
            return Err(invalid("range start is out of bounds"));
        }
        Ok(entry)
    }

    /// Whether `user` has an enabled entry usable for fakeroot.
    pub fn has_mapping(&self, user: &SubidUser) -> bool {
        matches!(self.user_entry(user), Ok(e) if !e.disabled)
    }

    /// Mapping for the container ids starting at 1, root being the caller.
    pub fn id_range(&self, user: &SubidUser) -> Result<IdRange> {
        let entry = self.user_entry(user)?;
        if entry.disabled {
            return Err(SubidError::Disabled);
        }
        Ok(IdRange {
            container_id: 1,
            host_id: entry.start,
            size: entry.count,
        })
    }

    fn free_start(&self) -> Result<u32> {
        let used: Vec<(u64, u64)> = self.entries().map(|e| (e.start as u64, e.end())).collect();
        let mut start = START_MIN as u64;
        while start <= START_MAX as u64 {
            let end = start + RANGE_COUNT as u64;
            match used.iter().filter(|(s, e)| *s < end && start < *e).map(|(_, e)| *e).max() {
                None => return Ok(start as u32),
                Some(overlap_end) => {
                    let steps = (overlap_end - START_MIN as u64).div_ceil(RANGE_COUNT as u64);
                    start = START_MIN as u64 + steps * RANGE_COUNT as u64;
                }
            }
        }
        Err(SubidError::Exhausted(self.path.clone()))
    }

    /// Adds a mapping for `user`. Existing entries are left alone.
    pub fn add_user(&mut self, user: &SubidUser) -> Result<()> {
        if self.entries().any(|e| user.matches(e)) {
            tracing::info!("user {} already has a mapping in {:?}", user.name, self.path);
            return Ok(());
        }
        let start = self.free_start()?;
        self.lines.push(Line::Entry(SubidEntry {
            user: user.name.clone(),
            start,
            count: RANGE_COUNT,
            disabled: false,
        }));
        Ok(())
    }

    pub fn remove_user(&mut self, user: &SubidUser) -> Result<()> {
        let before = self.lines.len();
        self.lines
            .retain(|l| !matches!(l, Line::Entry(e) if user.matches(e)));
        if self.lines.len() == before {
            return Err(SubidError::NotFound {
                path: self.path.clone(),
                user: user.name.clone(),
            });
        }
        Ok(())
    }

    fn set_disabled(&mut self, user: &SubidUser, disabled: bool) -> Result<()> {
        let mut touched = false;
        for entry in self.entries_mut().filter(|e| user.matches(e)) {
            entry.disabled = disabled;
            touched = true;
        }
        if !touched {
            return Err(SubidError::NotFound {
                path: self.path.clone(),
                user: user.name.clone(),
            });
        }
        Ok(())
    }

    pub fn enable_user(&mut self, user: &SubidUser) -> Result<()> {
        self.set_disabled(user, false)
    }

    pub fn disable_user(&mut self, user: &SubidUser) -> Result<()> {
        self.set_disabled(user, true)
    }
}
