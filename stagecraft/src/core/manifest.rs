//! Dependency manifest parsing.
//!
//! The manifest is a line-oriented list of `name[extras] <constraint>`
//! declarations. Parsing only validates the file and describes its contents;
//! the installer command still consumes the file itself.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static REQUIREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(\[[A-Za-z0-9._,\s-]*\])?\s*(.*)$",
    )
    .expect("requirement regex is valid")
});

static VCS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:git|hg|svn|bzr)\+").expect("vcs regex is valid")
});

const ARCHIVE_SUFFIXES: [&str; 5] = [".whl", ".tar.gz", ".tgz", ".tar.bz2", ".zip"];

static CONSTRAINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?:(?:===|==|~=|!=|>=|<=|>|<)\s*[^\s,;]+",
        r"(?:\s*,\s*(?:===|==|~=|!=|>=|<=|>|<)\s*[^\s,;]+)*",
        r"|@\s*\S+)?\s*(?:;.*)?$",
    ))
    .expect("constraint regex is valid")
});

/// One declared dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    /// Version constraint (plus any environment marker), verbatim. May be empty.
    pub constraint: String,
    pub line: usize,
}

/// Ordered, immutable set of declared dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    requirements: Vec<Requirement>,
    locations: Vec<String>,
    options: Vec<String>,
}

impl Manifest {
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Entries installed from a URL, VCS checkout, archive or local path.
    /// They carry no package name and are passed through untouched.
    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    /// Installer option lines (`-r other.txt`, `--index-url ...`), passed through untouched.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Declared entries: named requirements plus locations.
    pub fn len(&self) -> usize {
        self.requirements.len() + self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse manifest text, collecting every malformed or duplicate line.
///
/// Lines ending in `\` continue on the next line. `#` starts a comment at the
/// beginning of a line or after whitespace. Duplicate checks only apply to
/// named requirements.
pub fn parse_manifest(text: &str) -> Result<Manifest, Vec<String>> {
    let mut manifest = Manifest::default();
    let mut errors = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (line_no, logical) in logical_lines(text) {
        let line = strip_comment(&logical).trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('-') {
            manifest.options.push(line.to_string());
            continue;
        }
        if is_location(line) {
            manifest.locations.push(line.to_string());
            continue;
        }

        let Some(caps) = REQUIREMENT_RE.captures(line) else {
            errors.push(format!("line {line_no}: invalid requirement '{line}'"));
            continue;
        };
        let name = caps[1].to_string();
        let constraint = caps.get(3).map_or("", |m| m.as_str()).trim().to_string();
        if !CONSTRAINT_RE.is_match(&constraint) {
            errors.push(format!(
                "line {line_no}: invalid version constraint '{constraint}' for '{name}'"
            ));
            continue;
        }

        let normalized = normalize_name(&name);
        if let Some(first) = seen.get(&normalized) {
            errors.push(format!(
                "line {line_no}: duplicate requirement '{name}' (first declared on line {first})"
            ));
            continue;
        }
        seen.insert(normalized, line_no);
        manifest.requirements.push(Requirement {
            name,
            constraint,
            line: line_no,
        });
    }

    if errors.is_empty() {
        Ok(manifest)
    } else {
        Err(errors)
    }
}

/// URL, VCS, archive and path entries (`git+https://...`, `./vendor/pkg`,
/// `pkg-1.0-py3-none-any.whl`).
pub fn is_location(line: &str) -> bool {
    let head = line.split_whitespace().next().unwrap_or(line);
    if head.starts_with(['.', '/', '~']) || head.contains("://") || VCS_RE.is_match(head) {
        return true;
    }
    let lower = head.to_ascii_lowercase();
    ARCHIVE_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
}

/// Join `\` continuations, keeping the number of the first physical line.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;
    for (idx, raw) in text.lines().enumerate() {
        let (start, mut buf) = pending.take().unwrap_or((idx + 1, String::new()));
        match raw.strip_suffix('\\') {
            Some(head) => {
                buf.push_str(head);
                pending = Some((start, buf));
            }
            None => {
                buf.push_str(raw);
                lines.push((start, buf));
            }
        }
    }
    if let Some(last) = pending {
        lines.push(last);
    }
    lines
}

/// Package names compare case-insensitively with `-`, `_` and `.` equivalent.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for ch in name.chars() {
        if matches!(ch, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(ch.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

fn strip_comment(line: &str) -> &str {
    let mut prev_is_space = true;
    for (pos, ch) in line.char_indices() {
        if ch == '#' && prev_is_space {
            return &line[..pos];
        }
        prev_is_space = ch.is_whitespace();
    }
    line
}
