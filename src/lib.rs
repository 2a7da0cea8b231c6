//! Applies unified diffs by anchoring on context text instead of line numbers.
//!
//! `ctxpatch` is built for diffs that were written against a slightly stale or
//! reformatted view of a file, as is common for diffs produced by a text
//! generator. The `@@ -l,s +l,s @@` ranges in such diffs cannot be trusted, so
//! every hunk is located by searching for its leading context lines in the
//! file's *current* content, comparing lines after whitespace normalization.
//!
//! ## Getting Started
//!
//! ```rust
//! use ctxpatch::{apply_patch_to_content, parse_diff, ApplyOptions};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // The file was reformatted since the diff was produced.
//! let original = "fn main() {\n        println!(\"hello\");\n}\n";
//!
//! let diff = "\
//! --- a/src/main.rs
//! +++ b/src/main.rs
//! @@ -1,3 +1,3 @@
//!  fn main() {
//! -    println!(\"hello\");
//! +    println!(\"hello, world\");
//!  }
//! ";
//!
//! let patches = parse_diff(diff)?;
//! assert_eq!(patches.len(), 1);
//! assert_eq!(patches[0].target_file(), "src/main.rs");
//!
//! let patched = apply_patch_to_content(&patches[0], original, &ApplyOptions::default())?;
//! assert_eq!(patched, "fn main() {\n    println!(\"hello, world\");\n}\n");
//! # Ok(())
//! # }
//! ```
//!
//! ## How a hunk is applied
//!
//! 1.  **Parsing:** [`parse_diff`] turns the diff text into [`Patch`]es, one per
//!     `---`/`+++` file section, each holding [`Hunk`]s of tagged [`HunkLine`]s.
//!     Prose, `diff --git` and `index` lines, and markdown fences around the
//!     diff are skipped.
//! 2.  **Classification:** [`Hunk::classify`] splits a hunk into its leading
//!     context, its change block, and its trailing context.
//! 3.  **Location:** the leading context is searched for in the current lines
//!     using [`normalize_line`]; the leftmost match is used.
//! 4.  **Application:** the change block is replayed against a window starting
//!     at that offset. Deleted lines may drift up to
//!     [`ApplyOptions::lookahead`] lines from where the diff expects them, and
//!     the trailing context must still follow the edited region.
//!
//! Hunks of one patch are applied in order, each against the result of the
//! previous one. Every failure is fatal: [`apply_diff`] stops at the first
//! error and does not roll back files it has already written.
//!
//! ## Step-by-Step Application with `HunkApplier`
//!
//! ```rust
//! use ctxpatch::{parse_diff, ApplyOptions, HunkApplier, HunkApplyStatus};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let original_lines = vec!["line 1", "line 2", "line 3"];
//! let diff = "--- a/file.txt\n+++ b/file.txt\n@@ -1,3 +1,3 @@\n line 1\n-line 2\n+line two\n line 3\n";
//! let patch = &parse_diff(diff)?[0];
//! let options = ApplyOptions::default();
//!
//! let mut applier = HunkApplier::new(patch, &original_lines, &options);
//! let status = applier.next().unwrap()?;
//! assert!(matches!(status, HunkApplyStatus::Applied { inserted: 1, deleted: 1, .. }));
//! assert!(applier.next().is_none());
//!
//! assert_eq!(applier.into_content(), "line 1\nline two\nline 3");
//! # Ok(())
//! # }
//! ```
use log::{debug, info, trace, warn};
use similar::udiff::unified_diff;
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// How many lines, starting at the cursor, a deletion may search for its target.
pub const DEFAULT_LOOKAHEAD: usize = 5;

// --- Error Types ---

/// Represents errors that can occur while parsing diff text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A `--- <file>` header was not immediately followed by a `+++ <file>` header.
    #[error("Line {line}: '--- {old_file}' is not followed by a '+++' header")]
    MissingNewFileHeader {
        /// The 1-based line number of the `---` header.
        line: usize,
        /// The file name given on the `---` header.
        old_file: String,
    },
}

/// Which side of a hunk's change block a context search failed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextAnchor {
    /// The context lines before the first change.
    Leading,
    /// The context lines after the last change.
    Trailing,
}

impl fmt::Display for ContextAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextAnchor::Leading => f.write_str("leading"),
            ContextAnchor::Trailing => f.write_str("trailing"),
        }
    }
}

/// The reason a hunk failed to apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HunkApplyError {
    /// The hunk's context could not be found in the current content.
    ///
    /// For [`ContextAnchor::Trailing`], the leading context matched but the
    /// lines after the edited region did not match the hunk's trailing context.
    /// This is what happens when a diff is applied a second time.
    #[error("Could not find the hunk's {anchor} context in the current file")]
    ContextNotFound { anchor: ContextAnchor },
    /// A line marked for deletion was not found within the lookahead window.
    #[error(
        "Line to delete not found within {lookahead} line(s) of the cursor (expected: {expected:?}, actual: {})",
        describe_actual(.actual)
    )]
    PatchMismatch {
        /// The normalized text of the line the hunk wanted to delete.
        expected: String,
        /// The normalized text of the line at the cursor, or `None` at the end
        /// of the window.
        actual: Option<String>,
        /// The lookahead that was in effect.
        lookahead: usize,
    },
}

fn describe_actual(actual: &Option<String>) -> String {
    match actual {
        Some(line) => format!("{:?}", line),
        None => "<end of window>".to_string(),
    }
}

/// Details about a hunk that failed to apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Hunk {hunk_index} failed: {reason}")]
pub struct HunkFailure {
    /// The 1-based index of the hunk within its patch.
    pub hunk_index: usize,
    /// Why the hunk failed.
    pub reason: HunkApplyError,
}

/// Errors raised while applying a diff to files on disk.
#[derive(Error, Debug)]
pub enum PatchError {
    /// The diff text itself is malformed. Raised before any file is touched.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The file a patch targets does not exist.
    #[error("Target file not found for patching: {0}")]
    TargetNotFound(PathBuf),
    /// The user does not have permission to read or write to the specified path.
    #[error("Permission denied for path: {path:?}")]
    PermissionDenied { path: PathBuf },
    /// The target path for a patch exists but is a directory, not a file.
    #[error("Target path is a directory, not a file: {path:?}")]
    TargetIsDirectory { path: PathBuf },
    /// An I/O error occurred while reading or writing a file.
    #[error("I/O error while processing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// One of the patch's hunks could not be applied. The file was left untouched.
    #[error("Failed to apply patch to {path:?}")]
    HunkFailed {
        path: PathBuf,
        #[source]
        failure: HunkFailure,
    },
}

// --- Options ---

/// Options for configuring how a patch is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// If `true`, no files will be written. A unified diff of the proposed
    /// changes is returned in [`PatchResult::diff`] instead.
    pub dry_run: bool,
    /// How many lines, starting at the cursor, a deletion may scan for its
    /// target. Values below 1 behave as 1.
    pub lookahead: usize,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            lookahead: DEFAULT_LOOKAHEAD,
        }
    }
}

impl ApplyOptions {
    /// Creates a new builder for `ApplyOptions`.
    ///
    /// # Example
    ///
    /// ```
    /// # use ctxpatch::ApplyOptions;
    /// let options = ApplyOptions::builder().dry_run(true).lookahead(8).build();
    ///
    /// assert!(options.dry_run);
    /// assert_eq!(options.lookahead, 8);
    /// ```
    pub fn builder() -> ApplyOptionsBuilder {
        ApplyOptionsBuilder::default()
    }
}

/// A builder for creating `ApplyOptions`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptionsBuilder {
    dry_run: Option<bool>,
    lookahead: Option<usize>,
}

impl ApplyOptionsBuilder {
    /// If `true`, no files will be modified.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = Some(dry_run);
        self
    }

    /// Sets how far a deletion may search past the cursor.
    pub fn lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead = Some(lookahead);
        self
    }

    /// Builds the `ApplyOptions`.
    pub fn build(self) -> ApplyOptions {
        let default = ApplyOptions::default();
        ApplyOptions {
            dry_run: self.dry_run.unwrap_or(default.dry_run),
            lookahead: self.lookahead.unwrap_or(default.lookahead),
        }
    }
}

// --- Data Structures ---

/// One line of a hunk body, tagged by its leading character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    /// An unchanged line (` ` prefix, or an empty diff line).
    Context(String),
    /// A line removed from the file (`-` prefix).
    Delete(String),
    /// A line added to the file (`+` prefix).
    Insert(String),
}

impl HunkLine {
    /// Tags a raw hunk body line. Returns `None` for lines that carry no tag.
    ///
    /// ```
    /// # use ctxpatch::HunkLine;
    /// assert_eq!(HunkLine::parse(" keep"), Some(HunkLine::Context("keep".to_string())));
    /// assert_eq!(HunkLine::parse("-gone"), Some(HunkLine::Delete("gone".to_string())));
    /// assert_eq!(HunkLine::parse("+new"), Some(HunkLine::Insert("new".to_string())));
    /// assert_eq!(HunkLine::parse(""), Some(HunkLine::Context(String::new())));
    /// assert_eq!(HunkLine::parse("index 83db48f..bf269f4"), None);
    /// ```
    pub fn parse(raw: &str) -> Option<HunkLine> {
        if raw.is_empty() {
            return Some(HunkLine::Context(String::new()));
        }
        if let Some(text) = raw.strip_prefix(' ') {
            Some(HunkLine::Context(text.to_string()))
        } else if let Some(text) = raw.strip_prefix('-') {
            Some(HunkLine::Delete(text.to_string()))
        } else {
            raw.strip_prefix('+')
                .map(|text| HunkLine::Insert(text.to_string()))
        }
    }

    /// The line's text without its tag.
    pub fn text(&self) -> &str {
        match self {
            HunkLine::Context(text) | HunkLine::Delete(text) | HunkLine::Insert(text) => text,
        }
    }

    /// Whether this is a `Delete` or `Insert` line.
    pub fn is_change(&self) -> bool {
        !matches!(self, HunkLine::Context(_))
    }
}

impl fmt::Display for HunkLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HunkLine::Context(text) => write!(f, " {}", text),
            HunkLine::Delete(text) => write!(f, "-{}", text),
            HunkLine::Insert(text) => write!(f, "+{}", text),
        }
    }
}

/// Represents a single hunk of changes within a patch.
///
/// A hunk corresponds to a block of lines starting with `@@ ... @@`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// The trimmed text after the closing `@@`, usually a function signature.
    /// Empty when the header has none or is malformed.
    pub header: String,
    /// The tagged body lines, in diff order.
    pub lines: Vec<HunkLine>,
    /// The old-side start line from the header, if it parsed. Only used in logs.
    pub old_start: Option<usize>,
    /// The new-side start line from the header, if it parsed. Only used in logs.
    pub new_start: Option<usize>,
}

impl Hunk {
    /// Checks if the hunk contains any additions or deletions.
    pub fn has_changes(&self) -> bool {
        self.lines.iter().any(HunkLine::is_change)
    }

    /// The text of every `Insert` line.
    pub fn added_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| matches!(l, HunkLine::Insert(_)))
            .map(HunkLine::text)
            .collect()
    }

    /// The text of every `Delete` line.
    pub fn removed_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| matches!(l, HunkLine::Delete(_)))
            .map(HunkLine::text)
            .collect()
    }

    /// Splits the hunk into leading context, change block, and trailing context.
    ///
    /// # Example
    ///
    /// ```
    /// # use ctxpatch::{Hunk, HunkLine};
    /// let hunk = Hunk {
    ///     header: String::new(),
    ///     lines: vec![
    ///         HunkLine::Context("a".into()),
    ///         HunkLine::Delete("b".into()),
    ///         HunkLine::Insert("B".into()),
    ///         HunkLine::Context("c".into()),
    ///     ],
    ///     old_start: Some(1),
    ///     new_start: Some(1),
    /// };
    /// let classified = hunk.classify();
    /// assert_eq!(classified.context_start, vec!["a"]);
    /// assert_eq!(classified.changes, vec![HunkLine::Delete("b".into()), HunkLine::Insert("B".into())]);
    /// assert_eq!(classified.context_end, vec!["c"]);
    /// ```
    pub fn classify(&self) -> ClassifiedHunk {
        let mut classifier = HunkClassifier::new();
        for line in &self.lines {
            classifier.push(line);
        }
        trace!("    Hunk classified, final state {:?}", classifier.state());
        classifier.finish()
    }
}

/// Represents all the changes to be applied to a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// The `---` file name with any `a/` prefix removed.
    pub old_file_name: String,
    /// The `+++` file name with any `b/` prefix removed.
    pub new_file_name: String,
    /// The hunks to apply, in diff order.
    pub hunks: Vec<Hunk>,
}

impl Patch {
    /// The file this patch edits, relative to the target directory.
    ///
    /// This is the new-side name, unless that side is `/dev/null`.
    pub fn target_file(&self) -> &str {
        if self.new_file_name == "/dev/null" {
            &self.old_file_name
        } else {
            &self.new_file_name
        }
    }
}

/// Represents the window of lines a hunk replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkLocation {
    /// The 0-based index of the first line of the window.
    pub start_index: usize,
    /// The number of original lines the window covered.
    pub length: usize,
}

impl fmt::Display for HunkLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Adding 1 to start_index for a more user-friendly 1-based line number.
        write!(f, "line {}", self.start_index + 1)
    }
}

/// The result of applying a single hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkApplyStatus {
    /// The hunk was applied.
    Applied {
        /// The window that was replaced.
        location: HunkLocation,
        /// How many lines were inserted.
        inserted: usize,
        /// How many lines were deleted.
        deleted: usize,
    },
    /// The hunk was skipped because it contained no additions or deletions.
    SkippedNoChanges,
}

/// The result of applying a patch in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryResult {
    /// The content after every hunk was applied.
    pub new_lines: Vec<String>,
    /// One status per hunk, in diff order.
    pub report: Vec<HunkApplyStatus>,
}

/// The result of applying a patch to a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchResult {
    /// The path of the patched file.
    pub path: PathBuf,
    /// One status per hunk, in diff order.
    pub report: Vec<HunkApplyStatus>,
    /// A unified diff of the proposed changes. Only populated in dry-run mode.
    pub diff: Option<String>,
}

// --- Line Normalization ---

/// Canonicalizes a line for comparison.
///
/// Carriage returns are removed, leading and trailing whitespace is trimmed,
/// and every run of internal whitespace becomes a single space. The result is
/// only ever compared, never written back to a file.
///
/// ```
/// # use ctxpatch::normalize_line;
/// assert_eq!(normalize_line("  let   x =\t1;\r"), "let x = 1;");
/// assert_eq!(normalize_line(&normalize_line(" a  b ")), normalize_line(" a  b "));
/// ```
pub fn normalize_line(line: &str) -> String {
    let without_cr: String = line.chars().filter(|&c| c != '\r').collect();
    let mut normalized = String::with_capacity(without_cr.len());
    for word in without_cr.split_whitespace() {
        if !normalized.is_empty() {
            normalized.push(' ');
        }
        normalized.push_str(word);
    }
    normalized
}

/// Splits file content into lines, dropping the `\r` of any `\r\n` ending.
///
/// A trailing newline yields a trailing empty line, so [`join_lines`] restores it.
///
/// ```
/// # use ctxpatch::{join_lines, split_lines};
/// let lines = split_lines("a\r\nb\n");
/// assert_eq!(lines, vec!["a", "b", ""]);
/// assert_eq!(join_lines(&lines), "a\nb\n");
/// ```
pub fn split_lines(content: &str) -> Vec<String> {
    content
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect()
}

/// Joins lines with `\n`.
pub fn join_lines<T: AsRef<str>>(lines: &[T]) -> String {
    lines
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<&str>>()
        .join("\n")
}

// --- Parsing ---

/// Accumulates one `---`/`+++` file section while the parser walks its lines.
struct SectionBuilder {
    patch: Patch,
    current_hunk: Option<Hunk>,
}

impl SectionBuilder {
    fn new(old_file_name: String, new_file_name: String) -> Self {
        Self {
            patch: Patch {
                old_file_name,
                new_file_name,
                hunks: Vec::new(),
            },
            current_hunk: None,
        }
    }

    fn open_hunk(&mut self, header_line: &str) {
        if let Some(hunk) = self.current_hunk.take() {
            self.patch.hunks.push(hunk);
        }
        let (header, old_start, new_start) = parse_hunk_header(header_line);
        self.current_hunk = Some(Hunk {
            header,
            lines: Vec::new(),
            old_start,
            new_start,
        });
    }

    fn push_line(&mut self, line: HunkLine, line_number: usize) {
        match self.current_hunk.as_mut() {
            Some(hunk) => hunk.lines.push(line),
            None => trace!("  Line {}: skipping text before the first hunk.", line_number),
        }
    }

    fn finish(mut self) -> Patch {
        if let Some(hunk) = self.current_hunk.take() {
            self.patch.hunks.push(hunk);
        }
        self.patch
    }
}

/// Parses diff text into an ordered list of [`Patch`]es.
///
/// A file section starts at a `--- <file>` line that must be immediately
/// followed by a `+++ <file>` line. Inside a section, every `@@` line opens a
/// new hunk. A section ends at the next `---` header, a `diff --git` line, a
/// markdown fence, or the end of the input. Everything outside a section is
/// ignored, so diffs embedded in prose or ` ```diff ` blocks parse as is.
///
/// # Errors
///
/// Returns [`ParseError::MissingNewFileHeader`] if a `---` line is not
/// followed by a `+++` line.
///
/// # Example
///
/// ```rust
/// use ctxpatch::{parse_diff, HunkLine, ParseError};
///
/// let diff = "diff --git a/foo.txt b/foo.txt\n--- a/foo.txt\n+++ b/foo.txt\n@@ -1,2 +1,3 @@ intro\n line1\n+newline\n line2\n";
/// let patches = parse_diff(diff).unwrap();
/// assert_eq!(patches[0].old_file_name, "foo.txt");
/// assert_eq!(patches[0].hunks[0].header, "intro");
/// assert_eq!(patches[0].hunks[0].lines[1], HunkLine::Insert("newline".to_string()));
///
/// let broken = parse_diff("--- a/x\n@@ -1,1 +1,1 @@\n context\n");
/// assert!(matches!(broken, Err(ParseError::MissingNewFileHeader { line: 1, .. })));
/// ```
pub fn parse_diff(content: &str) -> Result<Vec<Patch>, ParseError> {
    let mut patches = Vec::new();
    let mut section: Option<SectionBuilder> = None;
    let mut lines = content.lines().enumerate().peekable();

    while let Some((index, line)) = lines.next() {
        let line_number = index + 1;

        if let Some(old_header) = line.strip_prefix("--- ") {
            if let Some(finished) = section.take() {
                patches.push(finished.finish());
            }
            let old_file_name = strip_file_name(old_header, "a/");
            let new_header = lines
                .peek()
                .map(|&(_, next)| next)
                .and_then(|next| next.strip_prefix("+++ "));
            let Some(new_header) = new_header else {
                return Err(ParseError::MissingNewFileHeader {
                    line: line_number,
                    old_file: old_file_name,
                });
            };
            lines.next();
            let new_file_name = strip_file_name(new_header, "b/");
            debug!(
                "Line {}: file section '{}' -> '{}'",
                line_number, old_file_name, new_file_name
            );
            section = Some(SectionBuilder::new(old_file_name, new_file_name));
            continue;
        }

        let Some(builder) = section.as_mut() else {
            continue;
        };

        if line.starts_with("@@") {
            builder.open_hunk(line);
        } else if line.starts_with("diff --git") || line.starts_with("```") {
            if let Some(finished) = section.take() {
                patches.push(finished.finish());
            }
        } else if line.starts_with('\\') {
            // "\ No newline at end of file"
        } else if let Some(hunk_line) = HunkLine::parse(line) {
            builder.push_line(hunk_line, line_number);
        } else {
            trace!("  Line {}: skipping untagged line '{}'", line_number, line);
        }
    }

    if let Some(finished) = section {
        patches.push(finished.finish());
    }

    Ok(patches)
}

/// Removes a trailing tab-separated timestamp and the conventional prefix.
fn strip_file_name(raw: &str, prefix: &str) -> String {
    let name = raw.split('\t').next().unwrap_or(raw).trim();
    name.strip_prefix(prefix).unwrap_or(name).to_string()
}

/// Parses a hunk header line (e.g. `@@ -1,3 +1,4 @@ fn main()`).
///
/// Returns the trailing section text and the two start line numbers. A
/// header that does not have the `@@ -<range> +<range> @@` shape yields an
/// empty text and no numbers.
fn parse_hunk_header(line: &str) -> (String, Option<usize>, Option<usize>) {
    let rest = &line[2..];
    let Some(close) = rest.find("@@") else {
        return (String::new(), None, None);
    };
    let parts: Vec<_> = rest[..close].split_whitespace().collect();
    if parts.len() != 2 {
        return (String::new(), None, None);
    }
    let old_start = parse_range_start(parts[0], '-');
    let new_start = parse_range_start(parts[1], '+');
    if old_start.is_none() || new_start.is_none() {
        return (String::new(), None, None);
    }
    (rest[close + 2..].trim().to_string(), old_start, new_start)
}

fn parse_range_start(range: &str, sign: char) -> Option<usize> {
    let range = range.strip_prefix(sign)?;
    let mut numbers = range.splitn(2, ',');
    let start = numbers.next()?.parse::<usize>().ok()?;
    match numbers.next() {
        Some(count) => count.parse::<usize>().ok().map(|_| start),
        None => Some(start),
    }
}

// --- Classification ---

/// The states of [`HunkClassifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    /// No change line seen yet; context goes to the leading block.
    BeforeChanges,
    /// Inside the first run of change lines.
    InChanges,
    /// Collecting a context run that follows change lines.
    AfterChanges,
    /// Change lines resumed after a context run.
    Rechange,
}

/// A hunk split into the parts the applier works with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassifiedHunk {
    /// Context lines before the first change, verbatim.
    pub context_start: Vec<String>,
    /// The change block. Contains `Context` ops only for context runs that
    /// sat between two edit regions.
    pub changes: Vec<HunkLine>,
    /// Context lines after the last change, verbatim.
    pub context_end: Vec<String>,
}

/// Splits a hunk's lines with a small state machine.
///
/// Context seen before any change forms the leading block. Once a change line
/// is seen, a following context run is collected as the trailing block. If
/// change lines resume after that run, the run is dropped from the trailing
/// block and carried into the change block as `Context` ops, which the
/// applier steps over without checking them against the file.
///
/// ```
/// # use ctxpatch::{ClassifierState, HunkClassifier, HunkLine};
/// let mut classifier = HunkClassifier::new();
/// for line in [" a", "-b", " c", "-d", " e"] {
///     classifier.push(&HunkLine::parse(line).unwrap());
/// }
/// assert_eq!(classifier.state(), ClassifierState::AfterChanges);
///
/// let classified = classifier.finish();
/// assert_eq!(classified.context_start, vec!["a"]);
/// assert_eq!(
///     classified.changes,
///     vec![
///         HunkLine::Delete("b".into()),
///         HunkLine::Context("c".into()),
///         HunkLine::Delete("d".into()),
///     ]
/// );
/// assert_eq!(classified.context_end, vec!["e"]);
/// ```
#[derive(Debug, Clone)]
pub struct HunkClassifier {
    state: ClassifierState,
    classified: ClassifiedHunk,
}

impl Default for HunkClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl HunkClassifier {
    /// Creates a classifier in [`ClassifierState::BeforeChanges`].
    pub fn new() -> Self {
        Self {
            state: ClassifierState::BeforeChanges,
            classified: ClassifiedHunk::default(),
        }
    }

    /// The state reached after the lines pushed so far.
    pub fn state(&self) -> ClassifierState {
        self.state
    }

    /// Feeds the next hunk line.
    pub fn push(&mut self, line: &HunkLine) {
        let out = &mut self.classified;
        self.state = match (self.state, line) {
            (ClassifierState::BeforeChanges, HunkLine::Context(text)) => {
                out.context_start.push(text.clone());
                ClassifierState::BeforeChanges
            }
            (ClassifierState::BeforeChanges, change) => {
                out.changes.push(change.clone());
                ClassifierState::InChanges
            }
            (ClassifierState::InChanges | ClassifierState::Rechange, HunkLine::Context(text)) => {
                out.context_end.push(text.clone());
                ClassifierState::AfterChanges
            }
            (state @ (ClassifierState::InChanges | ClassifierState::Rechange), change) => {
                out.changes.push(change.clone());
                state
            }
            (ClassifierState::AfterChanges, HunkLine::Context(text)) => {
                out.context_end.push(text.clone());
                ClassifierState::AfterChanges
            }
            (ClassifierState::AfterChanges, change) => {
                trace!(
                    "    Changes resume after {} context line(s); stepping over them unchecked.",
                    out.context_end.len()
                );
                out.changes
                    .extend(out.context_end.drain(..).map(HunkLine::Context));
                out.changes.push(change.clone());
                ClassifierState::Rechange
            }
        };
    }

    /// Consumes the classifier and returns the split hunk.
    pub fn finish(self) -> ClassifiedHunk {
        self.classified
    }
}

impl ClassifiedHunk {
    /// Number of original lines the change block steps over or removes.
    pub fn consumed_len(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| !matches!(c, HunkLine::Insert(_)))
            .count()
    }

    fn count_deletes(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, HunkLine::Delete(_)))
            .count()
    }

    /// The window size needed at a given lookahead: both context blocks, the
    /// lines the change block consumes, and room for every deletion to drift.
    pub fn window_len(&self, lookahead: usize) -> usize {
        self.context_start.len()
            + self.consumed_len()
            + self.context_end.len()
            + self.count_deletes() * lookahead.max(1).saturating_sub(1)
    }

    /// Replays the change block against the window starting at `start`.
    ///
    /// `start` must be an offset where the leading context matched. Lines before
    /// the cursor form the edited output and lines from the cursor on are
    /// pending; the returned lines replace `lines[start..start + replaced_len]`.
    pub fn edit_window<T: AsRef<str>>(
        &self,
        lines: &[T],
        start: usize,
        lookahead: usize,
    ) -> Result<WindowEdit, HunkApplyError> {
        let lookahead = lookahead.max(1);
        let end = (start + self.window_len(lookahead)).min(lines.len());
        let window = &lines[start.min(end)..end];
        let cursor = self.context_start.len().min(window.len());

        let mut edited: Vec<String> = window[..cursor]
            .iter()
            .map(|l| l.as_ref().to_string())
            .collect();
        let mut pending: VecDeque<&str> = window[cursor..].iter().map(AsRef::as_ref).collect();
        let mut drift = 0;
        let mut inserted = 0;
        let mut deleted = 0;

        for change in &self.changes {
            match change {
                HunkLine::Context(_) => {
                    if let Some(line) = pending.pop_front() {
                        edited.push(line.to_string());
                    }
                }
                HunkLine::Delete(target) => {
                    let expected = normalize_line(target);
                    let found = pending
                        .iter()
                        .take(lookahead)
                        .position(|line| normalize_line(line) == expected);
                    let Some(offset) = found else {
                        return Err(HunkApplyError::PatchMismatch {
                            expected,
                            actual: pending.front().map(|line| normalize_line(line)),
                            lookahead,
                        });
                    };
                    if offset > 0 {
                        debug!(
                            "      Deleted line found {} line(s) past the cursor.",
                            offset
                        );
                    }
                    pending.remove(offset);
                    drift += offset;
                    deleted += 1;
                }
                HunkLine::Insert(text) => {
                    edited.push(text.clone());
                    inserted += 1;
                }
            }
        }

        if !self.trailing_context_follows(&pending, drift) {
            return Err(HunkApplyError::ContextNotFound {
                anchor: ContextAnchor::Trailing,
            });
        }

        edited.extend(pending.into_iter().map(String::from));
        Ok(WindowEdit {
            lines: edited,
            replaced_len: end - start.min(end),
            inserted,
            deleted,
        })
    }

    /// The trailing context must start within `drift` lines of the cursor,
    /// `drift` being the lines deletions skipped over.
    ///
    /// Blank lines at the end of the trailing context are not checked. They
    /// are usually the separator after a hunk, not file content.
    fn trailing_context_follows(&self, pending: &VecDeque<&str>, drift: usize) -> bool {
        let mut expected: Vec<String> =
            self.context_end.iter().map(|l| normalize_line(l)).collect();
        while expected.last().is_some_and(|line| line.is_empty()) {
            expected.pop();
        }
        if expected.is_empty() {
            return true;
        }
        let available: Vec<String> = pending.iter().map(|l| normalize_line(l)).collect();
        (0..=drift).any(|offset| {
            available
                .get(offset..offset + expected.len())
                .is_some_and(|candidate| candidate == expected.as_slice())
        })
    }
}

/// The outcome of [`ClassifiedHunk::edit_window`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEdit {
    /// The edited window.
    pub lines: Vec<String>,
    /// How many original lines the edited window replaces.
    pub replaced_len: usize,
    /// Number of `Insert` ops applied.
    pub inserted: usize,
    /// Number of lines removed by `Delete` ops.
    pub deleted: usize,
}

// --- Location ---

/// Finds the first offset where `context` matches `lines` line by line.
///
/// Lines are compared with [`normalize_line`]. When the context occurs more
/// than once, the leftmost occurrence wins. An empty context matches at 0.
///
/// ```
/// # use ctxpatch::find_context_start;
/// let lines = ["x", "a", "b", "a", "b"];
/// assert_eq!(find_context_start(&lines, &["a", "  b "]), Some(1));
/// assert_eq!(find_context_start(&lines, &["b", "x"]), None);
/// ```
pub fn find_context_start<T: AsRef<str>, C: AsRef<str>>(lines: &[T], context: &[C]) -> Option<usize> {
    context_start_candidates(lines, context).next()
}

/// Every offset where `context` matches `lines`, in ascending order.
pub fn context_start_candidates<T: AsRef<str>, C: AsRef<str>>(
    lines: &[T],
    context: &[C],
) -> impl Iterator<Item = usize> {
    let haystack: Vec<String> = lines.iter().map(|l| normalize_line(l.as_ref())).collect();
    let needle: Vec<String> = context.iter().map(|l| normalize_line(l.as_ref())).collect();
    let last = haystack.len().checked_sub(needle.len());
    last.into_iter()
        .flat_map(|last| 0..=last)
        .filter(move |&offset| haystack[offset..offset + needle.len()] == needle[..])
}

// --- Applying ---

/// Applies a single hunk to a vector of lines in place.
///
/// The hunk is applied at the leftmost offset where its leading context
/// matches. Later occurrences of the same context are never tried, so a
/// failure there is final. A hunk without additions or deletions is skipped
/// once its context has been found.
///
/// # Example
///
/// ```rust
/// # use ctxpatch::{apply_hunk_to_lines, parse_diff, ApplyOptions, HunkApplyStatus, HunkLocation};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut lines = vec!["line1".to_string(), "line2".to_string(), "line3".to_string()];
/// let patches = parse_diff("--- a/f\n+++ b/f\n@@ -1,3 +1,2 @@\n line1\n-line2\n line3\n")?;
///
/// let status = apply_hunk_to_lines(&patches[0].hunks[0], &mut lines, &ApplyOptions::default())?;
/// assert_eq!(lines, vec!["line1", "line3"]);
/// assert_eq!(
///     status,
///     HunkApplyStatus::Applied {
///         location: HunkLocation { start_index: 0, length: 3 },
///         inserted: 0,
///         deleted: 1,
///     }
/// );
/// # Ok(())
/// # }
/// ```
pub fn apply_hunk_to_lines(
    hunk: &Hunk,
    target_lines: &mut Vec<String>,
    options: &ApplyOptions,
) -> Result<HunkApplyStatus, HunkApplyError> {
    let classified = hunk.classify();
    let start = find_context_start(
        target_lines.as_slice(),
        classified.context_start.as_slice(),
    )
    .ok_or(HunkApplyError::ContextNotFound {
        anchor: ContextAnchor::Leading,
    })?;
    trace!("    Leading context found at index {}", start);

    if !hunk.has_changes() {
        debug!("  Skipping hunk (no changes).");
        return Ok(HunkApplyStatus::SkippedNoChanges);
    }

    let edit = classified.edit_window(target_lines.as_slice(), start, options.lookahead)?;
    let location = HunkLocation {
        start_index: start,
        length: edit.replaced_len,
    };
    debug!(
        "    Applied at {} (+{} -{})",
        location, edit.inserted, edit.deleted
    );
    target_lines.splice(start..start + edit.replaced_len, edit.lines);
    Ok(HunkApplyStatus::Applied {
        location,
        inserted: edit.inserted,
        deleted: edit.deleted,
    })
}

/// An iterator that applies hunks from a patch one by one.
///
/// Each hunk is located against the lines as left by the previous ones. The
/// iterator keeps going after a failure; [`apply_patch_to_lines`] is the
/// fail-fast driver.
#[derive(Debug)]
pub struct HunkApplier<'a> {
    hunks: std::slice::Iter<'a, Hunk>,
    current_lines: Vec<String>,
    options: &'a ApplyOptions,
}

impl<'a> HunkApplier<'a> {
    /// Creates an applier over a copy of `original_lines`.
    pub fn new<T: AsRef<str>>(
        patch: &'a Patch,
        original_lines: &[T],
        options: &'a ApplyOptions,
    ) -> Self {
        Self {
            hunks: patch.hunks.iter(),
            current_lines: original_lines
                .iter()
                .map(|l| l.as_ref().to_string())
                .collect(),
            options,
        }
    }

    /// Returns the current lines, reflecting all hunks applied so far.
    pub fn current_lines(&self) -> &[String] {
        &self.current_lines
    }

    /// Consumes the applier and returns the current lines.
    pub fn into_lines(self) -> Vec<String> {
        self.current_lines
    }

    /// Consumes the applier and returns the lines joined with `\n`.
    pub fn into_content(self) -> String {
        join_lines(&self.current_lines)
    }
}

impl<'a> Iterator for HunkApplier<'a> {
    type Item = Result<HunkApplyStatus, HunkApplyError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hunk = self.hunks.next()?;
        Some(apply_hunk_to_lines(
            hunk,
            &mut self.current_lines,
            self.options,
        ))
    }
}

/// Applies every hunk of a patch to a slice of lines, stopping at the first failure.
///
/// # Errors
///
/// Returns a [`HunkFailure`] naming the 1-based index of the hunk that failed.
/// Nothing is returned for the hunks applied before it.
pub fn apply_patch_to_lines<T: AsRef<str>>(
    patch: &Patch,
    original_lines: &[T],
    options: &ApplyOptions,
) -> Result<InMemoryResult, HunkFailure> {
    trace!(
        "  apply_patch_to_lines called with {} lines of original content.",
        original_lines.len()
    );

    let mut applier = HunkApplier::new(patch, original_lines, options);
    let total_hunks = patch.hunks.len();
    let mut report = Vec::with_capacity(total_hunks);

    for (i, result) in applier.by_ref().enumerate() {
        let hunk_index = i + 1;
        info!("  Applying Hunk {}/{}...", hunk_index, total_hunks);
        match result {
            Ok(status) => report.push(status),
            Err(reason) => {
                warn!("  Failed to apply Hunk {}. {}", hunk_index, reason);
                return Err(HunkFailure { hunk_index, reason });
            }
        }
    }

    Ok(InMemoryResult {
        new_lines: applier.into_lines(),
        report,
    })
}

/// Applies a patch to string content.
///
/// The content is split with [`split_lines`] and the result joined with `\n`,
/// so `\r\n` line endings come back as `\n`.
///
/// ```rust
/// # use ctxpatch::{apply_patch_to_content, parse_diff, ApplyOptions};
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let patches = parse_diff("--- a/foo.txt\n+++ b/foo.txt\n@@ -1,2 +1,3 @@\n line1\n+newline\n line2\n")?;
/// let patched = apply_patch_to_content(&patches[0], "line1\r\nline2\r\n", &ApplyOptions::default())?;
/// assert_eq!(patched, "line1\nnewline\nline2\n");
/// # Ok(())
/// # }
/// ```
pub fn apply_patch_to_content(
    patch: &Patch,
    original_content: &str,
    options: &ApplyOptions,
) -> Result<String, HunkFailure> {
    let original_lines = split_lines(original_content);
    let result = apply_patch_to_lines(patch, &original_lines, options)?;
    Ok(join_lines(&result.new_lines))
}

// --- File Access ---

/// Whole-file access used by [`apply_patch_to_file`] and [`apply_diff`].
///
/// Paths are used exactly as given.
pub trait FileAccess {
    /// Whether anything exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Reads the whole file as lines.
    fn read_lines(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Replaces the whole file with `lines` joined by `\n`.
    fn write_lines(&self, path: &Path, lines: &[String]) -> io::Result<()>;
}

/// [`FileAccess`] on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileAccess for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_lines(&self, path: &Path) -> io::Result<Vec<String>> {
        fs::read_to_string(path).map(|content| split_lines(&content))
    }

    fn write_lines(&self, path: &Path, lines: &[String]) -> io::Result<()> {
        fs::write(path, join_lines(lines))
    }
}

/// Converts a `std::io::Error` into a more specific `PatchError`.
fn map_io_error(path: PathBuf, e: io::Error) -> PatchError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => PatchError::PermissionDenied { path },
        io::ErrorKind::IsADirectory => PatchError::TargetIsDirectory { path },
        _ => PatchError::Io { path, source: e },
    }
}

/// Applies a single [`Patch`] to its target file under `target_dir`.
///
/// The file is read, every hunk is applied in memory, and the result is
/// written back only if all hunks succeeded. In dry-run mode nothing is
/// written and [`PatchResult::diff`] holds a preview.
///
/// # Errors
///
/// - [`PatchError::TargetNotFound`] if the target file does not exist.
/// - [`PatchError::HunkFailed`] if a hunk cannot be applied.
/// - An I/O variant if reading or writing fails.
///
/// # Example
///
/// ```
/// # use ctxpatch::{apply_patch_to_file, parse_diff, ApplyOptions, LocalFileSystem};
/// # use std::fs;
/// # use tempfile::tempdir;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dir = tempdir()?;
/// fs::write(dir.path().join("hello.txt"), "Hello, world!\n")?;
///
/// let patches = parse_diff("--- a/hello.txt\n+++ b/hello.txt\n@@ -1 +1 @@\n-Hello, world!\n+Hello, ctxpatch!\n")?;
/// let result = apply_patch_to_file(&patches[0], dir.path(), &LocalFileSystem, ApplyOptions::default())?;
///
/// assert!(result.diff.is_none());
/// assert_eq!(fs::read_to_string(dir.path().join("hello.txt"))?, "Hello, ctxpatch!\n");
/// # Ok(())
/// # }
/// ```
pub fn apply_patch_to_file<F: FileAccess + ?Sized>(
    patch: &Patch,
    target_dir: &Path,
    files: &F,
    options: ApplyOptions,
) -> Result<PatchResult, PatchError> {
    let path = target_dir.join(patch.target_file());
    info!("Applying patch to: {}", path.display());

    if !files.exists(&path) {
        return Err(PatchError::TargetNotFound(path));
    }
    let original_lines = files
        .read_lines(&path)
        .map_err(|e| map_io_error(path.clone(), e))?;
    trace!("  Read {} lines from target file.", original_lines.len());

    let result = match apply_patch_to_lines(patch, &original_lines, &options) {
        Ok(result) => result,
        Err(failure) => return Err(PatchError::HunkFailed { path, failure }),
    };

    let diff = if options.dry_run {
        info!("  DRY RUN: Would write changes to '{}'", path.display());
        let old_label = format!("a/{}", patch.target_file());
        let new_label = format!("b/{}", patch.target_file());
        Some(unified_diff(
            similar::Algorithm::default(),
            &join_lines(&original_lines),
            &join_lines(&result.new_lines),
            3,
            Some((old_label.as_str(), new_label.as_str())),
        ))
    } else {
        files
            .write_lines(&path, &result.new_lines)
            .map_err(|e| map_io_error(path.clone(), e))?;
        info!("  Successfully wrote changes to '{}'", path.display());
        None
    };

    Ok(PatchResult {
        path,
        report: result.report,
        diff,
    })
}

/// Parses `diff_text` and applies each patch to `target_dir`, one file at a time.
///
/// The diff is parsed completely before any file is touched. Patches are then
/// applied in order and the first error stops the run. Files written by
/// earlier patches keep their changes.
pub fn apply_diff<F: FileAccess + ?Sized>(
    diff_text: &str,
    target_dir: &Path,
    files: &F,
    options: ApplyOptions,
) -> Result<Vec<PatchResult>, PatchError> {
    let patches = parse_diff(diff_text)?;
    if patches.is_empty() {
        info!("No file sections found in the diff.");
    }

    let mut results = Vec::with_capacity(patches.len());
    for (i, patch) in patches.iter().enumerate() {
        info!(">>> Operation {}/{}", i + 1, patches.len());
        results.push(apply_patch_to_file(patch, target_dir, files, options)?);
    }
    Ok(results)
}
