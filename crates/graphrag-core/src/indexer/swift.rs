//! Swift entity extraction.
//!
//! Line-oriented regex scanning over a masked copy of the source: comments
//! and string literals are blanked byte-for-byte first, so brace tracking
//! and declaration matching only ever see code.  Offsets in the masked text
//! are identical to offsets in the original, which is where signatures and
//! doc comments are read from.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{GraphError, GraphResult};
use crate::indexer::parser::SourceParser;
use crate::models::{
    identity_key, EntityFacts, EntityKind, MemberFacts, MemberKind, MAX_SIGNATURE_CHARS,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct SwiftParser;

impl SourceParser for SwiftParser {
    fn parse(&self, path: &str, source: &[u8]) -> GraphResult<Vec<EntityFacts>> {
        let text = std::str::from_utf8(source)
            .map_err(|e| GraphError::parse(path, format!("invalid UTF-8: {e}")))?;
        extract_swift(path, text)
    }
}

// ---------------------------------------------------------------------------
// Compiled regex patterns
// ---------------------------------------------------------------------------

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<prefix>(?:@[A-Za-z_][\w.]*(?:\([^)\n]*\))?\s+|(?:public|private|fileprivate|internal|open|package|final|indirect|nonisolated|distributed)(?:\([a-z]+\))?\s+)*)(?P<kw>class|struct|enum|protocol|extension|actor)\s+(?P<name>`?[A-Za-z_][\w.]*`?)",
    )
    .unwrap()
});

static MEMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<prefix>(?:@[A-Za-z_][\w.]*(?:\([^)\n]*\))?\s+|(?:public|private|fileprivate|internal|open|package|final|static|class|override|required|convenience|mutating|nonmutating|lazy|weak|unowned|dynamic|optional|indirect|nonisolated|isolated|prefix|postfix|infix|consuming|borrowing)(?:\([a-z]+\))?\s+)*)(?P<kw>func|init|deinit|subscript|var|let|case|typealias|associatedtype)\b",
    )
    .unwrap()
});

/// Words that the entity pattern can capture as a "name" when a type
/// keyword is really a modifier (`class func`, `class var`).
const RESERVED_NAMES: &[&str] = &[
    "func",
    "var",
    "let",
    "init",
    "deinit",
    "subscript",
    "typealias",
    "case",
    "static",
    "override",
];

const VISIBILITIES: &[&str] = &[
    "public",
    "open",
    "package",
    "internal",
    "fileprivate",
    "private",
];

const DEFAULT_VISIBILITY: &str = "internal";

// ---------------------------------------------------------------------------
// Masking
// ---------------------------------------------------------------------------

struct Masked {
    text: String,
    /// Byte ranges of comments, in source order.
    comments: Vec<(usize, usize)>,
}

fn blank(out: &mut [u8], start: usize, end: usize) {
    for byte in &mut out[start..end] {
        if *byte != b'\n' {
            *byte = b' ';
        }
    }
}

fn line_end(src: &[u8], from: usize) -> usize {
    src[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|p| from + p)
        .unwrap_or(src.len())
}

/// Block comments nest in Swift.
fn block_comment_end(src: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < src.len() {
        if src[i..].starts_with(b"/*") {
            depth += 1;
            i += 2;
        } else if src[i..].starts_with(b"*/") {
            depth = depth.saturating_sub(1);
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    src.len()
}

fn hashes_at(src: &[u8], at: usize, count: usize) -> bool {
    (0..count).all(|k| src.get(at + k) == Some(&b'#'))
}

/// `"`, `"""` or a raw `#"` opener at `i`.
fn string_start(src: &[u8], i: usize) -> bool {
    let mut j = i;
    while src.get(j) == Some(&b'#') {
        j += 1;
    }
    src.get(j) == Some(&b'"')
}

/// Index one past the closing delimiter of the literal opening at `start`.
/// An unterminated single-line literal stops at the end of its line.
fn string_end(src: &[u8], start: usize) -> usize {
    let mut i = start;
    let mut hashes = 0;
    while src.get(i) == Some(&b'#') {
        hashes += 1;
        i += 1;
    }
    let multiline = src[i..].starts_with(b"\"\"\"");
    i += if multiline { 3 } else { 1 };

    while i < src.len() {
        let c = src[i];
        if c == b'\\' && hashes_at(src, i + 1, hashes) {
            let after = i + 1 + hashes;
            i = if src.get(after) == Some(&b'(') {
                interpolation_end(src, after + 1)
            } else {
                after + 1
            };
            continue;
        }
        if multiline {
            if src[i..].starts_with(b"\"\"\"") && hashes_at(src, i + 3, hashes) {
                return i + 3 + hashes;
            }
        } else {
            if c == b'"' && hashes_at(src, i + 1, hashes) {
                return i + 1 + hashes;
            }
            if c == b'\n' {
                return i;
            }
        }
        i += 1;
    }
    src.len()
}

/// `i` is just past the `(` of `\(`.
fn interpolation_end(src: &[u8], mut i: usize) -> usize {
    let mut depth = 1usize;
    while i < src.len() {
        match src[i] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
            }
            b'"' | b'#' if string_start(src, i) => {
                i = string_end(src, i);
                continue;
            }
            b'/' if src.get(i + 1) == Some(&b'*') => {
                i = block_comment_end(src, i);
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    src.len()
}

fn mask_source(path: &str, source: &str) -> GraphResult<Masked> {
    let src = source.as_bytes();
    let mut out = src.to_vec();
    let mut comments = Vec::new();
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'/' if src.get(i + 1) == Some(&b'/') => {
                let end = line_end(src, i);
                blank(&mut out, i, end);
                comments.push((i, end));
                i = end;
            }
            b'/' if src.get(i + 1) == Some(&b'*') => {
                let end = block_comment_end(src, i);
                blank(&mut out, i, end);
                comments.push((i, end));
                i = end;
            }
            b'"' | b'#' if string_start(src, i) => {
                let end = string_end(src, i);
                blank(&mut out, i, end);
                i = end;
            }
            _ => i += 1,
        }
    }
    let text = String::from_utf8(out)
        .map_err(|e| GraphError::parse(path, format!("masking produced invalid UTF-8: {e}")))?;
    Ok(Masked { text, comments })
}

// ---------------------------------------------------------------------------
// Line bookkeeping
// ---------------------------------------------------------------------------

struct LineIndex {
    starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    fn new(text: &str) -> Self {
        let starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(p, _)| p + 1))
            .collect();
        Self {
            starts,
            len: text.len(),
        }
    }

    /// Zero-based line index of a byte offset.
    fn index_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|&s| s <= offset).saturating_sub(1)
    }

    fn number(&self, offset: usize) -> i64 {
        self.index_of(offset) as i64 + 1
    }

    /// Byte span of a line, newline excluded.
    fn span(&self, index: usize) -> (usize, usize) {
        let start = self.starts[index];
        let end = self
            .starts
            .get(index + 1)
            .map(|next| next - 1)
            .unwrap_or(self.len);
        (start, end)
    }
}

// ---------------------------------------------------------------------------
// Declaration helpers
// ---------------------------------------------------------------------------

fn is_ident_char(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

/// Leading identifier, backticks stripped.
fn leading_identifier(text: &str) -> Option<&str> {
    let text = text.trim_start();
    let (text, quoted) = match text.strip_prefix('`') {
        Some(rest) => (rest, true),
        None => (text, false),
    };
    let first = text.chars().next()?;
    if !(first == '_' || first.is_alphabetic()) {
        return None;
    }
    let end = text
        .char_indices()
        .find(|(_, c)| !is_ident_char(*c))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let ident = &text[..end];
    if quoted && !text[end..].starts_with('`') {
        return None;
    }
    Some(ident)
}

const OPERATOR_CHARS: &str = "/=-+!*%<>&|^~?.";

fn func_name(after_keyword: &str) -> Option<String> {
    let text = after_keyword.trim_start();
    if let Some(ident) = leading_identifier(text) {
        return Some(ident.to_string());
    }
    let op: String = text
        .chars()
        .take_while(|c| OPERATOR_CHARS.contains(*c))
        .collect();
    (!op.is_empty()).then_some(op)
}

/// Split on `sep` outside of `()`, `[]` and `<>`.
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut last = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' | '[' | '<' => depth += 1,
            ')' | ']' | '>' => depth -= 1,
            c if c == sep && depth <= 0 => {
                parts.push(&text[last..i]);
                last = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[last..]);
    parts
}

/// Names declared by one `case` statement (`case a, b(Int), c = 3`).
fn case_names(after_keyword: &str) -> Vec<String> {
    let end = after_keyword
        .find(['\n', ';', '{', '}'])
        .unwrap_or(after_keyword.len());
    split_top_level(&after_keyword[..end], ',')
        .into_iter()
        .filter_map(leading_identifier)
        .map(str::to_string)
        .collect()
}

fn skip_generic_params(text: &str) -> &str {
    let mut depth = 0i32;
    for (i, c) in text.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => {
                depth -= 1;
                if depth == 0 {
                    return &text[i + 1..];
                }
            }
            _ => {}
        }
    }
    ""
}

fn find_word(text: &str, word: &str) -> Option<usize> {
    text.match_indices(word).map(|(i, _)| i).find(|&i| {
        let before = text[..i].chars().next_back();
        let after = text[i + word.len()..].chars().next();
        !before.is_some_and(is_ident_char) && !after.is_some_and(is_ident_char)
    })
}

/// Inherited and conformed types from the header between the name and `{`.
fn parse_inherits(header: &str) -> Vec<String> {
    let mut rest = header.trim_start();
    if rest.starts_with('<') {
        rest = skip_generic_params(rest).trim_start();
    }
    let Some(list) = rest.strip_prefix(':') else {
        return Vec::new();
    };
    let list = match find_word(list, "where") {
        Some(pos) => &list[..pos],
        None => list,
    };
    split_top_level(list, ',')
        .into_iter()
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
        .collect()
}

fn visibility_of(prefix: &str) -> String {
    prefix
        .split_whitespace()
        .find(|word| VISIBILITIES.contains(word))
        .unwrap_or(DEFAULT_VISIBILITY)
        .to_string()
}

fn is_static(prefix: &str) -> bool {
    prefix
        .split_whitespace()
        .any(|word| word == "static" || word == "class")
}

fn strip_backticks(name: &str) -> &str {
    name.trim_matches('`')
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

struct Scope {
    entity: Option<usize>,
    opened_at: usize,
}

struct Extractor<'a> {
    path: &'a str,
    source: &'a str,
    masked: Masked,
    lines: LineIndex,
}

impl Extractor<'_> {
    /// First line of a declaration: from the statement start (or the start
    /// of the keyword's line) up to the body brace, comments removed.
    fn signature(&self, statement_at: usize, keyword_at: usize) -> String {
        let (line_start, line_end) = self.lines.span(self.lines.index_of(keyword_at));
        let start = statement_at.max(line_start);
        let mut cut = self.masked.text[keyword_at..line_end]
            .find('{')
            .map(|p| keyword_at + p)
            .unwrap_or(line_end);
        if let Some(&(comment_start, _)) = self
            .masked
            .comments
            .iter()
            .find(|(s, _)| *s >= start && *s < cut)
        {
            cut = comment_start;
        }
        let text = self.source[start..cut].trim();
        text.chars().take(MAX_SIGNATURE_CHARS).collect()
    }

    /// `///` lines immediately above the statement, when it starts its line.
    fn docstring(&self, statement_at: usize) -> Option<String> {
        let line = self.lines.index_of(statement_at);
        let (line_start, _) = self.lines.span(line);
        if !self.source[line_start..statement_at].trim().is_empty() {
            return None;
        }
        let mut collected = Vec::new();
        let mut index = line;
        while index > 0 {
            index -= 1;
            let (start, end) = self.lines.span(index);
            match self.source[start..end].trim().strip_prefix("///") {
                Some(rest) => collected.push(rest.strip_prefix(' ').unwrap_or(rest).trim_end()),
                None => break,
            }
        }
        if collected.is_empty() {
            return None;
        }
        collected.reverse();
        Some(collected.join("\n"))
    }

    /// Position of the body brace for a declaration header starting at `from`.
    fn body_start(&self, from: usize) -> Option<usize> {
        let bytes = self.masked.text.as_bytes();
        for (offset, &b) in bytes[from..].iter().enumerate() {
            match b {
                b'{' => return Some(from + offset),
                b'}' | b';' => return None,
                _ => {}
            }
        }
        None
    }

    fn run(&self) -> GraphResult<Vec<EntityFacts>> {
        let text = self.masked.text.as_str();
        let bytes = text.as_bytes();
        let mut entities: Vec<EntityFacts> = Vec::new();
        let mut scopes: Vec<Scope> = Vec::new();
        let mut opens_entity: Option<usize> = None;
        let mut statement_start = true;
        let mut i = 0;

        while i < bytes.len() {
            match bytes[i] {
                b'{' => {
                    scopes.push(Scope {
                        entity: opens_entity.take(),
                        opened_at: i,
                    });
                    statement_start = true;
                    i += 1;
                    continue;
                }
                b'}' => {
                    let Some(scope) = scopes.pop() else {
                        return Err(GraphError::parse(
                            self.path,
                            format!("unmatched `}}` at line {}", self.lines.number(i)),
                        ));
                    };
                    if let Some(idx) = scope.entity {
                        entities[idx].end_line = self.lines.number(i);
                    }
                    statement_start = true;
                    i += 1;
                    continue;
                }
                b'\n' | b';' => {
                    statement_start = true;
                    i += 1;
                    continue;
                }
                b' ' | b'\t' | b'\r' => {
                    i += 1;
                    continue;
                }
                _ => {}
            }

            if !statement_start {
                i += 1;
                continue;
            }
            statement_start = false;

            // None: file scope.  Some(None): inside a non-type body.
            let enclosing = scopes.last().map(|s| s.entity);
            let rest = &text[i..];

            if matches!(enclosing, None | Some(Some(_))) {
                if let Some(next) = self.match_entity(rest, i, enclosing.flatten(), &mut entities)? {
                    opens_entity = Some(entities.len() - 1);
                    i = next;
                    continue;
                }
            }
            if let Some(Some(owner)) = enclosing {
                if let Some(next) = self.match_members(rest, i, &mut entities[owner]) {
                    i = next;
                    continue;
                }
            }
            i += 1;
        }

        if let Some(scope) = scopes.last() {
            return Err(GraphError::parse(
                self.path,
                format!(
                    "unclosed `{{` opened at line {}",
                    self.lines.number(scope.opened_at)
                ),
            ));
        }
        assign_identity_keys(self.path, &mut entities);
        Ok(entities)
    }

    /// Returns the body brace offset when `rest` opens a type declaration.
    fn match_entity(
        &self,
        rest: &str,
        at: usize,
        owner: Option<usize>,
        entities: &mut Vec<EntityFacts>,
    ) -> GraphResult<Option<usize>> {
        let Some(caps) = ENTITY_RE.captures(rest) else {
            return Ok(None);
        };
        let written = strip_backticks(&caps["name"]);
        if RESERVED_NAMES.contains(&written) {
            return Ok(None);
        }
        let Some(kind) = EntityKind::from_keyword(&caps["kw"]) else {
            return Ok(None);
        };
        let keyword_at = at + caps.name("kw").map(|m| m.start()).unwrap_or(0);
        let header_at = at + caps.get(0).map(|m| m.end()).unwrap_or(0);
        let Some(brace) = self.body_start(header_at) else {
            return Err(GraphError::parse(
                self.path,
                format!(
                    "{} {written} at line {} has no body",
                    kind.as_str(),
                    self.lines.number(keyword_at)
                ),
            ));
        };

        let (name, qualified_name, extended_type) = if kind == EntityKind::Extension {
            let name = written.rsplit('.').next().unwrap_or(written).to_string();
            (name, written.to_string(), Some(written.to_string()))
        } else {
            let qualified = match owner {
                Some(parent) => format!("{}.{written}", entities[parent].qualified_name),
                None => written.to_string(),
            };
            (written.to_string(), qualified, None)
        };
        let prefix = &caps["prefix"];
        let start_line = self.lines.number(keyword_at);

        entities.push(EntityFacts {
            identity_key: String::new(),
            name,
            qualified_name,
            kind,
            start_line,
            end_line: start_line,
            signature: self.signature(at, keyword_at),
            docstring: self.docstring(at),
            visibility: visibility_of(prefix),
            inherits: parse_inherits(&self.masked.text[header_at..brace]),
            extended_type,
            members: Vec::new(),
        });
        Ok(Some(brace))
    }

    /// Record the member(s) declared by `rest`; returns where scanning resumes.
    fn match_members(&self, rest: &str, at: usize, owner: &mut EntityFacts) -> Option<usize> {
        let caps = MEMBER_RE.captures(rest)?;
        let keyword = &caps["kw"];
        let kind = MemberKind::from_keyword(keyword)?;
        let whole_end = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let after = &rest[whole_end..];

        let names: Vec<String> = match kind {
            MemberKind::Method => func_name(after).into_iter().collect(),
            MemberKind::Initializer => vec!["init".to_string()],
            MemberKind::Deinitializer => vec!["deinit".to_string()],
            MemberKind::Subscript => vec!["subscript".to_string()],
            MemberKind::Case => case_names(after),
            MemberKind::Property | MemberKind::Typealias | MemberKind::AssociatedType => {
                leading_identifier(after).map(str::to_string).into_iter().collect()
            }
        };
        if names.is_empty() {
            return None;
        }

        let prefix = &caps["prefix"];
        let keyword_at = at + caps.name("kw").map(|m| m.start()).unwrap_or(0);
        let signature = self.signature(at, keyword_at);
        let visibility = visibility_of(prefix);
        let start_line = self.lines.number(keyword_at);
        let static_member = is_static(prefix);
        for name in names {
            owner.members.push(MemberFacts {
                name,
                kind,
                signature: signature.clone(),
                visibility: visibility.clone(),
                start_line,
                is_static: static_member,
            });
        }
        Some(at + whole_end)
    }
}

/// `kind:qualified@path`, with `#2`, `#3`, ... on repeats in declaration order.
fn assign_identity_keys(path: &str, entities: &mut [EntityFacts]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for entity in entities.iter_mut() {
        let base = identity_key(entity.kind, &entity.qualified_name, path);
        let count = seen.entry(base.clone()).or_insert(0);
        *count += 1;
        entity.identity_key = if *count == 1 {
            base
        } else {
            format!("{base}#{count}")
        };
    }
}

/// Extract every type-level entity declared in one Swift file.
pub fn extract_swift(path: &str, source: &str) -> GraphResult<Vec<EntityFacts>> {
    let masked = mask_source(path, source)?;
    let extractor = Extractor {
        path,
        source,
        masked,
        lines: LineIndex::new(source),
    };
    extractor.run()
}
