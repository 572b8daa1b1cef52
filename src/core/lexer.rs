//! CP-002: Recipe lexing: logical lines and the block tree.
//!
//! Recipes are Ruby, but we never evaluate them. The lexer only needs enough
//! structure to find declaration boundaries:
//! - strip comments (quote-aware), skip `=begin`/`=end` blocks
//! - join continuation lines (open brackets, trailing operators, open strings)
//! - collect heredoc bodies
//! - pair `do`/`if`/`case`/`begin`/`def` openers with their `end`
//!
//! Nothing here fails. Unbalanced input produces unclosed blocks or stray
//! `end` nodes that the extractor turns into raw fragments.

use regex::Regex;
use std::sync::LazyLock;

static DO_OPENER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<head>.*?)\s*\bdo\s*(?:\|(?P<params>[^|]*)\|)?\s*$").expect("valid regex")
});

static EXPR_OPENER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=\s*(if|unless|case|begin)\b").expect("valid regex"));

static HEREDOC_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<<(?P<flag>[~-]?)(?P<q>['"]?)(?P<tag>[A-Z_][A-Z0-9_]*)(?P<q2>['"]?)"#)
        .expect("valid regex")
});

/// One statement after comment stripping and continuation joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalLine {
    /// Code text, trimmed.
    pub text: String,
    /// First physical line (1-based).
    pub start: usize,
    /// Last physical line, including heredoc bodies.
    pub end: usize,
    /// Heredoc bodies in the order their openers appear.
    pub heredocs: Vec<String>,
}

/// Structural kind of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    /// `header do |params|`.
    Do {
        head: String,
        params: Option<String>,
    },
    If,
    Unless,
    Case,
    Begin,
    /// `while`, `until`, `for`.
    Loop,
    /// `def`, `class`, `module`, or an expression block (`x = if ...`).
    Opaque,
}

/// One arm of a block: the body before any branch keyword, or an
/// `elsif`/`else`/`when`/`rescue`/`ensure` arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub keyword: String,
    pub condition: String,
    pub line: usize,
    pub children: Vec<Node>,
}

/// A block opener with its arms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub header: LogicalLine,
    pub branches: Vec<Branch>,
    /// Last physical line of the block (the `end`, or end of input).
    pub end_line: usize,
    pub closed: bool,
    /// Trailing `end if ...` / `end unless ...` condition.
    pub modifier: Option<Modifier>,
}

impl Block {
    /// All children across all arms, in source order.
    pub fn children(&self) -> impl Iterator<Item = &Node> {
        self.branches.iter().flat_map(|b| b.children.iter())
    }
}

/// A node in the block tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Stmt(LogicalLine),
    Block(Block),
    /// An `end` with no open block.
    Stray(LogicalLine),
}

impl Node {
    pub fn start(&self) -> usize {
        match self {
            Self::Stmt(l) | Self::Stray(l) => l.start,
            Self::Block(b) => b.header.start,
        }
    }

    pub fn end(&self) -> usize {
        match self {
            Self::Stmt(l) | Self::Stray(l) => l.end,
            Self::Block(b) => b.end_line,
        }
    }
}

// ============================================================================
// Physical → logical lines
// ============================================================================

/// Quote/bracket state carried across the physical lines of one statement.
#[derive(Debug, Default)]
struct Scanner {
    depth: i32,
    quote: Option<char>,
    interp: u32,
}

struct ScannedLine {
    code: String,
    heredoc_tags: Vec<(String, bool)>,
}

impl Scanner {
    /// Scan one physical line, returning the code portion (comment removed)
    /// and any heredoc openers.
    fn scan(&mut self, line: &str) -> ScannedLine {
        let chars: Vec<(usize, char)> = line.char_indices().collect();
        let mut cut = line.len();
        let mut i = 0;
        while i < chars.len() {
            let (pos, c) = chars[i];
            if let Some(q) = self.quote {
                match c {
                    '\\' => i += 1,
                    '#' if q == '"' && next_is(&chars, i, '{') => {
                        self.interp += 1;
                        i += 1;
                    }
                    '}' if self.interp > 0 => self.interp -= 1,
                    _ if c == q && self.interp == 0 => self.quote = None,
                    _ => {}
                }
            } else {
                match c {
                    '#' => {
                        cut = pos;
                        break;
                    }
                    '\'' | '"' | '`' => self.quote = Some(c),
                    '(' | '[' | '{' => self.depth += 1,
                    ')' | ']' | '}' => self.depth = (self.depth - 1).max(0),
                    '?' if i + 1 < chars.len() && !chars[i + 1].1.is_whitespace() => {
                        // character literal such as ?# or ?'
                        if i > 0 && chars[i - 1].1.is_whitespace() {
                            i += 1;
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        let code = line[..cut].to_string();
        let heredoc_tags = HEREDOC_OPEN
            .captures_iter(&code)
            .filter(|c| {
                // `a << B` pushes onto an array; heredocs have no space
                c.name("flag").is_some_and(|f| !f.as_str().is_empty())
                    || c.name("q").is_some_and(|q| !q.as_str().is_empty())
            })
            .map(|c| {
                let tag = c["tag"].to_string();
                let indented = &c["flag"] == "~";
                (tag, indented)
            })
            .collect();
        ScannedLine { code, heredoc_tags }
    }
}

fn next_is(chars: &[(usize, char)], i: usize, want: char) -> bool {
    chars.get(i + 1).is_some_and(|&(_, c)| c == want)
}

/// True if the statement visibly continues on the next line.
fn trailing_continuation(code: &str) -> bool {
    let t = code.trim_end();
    t.ends_with(',')
        || t.ends_with('\\')
        || t.ends_with("&&")
        || t.ends_with("||")
        || t.ends_with(" +")
        || t.ends_with(" and")
        || t.ends_with(" or")
        || (t.ends_with('.') && !t.ends_with(".."))
}

/// Remove the common leading indentation of `<<~` heredoc bodies.
fn dedent(lines: &[&str]) -> String {
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    lines
        .iter()
        .map(|l| l.get(indent..).unwrap_or_else(|| l.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split recipe text into logical lines. Blank and comment-only lines are
/// dropped; line numbers always refer to the original text.
pub fn logical_lines(source: &str) -> Vec<LogicalLine> {
    let physical: Vec<&str> = source.lines().collect();
    let mut out = Vec::new();
    let mut i = 0;

    while i < physical.len() {
        if physical[i].starts_with("=begin") {
            while i < physical.len() && !physical[i].starts_with("=end") {
                i += 1;
            }
            i += 1;
            continue;
        }

        let start = i + 1;
        let mut scanner = Scanner::default();
        let mut text = String::new();
        let mut heredocs = Vec::new();

        loop {
            let was_in_string = scanner.quote.is_some();
            let scanned = scanner.scan(physical[i]);
            let code = if was_in_string {
                scanned.code.as_str()
            } else {
                scanned.code.trim()
            };
            if was_in_string {
                text.push('\n');
            } else if !text.is_empty() && !code.is_empty() {
                text.push(' ');
            }
            text.push_str(code);
            i += 1;

            for (tag, indented) in scanned.heredoc_tags {
                let body_start = i;
                while i < physical.len() && physical[i].trim() != tag {
                    i += 1;
                }
                let body = &physical[body_start..i.min(physical.len())];
                heredocs.push(if indented {
                    dedent(body)
                } else {
                    body.join("\n")
                });
                if i < physical.len() {
                    i += 1; // terminator
                }
            }

            if i >= physical.len() {
                break;
            }
            if scanner.quote.is_some() {
                continue;
            }
            if scanner.depth > 0 {
                // an `end` at depth > 0 means the brackets never closed
                if physical[i].trim() == "end" {
                    break;
                }
                continue;
            }
            if trailing_continuation(&text) {
                continue;
            }
            break;
        }

        let text = text.trim().to_string();
        if text.is_empty() && heredocs.is_empty() {
            continue;
        }
        out.push(LogicalLine {
            text,
            start,
            end: i.max(start),
            heredocs,
        });
    }

    out
}

// ============================================================================
// Statement modifiers
// ============================================================================

/// A trailing `if`/`unless` condition on a statement or an `end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modifier {
    pub keyword: String,
    pub condition: String,
}

const OPERATOR_TAIL: &[char] = &[
    '=', '(', '[', '{', ',', '|', '&', '!', '?', ':', '+', '-', '*', '/', '<', '>', '%',
];
const OPERATOR_WORDS: &[&str] = &["and", "or", "not", "return", "then", "else", "do"];

fn ends_with_operator(head: &str) -> bool {
    head.ends_with(OPERATOR_TAIL) || OPERATOR_WORDS.contains(&last_word(head))
}

fn last_word(text: &str) -> &str {
    let start = text
        .char_indices()
        .rev()
        .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '_'))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    &text[start..]
}

/// Byte offsets of spaces and tabs outside quotes and brackets.
fn top_level_gaps(text: &str) -> Vec<usize> {
    let mut gaps = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (pos, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = (depth - 1).max(0),
            ' ' | '\t' if depth == 0 => gaps.push(pos),
            _ => {}
        }
    }
    gaps
}

/// Split a trailing `if`/`unless` modifier off a logical line.
///
/// Only a keyword at bracket depth zero, outside quotes, and after a
/// complete expression counts: `x = if y` and `a || if` are left alone.
pub fn split_modifier(text: &str) -> (&str, Option<Modifier>) {
    for pos in top_level_gaps(text) {
        let tail = &text[pos + 1..];
        for keyword in ["if", "unless"] {
            let Some(cond) = tail.strip_prefix(keyword) else {
                continue;
            };
            if !cond.starts_with([' ', '\t']) {
                continue;
            }
            let head = text[..pos].trim_end();
            let cond = cond.trim();
            if head.is_empty() || cond.is_empty() || ends_with_operator(head) {
                continue;
            }
            return (
                head,
                Some(Modifier {
                    keyword: keyword.to_string(),
                    condition: cond.to_string(),
                }),
            );
        }
    }
    (text, None)
}

/// A `head do |params| body end` block written on one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineDo<'a> {
    pub head: &'a str,
    pub params: Option<&'a str>,
    /// Statements between `do` and `end`, still `;`-joined.
    pub body: &'a str,
}

/// Recognize a complete `do ... end` block on a single logical line.
pub fn split_inline_do(text: &str) -> Option<InlineDo<'_>> {
    let before_end = text.strip_suffix("end")?;
    if !before_end.ends_with([' ', '\t', ';']) {
        return None;
    }
    for pos in top_level_gaps(text) {
        let Some(rest) = text[pos + 1..].strip_prefix("do") else {
            continue;
        };
        if !rest.starts_with([' ', '\t', ';', '|']) {
            continue;
        }
        let head = text[..pos].trim_end();
        if head.is_empty() {
            continue;
        }
        let rest = rest.trim_start();
        let (params, rest) = match rest.strip_prefix('|') {
            Some(after) => {
                let close = after.find('|')?;
                (Some(after[..close].trim()), &after[close + 1..])
            }
            None => (None, rest),
        };
        let body = rest.trim().strip_suffix("end")?;
        let body = body.trim().trim_matches(';').trim();
        return Some(InlineDo { head, params, body });
    }
    None
}

// ============================================================================
// Block tree
// ============================================================================

enum LineClass {
    Open(BlockKind, String),
    Arm(String, String),
    End(Option<Modifier>),
    Stmt,
}

fn first_word(text: &str) -> &str {
    let end = text
        .char_indices()
        .find(|&(_, c)| !(c.is_ascii_alphanumeric() || c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

fn rest_after<'a>(text: &'a str, word: &str) -> &'a str {
    text[word.len()..].trim()
}

fn is_one_liner(text: &str) -> bool {
    text.ends_with(" end") || text.ends_with(";end") || text == "end"
}

fn classify(text: &str) -> LineClass {
    let word = first_word(text);
    let rest = rest_after(text, word);
    match word {
        "end" if rest.is_empty() || rest.starts_with('.') || rest.starts_with(')') => {
            return LineClass::End(None);
        }
        "end" => {
            if let ("end", Some(modifier)) = split_modifier(text) {
                return LineClass::End(Some(modifier));
            }
        }
        "if" | "unless" if !is_one_liner(text) => {
            let cond = rest.strip_suffix(" then").unwrap_or(rest).trim().to_string();
            let kind = if word == "if" {
                BlockKind::If
            } else {
                BlockKind::Unless
            };
            return LineClass::Open(kind, cond);
        }
        "elsif" | "when" | "rescue" => {
            let cond = rest.split(" then ").next().unwrap_or(rest);
            let cond = cond.strip_suffix(" then").unwrap_or(cond).trim();
            return LineClass::Arm(word.to_string(), cond.to_string());
        }
        "else" | "ensure" if rest.is_empty() => {
            return LineClass::Arm(word.to_string(), String::new());
        }
        "case" if !is_one_liner(text) => {
            return LineClass::Open(BlockKind::Case, rest.to_string());
        }
        "begin" if rest.is_empty() => return LineClass::Open(BlockKind::Begin, String::new()),
        "while" | "until" | "for" if !is_one_liner(text) => {
            let cond = rest.strip_suffix(" do").unwrap_or(rest).trim().to_string();
            return LineClass::Open(BlockKind::Loop, format!("{} {}", word, cond));
        }
        "def" | "class" | "module" if !is_one_liner(text) => {
            return LineClass::Open(BlockKind::Opaque, text.to_string());
        }
        _ => {}
    }

    if let Some(caps) = DO_OPENER.captures(text) {
        let head = caps
            .name("head")
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        let params = caps.name("params").map(|m| m.as_str().trim().to_string());
        return LineClass::Open(BlockKind::Do { head, params }, String::new());
    }

    if EXPR_OPENER.is_match(text) && !is_one_liner(text) {
        return LineClass::Open(BlockKind::Opaque, text.to_string());
    }

    LineClass::Stmt
}

fn accepts_arm(kind: &BlockKind, keyword: &str) -> bool {
    match kind {
        BlockKind::If | BlockKind::Unless => matches!(keyword, "elsif" | "else"),
        BlockKind::Case => matches!(keyword, "when" | "else"),
        BlockKind::Begin | BlockKind::Do { .. } | BlockKind::Opaque => {
            matches!(keyword, "rescue" | "ensure" | "else")
        }
        BlockKind::Loop => false,
    }
}

fn opening_keyword(kind: &BlockKind) -> &'static str {
    match kind {
        BlockKind::Do { .. } => "do",
        BlockKind::If => "if",
        BlockKind::Unless => "unless",
        BlockKind::Case => "case",
        BlockKind::Begin => "begin",
        BlockKind::Loop => "loop",
        BlockKind::Opaque => "opaque",
    }
}

fn push_node(stack: &mut [Block], root: &mut Vec<Node>, node: Node) {
    match stack.last_mut().and_then(|b| b.branches.last_mut()) {
        Some(branch) => branch.children.push(node),
        None => root.push(node),
    }
}

/// Pair openers with their `end`s. Unclosed blocks at end of input are closed
/// implicitly with `closed = false`.
pub fn block_tree(lines: Vec<LogicalLine>) -> Vec<Node> {
    let last_line = lines.last().map(|l| l.end).unwrap_or(0);
    let mut root = Vec::new();
    let mut stack: Vec<Block> = Vec::new();

    for line in lines {
        match classify(&line.text) {
            LineClass::Open(kind, condition) => {
                let keyword = opening_keyword(&kind).to_string();
                let start = line.start;
                stack.push(Block {
                    kind,
                    header: line,
                    branches: vec![Branch {
                        keyword,
                        condition,
                        line: start,
                        children: Vec::new(),
                    }],
                    end_line: start,
                    closed: false,
                    modifier: None,
                });
            }
            LineClass::Arm(keyword, condition) => {
                match stack.last_mut() {
                    Some(top) if accepts_arm(&top.kind, &keyword) => {
                        top.branches.push(Branch {
                            keyword,
                            condition,
                            line: line.start,
                            children: Vec::new(),
                        });
                    }
                    // `rescue` as a statement modifier or an arm we do not model
                    _ => push_node(&mut stack, &mut root, Node::Stmt(line)),
                }
            }
            LineClass::End(modifier) => match stack.pop() {
                Some(mut block) => {
                    block.closed = true;
                    block.end_line = line.end;
                    block.modifier = modifier;
                    push_node(&mut stack, &mut root, Node::Block(block));
                }
                None => root.push(Node::Stray(line)),
            },
            LineClass::Stmt => push_node(&mut stack, &mut root, Node::Stmt(line)),
        }
    }

    while let Some(mut block) = stack.pop() {
        block.closed = false;
        block.end_line = last_line.max(block.header.end);
        push_node(&mut stack, &mut root, Node::Block(block));
    }

    root
}
