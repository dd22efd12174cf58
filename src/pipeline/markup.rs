//! Source markup → destination markup.
//!
//! Discord-flavoured markdown is parsed into a small node tree, find/replace
//! rules run over the tree's text, and the tree is rendered into a flat run of
//! atoms for the destination parse mode. Splitting works on atoms, so a block
//! boundary never falls inside a tag or an escape sequence, and every block
//! closes the spans it opened.

use crate::config::{ParseMode, ReplacementRule};
use crate::error::FormatError;

/// Inline emphasis kinds shared by source and destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Bold,
    Italic,
    Underline,
    Strike,
    Spoiler,
}

/// Parsed markup node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Styled(Style, Vec<Node>),
    Code(String),
    Pre { language: Option<String>, code: String },
    Link { label: Vec<Node>, url: String },
}

/// Characters a backslash may escape in source markup.
const SOURCE_ESCAPABLE: &str = "\\*_~|`[]()<>#-.!";

/// Characters reserved by MarkdownV2 outside code spans.
const MARKDOWN_V2_RESERVED: &str = "_*[]()~`>#+-=|{}.!\\";

// ── Parsing ─────────────────────────────────────────────────────────

/// Parse source markup into nodes. Unterminated markers stay literal.
pub fn parse(input: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    let mut text = String::new();
    let mut i = 0;

    while i < input.len() {
        let rest = &input[i..];

        if let Some(escaped) = rest.strip_prefix('\\') {
            if let Some(c) = escaped.chars().next().filter(|c| SOURCE_ESCAPABLE.contains(*c)) {
                text.push(c);
                i += 1 + c.len_utf8();
                continue;
            }
        }

        if let Some((node, consumed)) = parse_construct(input, i) {
            flush(&mut text, &mut nodes);
            nodes.push(node);
            i += consumed;
            continue;
        }

        // `rest` is non-empty inside the loop.
        let c = rest.chars().next().unwrap_or_default();
        text.push(c);
        i += c.len_utf8();
    }

    flush(&mut text, &mut nodes);
    nodes
}

fn flush(text: &mut String, nodes: &mut Vec<Node>) {
    if !text.is_empty() {
        nodes.push(Node::Text(std::mem::take(text)));
    }
}

/// Try every construct starting at byte `at`; returns the node and bytes used.
fn parse_construct(input: &str, at: usize) -> Option<(Node, usize)> {
    let rest = &input[at..];

    if let Some(body) = rest.strip_prefix("```") {
        let end = body.find("```")?;
        let inner = &body[..end];
        let (language, code) = match inner.split_once('\n') {
            Some((first, code)) if !first.is_empty() && !first.contains(char::is_whitespace) => {
                (Some(first.to_string()), code)
            }
            _ => (None, inner.strip_prefix('\n').unwrap_or(inner)),
        };
        let code = code.strip_suffix('\n').unwrap_or(code);
        return Some((
            Node::Pre {
                language,
                code: code.to_string(),
            },
            3 + end + 3,
        ));
    }

    if let Some(body) = rest.strip_prefix('`') {
        let end = body.find('`')?;
        if end == 0 {
            return None;
        }
        return Some((Node::Code(body[..end].to_string()), end + 2));
    }

    for (delim, style) in [
        ("**", Style::Bold),
        ("__", Style::Underline),
        ("~~", Style::Strike),
        ("||", Style::Spoiler),
    ] {
        if rest.starts_with(delim) {
            if let Some((node, used)) = parse_span(rest, delim, style, false) {
                return Some((node, used));
            }
        }
    }

    for delim in ["*", "_"] {
        if rest.starts_with(delim) {
            if delim == "_" && preceded_by_word_char(input, at) {
                continue;
            }
            if let Some((node, used)) = parse_span(rest, delim, Style::Italic, true) {
                return Some((node, used));
            }
        }
    }

    if rest.starts_with('[') {
        return parse_link(rest);
    }

    None
}

fn preceded_by_word_char(input: &str, at: usize) -> bool {
    input[..at].chars().next_back().is_some_and(char::is_alphanumeric)
}

fn parse_span(rest: &str, delim: &str, style: Style, single: bool) -> Option<(Node, usize)> {
    let body = &rest[delim.len()..];
    let end = find_closing(body, delim, single)?;
    let inner = &body[..end];
    if inner.is_empty() || inner.starts_with(char::is_whitespace) || inner.ends_with(char::is_whitespace) {
        return None;
    }
    if delim == "_" && body[end + 1..].chars().next().is_some_and(char::is_alphanumeric) {
        return None;
    }
    Some((Node::Styled(style, parse(inner)), delim.len() * 2 + end))
}

/// Find the closing delimiter, skipping escaped characters. Single-character
/// delimiters ignore doubled runs such as `**` inside an `*italic*` span.
fn find_closing(body: &str, delim: &str, single: bool) -> Option<usize> {
    let bytes = body.as_bytes();
    let d = delim.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i..].starts_with(d) {
            if single {
                let mut run = 0;
                while i + run < bytes.len() && bytes[i + run] == d[0] {
                    run += 1;
                }
                if run == 1 {
                    return Some(i);
                }
                i += run;
                continue;
            }
            let mut run = 0;
            while i + run < bytes.len() && bytes[i + run] == d[0] {
                run += 1;
            }
            return Some(i + run - d.len());
        }
        i += 1;
    }
    None
}

fn parse_link(rest: &str) -> Option<(Node, usize)> {
    let close = rest.find("](")?;
    let label = &rest[1..close];
    let after = &rest[close + 2..];
    let end = after.find(')')?;
    let url = after[..end].trim();
    if label.is_empty() || !(url.starts_with("http://") || url.starts_with("https://")) {
        return None;
    }
    Some((
        Node::Link {
            label: parse(label),
            url: url.to_string(),
        },
        close + 2 + end + 1,
    ))
}

// ── Tree operations ─────────────────────────────────────────────────

/// Apply replacement rules, in declaration order, to every text run and code
/// span. URLs are left untouched. Nodes emptied by a rule are dropped.
pub fn apply_replacements(nodes: &mut Vec<Node>, rules: &[ReplacementRule]) {
    if rules.is_empty() {
        return;
    }
    for node in nodes.iter_mut() {
        match node {
            Node::Text(text) | Node::Code(text) | Node::Pre { code: text, .. } => {
                *text = replace_all(text, rules);
            }
            Node::Styled(_, children) | Node::Link { label: children, .. } => {
                apply_replacements(children, rules);
            }
        }
    }
    nodes.retain(|node| !is_empty(node));
}

/// Apply replacement rules to a plain string.
pub fn replace_all(text: &str, rules: &[ReplacementRule]) -> String {
    rules
        .iter()
        .filter(|rule| !rule.find.is_empty())
        .fold(text.to_string(), |acc, rule| acc.replace(&rule.find, &rule.replace))
}

fn is_empty(node: &Node) -> bool {
    match node {
        Node::Text(text) | Node::Code(text) => text.is_empty(),
        Node::Pre { code, .. } => code.is_empty(),
        Node::Styled(_, children) => children.iter().all(is_empty),
        Node::Link { .. } => false,
    }
}

/// Visible text of a node list, markup removed.
pub fn plain_text(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            Node::Text(text) | Node::Code(text) => out.push_str(text),
            Node::Pre { code, .. } => out.push_str(code),
            Node::Styled(_, children) | Node::Link { label: children, .. } => {
                out.push_str(&plain_text(children))
            }
        }
    }
    out
}

// ── Rendering ───────────────────────────────────────────────────────

/// Indivisible piece of rendered output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Atom {
    /// Opens a span; `close` is the matching closing markup.
    Open { open: String, close: String },
    /// Closes the innermost open span.
    Close,
    /// One source character, already escaped.
    Char { rendered: String, whitespace: bool, newline: bool },
}

/// Render nodes into atoms for a parse mode.
pub fn render(nodes: &[Node], mode: ParseMode) -> Vec<Atom> {
    let mut atoms = Vec::new();
    render_into(nodes, mode, &mut atoms);
    atoms
}

/// Render plain text (no markup) into atoms.
pub fn render_plain(text: &str, mode: ParseMode) -> Vec<Atom> {
    let mut atoms = Vec::new();
    push_text(text, mode, TextContext::Normal, &mut atoms);
    atoms
}

/// Concatenate atoms into a string. Close atoms must already be resolved,
/// so this is only valid for balanced atom runs.
pub fn to_string(atoms: &[Atom]) -> String {
    let mut out = String::new();
    let mut stack: Vec<&str> = Vec::new();
    for atom in atoms {
        match atom {
            Atom::Open { open, close } => {
                out.push_str(open);
                stack.push(close);
            }
            Atom::Close => {
                if let Some(close) = stack.pop() {
                    out.push_str(close);
                }
            }
            Atom::Char { rendered, .. } => out.push_str(rendered),
        }
    }
    out
}

/// Escape plain text for a parse mode.
pub fn escape(text: &str, mode: ParseMode) -> String {
    to_string(&render_plain(text, mode))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TextContext {
    Normal,
    Code,
}

fn render_into(nodes: &[Node], mode: ParseMode, atoms: &mut Vec<Atom>) {
    for node in nodes {
        match node {
            Node::Text(text) => push_text(text, mode, TextContext::Normal, atoms),
            Node::Styled(style, children) => {
                let (open, close) = style_tags(*style, mode);
                wrap(atoms, open, close, |atoms| render_into(children, mode, atoms));
            }
            Node::Code(code) => {
                let (open, close) = match mode {
                    ParseMode::Html => ("<code>".to_string(), "</code>".to_string()),
                    ParseMode::MarkdownV2 => ("`".to_string(), "`".to_string()),
                    ParseMode::Text => (String::new(), String::new()),
                };
                wrap(atoms, open, close, |atoms| push_text(code, mode, TextContext::Code, atoms));
            }
            Node::Pre { language, code } => {
                let (open, close) = match (mode, language) {
                    (ParseMode::Html, Some(lang)) => (
                        format!(
                            "<pre><code class=\"language-{}\">",
                            html_escape::encode_double_quoted_attribute(lang)
                        ),
                        "</code></pre>".to_string(),
                    ),
                    (ParseMode::Html, None) => ("<pre>".to_string(), "</pre>".to_string()),
                    (ParseMode::MarkdownV2, lang) => (
                        format!("```{}\n", lang.as_deref().unwrap_or_default()),
                        "\n```".to_string(),
                    ),
                    (ParseMode::Text, _) => (String::new(), String::new()),
                };
                wrap(atoms, open, close, |atoms| push_text(code, mode, TextContext::Code, atoms));
            }
            Node::Link { label, url } => match mode {
                ParseMode::Html => {
                    let open = format!("<a href=\"{}\">", html_escape::encode_double_quoted_attribute(url));
                    wrap(atoms, open, "</a>".to_string(), |atoms| render_into(label, mode, atoms));
                }
                ParseMode::MarkdownV2 => {
                    let close = format!("]({})", url.replace('\\', "\\\\").replace(')', "\\)"));
                    wrap(atoms, "[".to_string(), close, |atoms| render_into(label, mode, atoms));
                }
                ParseMode::Text => {
                    render_into(label, mode, atoms);
                    push_text(&format!(" ({url})"), mode, TextContext::Normal, atoms);
                }
            },
        }
    }
}

fn wrap(atoms: &mut Vec<Atom>, open: String, close: String, body: impl FnOnce(&mut Vec<Atom>)) {
    if open.is_empty() && close.is_empty() {
        body(atoms);
        return;
    }
    atoms.push(Atom::Open { open, close });
    body(atoms);
    atoms.push(Atom::Close);
}

fn style_tags(style: Style, mode: ParseMode) -> (String, String) {
    let (open, close) = match (mode, style) {
        (ParseMode::Html, Style::Bold) => ("<b>", "</b>"),
        (ParseMode::Html, Style::Italic) => ("<i>", "</i>"),
        (ParseMode::Html, Style::Underline) => ("<u>", "</u>"),
        (ParseMode::Html, Style::Strike) => ("<s>", "</s>"),
        (ParseMode::Html, Style::Spoiler) => ("<tg-spoiler>", "</tg-spoiler>"),
        (ParseMode::MarkdownV2, Style::Bold) => ("*", "*"),
        (ParseMode::MarkdownV2, Style::Italic) => ("_", "_"),
        (ParseMode::MarkdownV2, Style::Underline) => ("__", "__"),
        (ParseMode::MarkdownV2, Style::Strike) => ("~", "~"),
        (ParseMode::MarkdownV2, Style::Spoiler) => ("||", "||"),
        (ParseMode::Text, _) => ("", ""),
    };
    (open.to_string(), close.to_string())
}

fn push_text(text: &str, mode: ParseMode, context: TextContext, atoms: &mut Vec<Atom>) {
    for c in text.chars() {
        let rendered = match mode {
            ParseMode::Html => match c {
                '&' | '<' | '>' => html_escape::encode_text(&c.to_string()).into_owned(),
                _ => c.to_string(),
            },
            ParseMode::MarkdownV2 => {
                let reserved = match context {
                    TextContext::Normal => MARKDOWN_V2_RESERVED.contains(c),
                    TextContext::Code => c == '`' || c == '\\',
                };
                if reserved { format!("\\{c}") } else { c.to_string() }
            }
            ParseMode::Text => c.to_string(),
        };
        atoms.push(Atom::Char {
            rendered,
            whitespace: c.is_whitespace(),
            newline: c == '\n',
        });
    }
}

// ── Splitting ───────────────────────────────────────────────────────

/// Split rendered atoms into blocks of at most `limit` characters.
///
/// Breaks prefer a newline, then any whitespace outside open spans, then
/// whitespace inside a span (the span is closed and reopened across the
/// break), and only then an arbitrary atom boundary. Every block except the
/// last carries `ellipsis`. Dropping the ellipsis and the reopened/closed
/// tags and concatenating the blocks gives back the unsplit text.
pub fn split(atoms: &[Atom], limit: usize, ellipsis: &str) -> Result<Vec<String>, SplitError> {
    let ellipsis_len = ellipsis.chars().count();
    let mut blocks = Vec::new();
    let mut carried: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    while pos < atoms.len() {
        let prefix: String = carried.iter().map(|(open, _)| open.as_str()).collect();
        let prefix_len = prefix.chars().count();

        let cut = if prefix_len + rendered_len(&carried, &atoms[pos..]) <= limit {
            None
        } else {
            let cut = find_cut(&carried, &atoms[pos..], prefix_len, limit, ellipsis_len)
                .ok_or(SplitError { limit })?;
            Some(Cut {
                end: pos + cut.end,
                ..cut
            })
        };
        let end = cut.map_or(atoms.len() - 1, |cut| cut.end);

        let mut stack = carried;
        let mut body = prefix;
        for atom in &atoms[pos..=end] {
            match atom {
                Atom::Open { open, close } => {
                    body.push_str(open);
                    stack.push((open.clone(), close.clone()));
                }
                Atom::Close => {
                    if let Some((_, close)) = stack.pop() {
                        body.push_str(&close);
                    }
                }
                Atom::Char { rendered, .. } => body.push_str(rendered),
            }
        }

        if let Some(cut) = cut {
            match &atoms[cut.end] {
                Atom::Char { rendered, .. } if cut.whitespace && cut.depth == 0 => {
                    // Marker goes before the trailing whitespace character.
                    body.truncate(body.len() - rendered.len());
                    body.push_str(ellipsis);
                    body.push_str(rendered);
                }
                _ => {
                    let closing: String = stack.iter().rev().map(|(_, close)| close.as_str()).collect();
                    body.push_str(&closing);
                    body.push_str(ellipsis);
                }
            }
        }

        blocks.push(body);
        carried = stack;
        pos = end + 1;
    }

    Ok(blocks)
}

/// Length of `atoms` rendered after the spans in `carried`, closes included.
fn rendered_len(carried: &[(String, String)], atoms: &[Atom]) -> usize {
    let mut stack: Vec<usize> = carried.iter().map(|(_, close)| close.chars().count()).collect();
    let mut len = 0;
    for atom in atoms {
        match atom {
            Atom::Open { open, close } => {
                len += open.chars().count();
                stack.push(close.chars().count());
            }
            Atom::Close => len += stack.pop().unwrap_or_default(),
            Atom::Char { rendered, .. } => len += rendered.chars().count(),
        }
    }
    len + stack.iter().sum::<usize>()
}

/// Best break point in `atoms`, relative to the slice start.
fn find_cut(
    carried: &[(String, String)],
    atoms: &[Atom],
    prefix_len: usize,
    limit: usize,
    ellipsis_len: usize,
) -> Option<Cut> {
    let mut stack: Vec<usize> = carried.iter().map(|(_, close)| close.chars().count()).collect();
    let mut len = prefix_len;
    let mut best = Candidates::default();

    for (i, atom) in atoms.iter().enumerate() {
        match atom {
            Atom::Open { open, close } => {
                len += open.chars().count();
                stack.push(close.chars().count());
            }
            Atom::Close => len += stack.pop().unwrap_or_default(),
            Atom::Char { rendered, .. } => len += rendered.chars().count(),
        }
        let closing: usize = stack.iter().sum();
        if len + closing + ellipsis_len > limit {
            break;
        }

        let depth = stack.len();
        if let Atom::Char {
            whitespace: true,
            newline,
            ..
        } = atom
        {
            let cut = Cut {
                end: i,
                depth,
                whitespace: true,
            };
            if depth == 0 {
                if *newline {
                    best.newline = Some((cut, len));
                }
                best.space = Some(cut);
            } else {
                best.nested_space = Some(cut);
            }
        }
        if !matches!(atom, Atom::Open { .. }) {
            best.hard = Some(Cut {
                end: i,
                depth,
                whitespace: false,
            });
        }
    }

    best.choose(limit)
}

#[derive(Debug, Clone, Copy)]
struct Cut {
    end: usize,
    depth: usize,
    whitespace: bool,
}

#[derive(Default)]
struct Candidates {
    /// Last newline outside spans, with the block length at that point.
    newline: Option<(Cut, usize)>,
    space: Option<Cut>,
    nested_space: Option<Cut>,
    hard: Option<Cut>,
}

impl Candidates {
    fn choose(&self, limit: usize) -> Option<Cut> {
        if let Some((cut, len)) = self.newline {
            if len * 2 >= limit {
                return Some(cut);
            }
        }
        self.space
            .or(self.newline.map(|(cut, _)| cut))
            .or(self.nested_space)
            .or(self.hard)
    }
}

/// The limit cannot fit even one atom plus the markup around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitError {
    pub limit: usize,
}

impl SplitError {
    pub fn into_format_error(self, id: impl Into<String>) -> FormatError {
        FormatError::LimitTooSmall {
            id: id.into(),
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html(input: &str) -> String {
        to_string(&render(&parse(input), ParseMode::Html))
    }

    fn rule(find: &str, replace: &str) -> ReplacementRule {
        ReplacementRule {
            find: find.into(),
            replace: replace.into(),
        }
    }

    /// Tags open minus tags closed, for `<b>`-style HTML.
    fn balanced(block: &str) -> bool {
        let mut stack: Vec<String> = Vec::new();
        let mut rest = block;
        while let Some(start) = rest.find('<') {
            let Some(end) = rest[start..].find('>') else {
                return false;
            };
            let tag = &rest[start + 1..start + end];
            if let Some(name) = tag.strip_prefix('/') {
                if stack.pop().as_deref() != Some(name) {
                    return false;
                }
            } else {
                let name = tag.split_whitespace().next().unwrap_or_default();
                stack.push(name.to_string());
            }
            rest = &rest[start + end + 1..];
        }
        stack.is_empty()
    }

    #[test]
    fn converts_emphasis_to_html() {
        assert_eq!(html("Hello **world**"), "Hello <b>world</b>");
        assert_eq!(html("*it* and _it_"), "<i>it</i> and <i>it</i>");
        assert_eq!(html("__under__ ~~gone~~ ||secret||"), "<u>under</u> <s>gone</s> <tg-spoiler>secret</tg-spoiler>");
    }

    #[test]
    fn nested_emphasis() {
        assert_eq!(html("**bold *and italic***"), "<b>bold <i>and italic</i></b>");
    }

    #[test]
    fn code_is_escaped_not_parsed() {
        assert_eq!(html("`a **b** <c>`"), "<code>a **b** &lt;c&gt;</code>");
        assert_eq!(
            html("```rust\nfn main() {}\n```"),
            "<pre><code class=\"language-rust\">fn main() {}</code></pre>"
        );
        assert_eq!(html("```\nplain\n```"), "<pre>plain</pre>");
    }

    #[test]
    fn masked_links() {
        assert_eq!(
            html("see [the docs](https://example.com/a?b=1&c=2)"),
            "see <a href=\"https://example.com/a?b=1&amp;c=2\">the docs</a>"
        );
        assert_eq!(html("[not a link](ftp://x)"), "[not a link](ftp://x)");
    }

    #[test]
    fn escapes_reserved_html() {
        assert_eq!(html("a < b & c > d"), "a &lt; b &amp; c &gt; d");
    }

    #[test]
    fn unterminated_markers_stay_literal() {
        assert_eq!(html("2 * 3 = 6"), "2 * 3 = 6");
        assert_eq!(html("**open"), "**open");
        assert_eq!(html("snake_case_name"), "snake_case_name");
    }

    #[test]
    fn backslash_escapes_markers() {
        assert_eq!(html(r"\*not italic\*"), "*not italic*");
    }

    #[test]
    fn markdown_v2_escaping() {
        let out = to_string(&render(&parse("Hi. **Bold!** `a_b`"), ParseMode::MarkdownV2));
        assert_eq!(out, "Hi\\. *Bold\\!* `a_b`");
    }

    #[test]
    fn markdown_v2_link_escapes_url() {
        let link = Node::Link {
            label: vec![Node::Text("x.y".into())],
            url: "https://e.com/a)b".into(),
        };
        let out = to_string(&render(&[link], ParseMode::MarkdownV2));
        assert_eq!(out, "[x\\.y](https://e.com/a\\)b)");
    }

    #[test]
    fn plain_text_mode_drops_markup() {
        let out = to_string(&render(&parse("**Hi** [docs](https://e.com)"), ParseMode::Text));
        assert_eq!(out, "Hi docs (https://e.com)");
    }

    #[test]
    fn replacements_run_in_order_single_pass() {
        let mut nodes = parse("cat dog");
        apply_replacements(&mut nodes, &[rule("cat", "dog"), rule("dog", "bird")]);
        assert_eq!(plain_text(&nodes), "bird bird");

        let mut nodes = parse("aa");
        apply_replacements(&mut nodes, &[rule("a", "aa")]);
        assert_eq!(plain_text(&nodes), "aaaa");
    }

    #[test]
    fn replacement_can_delete_a_span() {
        let mut nodes = parse("keep **@everyone**");
        apply_replacements(&mut nodes, &[rule("@everyone", "")]);
        assert_eq!(to_string(&render(&nodes, ParseMode::Html)), "keep ");
    }

    #[test]
    fn replacements_do_not_touch_urls() {
        let mut nodes = parse("[site](https://old.example)");
        apply_replacements(&mut nodes, &[rule("old", "new")]);
        assert_eq!(
            to_string(&render(&nodes, ParseMode::Html)),
            "<a href=\"https://old.example\">site</a>"
        );
    }

    #[test]
    fn short_text_is_one_block() {
        let atoms = render(&parse("hello"), ParseMode::Html);
        assert_eq!(split(&atoms, 100, "…").unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn empty_text_yields_no_blocks() {
        assert!(split(&[], 10, "…").unwrap().is_empty());
    }

    #[test]
    fn splits_at_whitespace_within_limit() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let atoms = render(&parse(text), ParseMode::Html);
        let blocks = split(&atoms, 16, "…").unwrap();
        assert!(blocks.len() > 1);
        for block in &blocks {
            assert!(block.chars().count() <= 16, "{block:?} too long");
        }
        assert_eq!(blocks.concat().replace('…', ""), text);
    }

    #[test]
    fn never_splits_inside_a_tag_and_keeps_balance() {
        let text = "intro words here **bold words that run long** and then *more italic text* to finish";
        let atoms = render(&parse(text), ParseMode::Html);
        let blocks = split(&atoms, 30, "…").unwrap();
        for block in &blocks {
            assert!(block.chars().count() <= 30, "{block:?} too long");
            assert!(balanced(block), "{block:?} unbalanced");
        }
    }

    #[test]
    fn prefers_breaks_outside_spans() {
        let text = "one two **three four** five";
        let atoms = render(&parse(text), ParseMode::Html);
        let blocks = split(&atoms, 24, "").unwrap();
        assert_eq!(blocks[0], "one two ");
        assert_eq!(blocks[1], "<b>three four</b> five");
    }

    #[test]
    fn reopens_span_when_forced_inside() {
        let text = "**aaaa bbbb cccc dddd**";
        let atoms = render(&parse(text), ParseMode::Html);
        let blocks = split(&atoms, 16, "").unwrap();
        assert!(blocks.len() > 1);
        for block in &blocks {
            assert!(block.starts_with("<b>") && block.ends_with("</b>"), "{block:?}");
            assert!(block.chars().count() <= 16);
        }
        let joined = blocks.concat().replace("<b>", "").replace("</b>", "");
        assert_eq!(joined, "aaaa bbbb cccc dddd");
    }

    #[test]
    fn hard_split_without_whitespace() {
        let atoms = render(&parse("abcdefghij"), ParseMode::Html);
        let blocks = split(&atoms, 4, "").unwrap();
        assert_eq!(blocks, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn escapes_are_never_cut() {
        let atoms = render(&parse("&&&&&&"), ParseMode::Html);
        let blocks = split(&atoms, 10, "").unwrap();
        for block in &blocks {
            assert!(block.chars().count() <= 10);
            assert_eq!(block.matches("&amp;").count() * 5, block.len());
        }
    }

    #[test]
    fn limit_too_small_is_an_error() {
        let atoms = render(&parse("**abc**"), ParseMode::Html);
        assert!(split(&atoms, 3, "…").is_err());
    }

    #[test]
    fn prefers_newline_in_second_half() {
        let text = "first line is here\nsecond part goes on";
        let atoms = render(&parse(text), ParseMode::Html);
        let blocks = split(&atoms, 30, "…").unwrap();
        assert_eq!(blocks[0], "first line is here…\n");
        assert_eq!(blocks[1], "second part goes on");
    }
}
