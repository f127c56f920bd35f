//! Tree-sitter extraction of top-level Go declarations

use std::cell::RefCell;
use tree_sitter::{Node, Parser};

// Parsers are costly to build and not `Sync`; every rayon worker keeps its own.
thread_local! {
    static GO_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // A grammar mismatch surfaces as a parse failure below.
        let _ = p.set_language(&tree_sitter_go::LANGUAGE.into());
        p
    });
}

/// Declarations found at the top level of one Go file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoFile {
    pub package: String,
    /// Package doc comment with the comment markers stripped.
    pub doc: Option<String>,
    /// Functions, with methods written `Recv.Name`.
    pub funcs: Vec<String>,
    pub types: Vec<String>,
    /// Package-level `var` and `const` names.
    pub vars: Vec<String>,
    pub has_errors: bool,
}

pub fn parse_go(content: &str) -> anyhow::Result<GoFile> {
    let tree = GO_PARSER
        .with(|p| p.borrow_mut().parse(content, None))
        .ok_or_else(|| anyhow::anyhow!("Failed to parse file"))?;
    let root = tree.root_node();

    let mut file = GoFile {
        has_errors: root.has_error(),
        ..Default::default()
    };
    let mut pending_comments: Vec<String> = Vec::new();
    let mut last_comment_row = None;
    let mut cursor = root.walk();

    for node in root.named_children(&mut cursor) {
        match node.kind() {
            "comment" => {
                // A blank line breaks the block.
                if last_comment_row.is_some_and(|row: usize| row + 1 < node.start_position().row) {
                    pending_comments.clear();
                }
                pending_comments.push(node_text(&node, content).to_string());
                last_comment_row = Some(node.end_position().row);
                continue;
            }
            "package_clause" => {
                if let Some(name) = first_named_of_kind(&node, "package_identifier") {
                    file.package = node_text(&name, content).to_string();
                }
                let touches = last_comment_row
                    .is_some_and(|row| row + 1 >= node.start_position().row);
                if !pending_comments.is_empty() && touches {
                    file.doc = Some(strip_comment_markers(&pending_comments));
                }
            }
            "function_declaration" => {
                if let Some(name) = node.child_by_field_name("name") {
                    file.funcs.push(node_text(&name, content).to_string());
                }
            }
            "method_declaration" => {
                if let Some(name) = node.child_by_field_name("name") {
                    let method = node_text(&name, content);
                    let qualified = match node
                        .child_by_field_name("receiver")
                        .and_then(|r| receiver_type(node_text(&r, content)))
                    {
                        Some(recv) => format!("{}.{}", recv, method),
                        None => method.to_string(),
                    };
                    file.funcs.push(qualified);
                }
            }
            "type_declaration" => {
                collect_spec_names(&node, content, &["type_spec", "type_alias"], &mut file.types);
            }
            "var_declaration" | "const_declaration" => {
                collect_spec_names(&node, content, &["var_spec", "const_spec"], &mut file.vars);
            }
            _ => {}
        }
        pending_comments.clear();
        last_comment_row = None;
    }

    Ok(file)
}

/// Walk a declaration (grouped or not) for spec nodes and collect their names.
fn collect_spec_names(node: &Node, content: &str, spec_kinds: &[&str], out: &mut Vec<String>) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if spec_kinds.contains(&child.kind()) {
            let mut names_cursor = child.walk();
            for name in child.children_by_field_name("name", &mut names_cursor) {
                let text = node_text(&name, content);
                if text != "_" {
                    out.push(text.to_string());
                }
            }
        } else if child.kind().ends_with("_spec_list") {
            collect_spec_names(&child, content, spec_kinds, out);
        }
    }
}

/// `(s *Server)` -> `Server`, `(l List[T])` -> `List`.
fn receiver_type(receiver: &str) -> Option<String> {
    let inner = receiver.trim().trim_start_matches('(').trim_end_matches(')');
    let inner = inner.split('[').next().unwrap_or(inner);
    let ty = inner.split_whitespace().last()?.trim_start_matches('*');
    (!ty.is_empty()).then(|| ty.to_string())
}

fn first_named_of_kind<'a>(node: &Node<'a>, kind: &str) -> Option<Node<'a>> {
    let mut cursor = node.walk();
    let found = node.named_children(&mut cursor).find(|n| n.kind() == kind);
    found
}

fn strip_comment_markers(comments: &[String]) -> String {
    let mut lines = Vec::new();
    for comment in comments {
        if let Some(body) = comment.strip_prefix("/*") {
            let body = body.strip_suffix("*/").unwrap_or(body);
            lines.extend(body.lines().map(|l| l.trim().trim_start_matches('*').trim()));
        } else {
            lines.push(comment.trim_start_matches("//").trim());
        }
    }
    lines
        .into_iter()
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn node_text<'a>(node: &Node, content: &'a str) -> &'a str {
    &content[node.start_byte()..node.end_byte()]
}
