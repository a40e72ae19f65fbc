/// Builds a `DocumentIndex` tree from heading-structured intermediate markdown.
///
/// - `#`..`######` headings open a node whose depth is the heading level; a heading
///   becomes the child of the closest preceding heading with a lower level.
/// - Text between headings belongs to the most recently opened node. Text before the
///   first heading belongs to the synthetic root.
/// - Lines inside fenced code blocks are never treated as headings.
///
/// Parser approach: line-by-line state machine with a stack of open headings.
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::AppError;
use crate::model::{DocumentIndex, DocumentType, NodeIdx, TreeBuilder};

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})(?:\s+(.*?))?\s*$").expect("valid regex"));
static SECTION_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,3}(?:\.\d+)*(?:\.[a-z](?:\.\d+)*)?)(?:[.\s]\s*(.*))?$").expect("valid regex")
});
static TOKEN_PIECE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+|[^\s\p{L}\p{N}]").expect("valid regex"));

const MAX_SLUG_LEN: usize = 60;

/// SHA-256 of the markdown text, hex encoded. Stored as `source_hash`.
pub fn content_hash(markdown: &str) -> String {
    let digest = Sha256::digest(markdown.as_bytes());
    format!("{digest:x}")
}

/// Approximate model token count.
///
/// Words are split into pieces of up to four characters and every punctuation mark
/// counts as one token, which tracks BPE tokenizers closely enough for budgeting.
pub fn count_tokens(text: &str) -> usize {
    TOKEN_PIECE_RE
        .find_iter(text)
        .map(|m| {
            let chars = m.as_str().chars().count();
            chars.div_ceil(4).max(1)
        })
        .sum()
}

/// Build a tree from markdown text. Byte-identical input yields an identical tree.
///
/// Fails with `AppError::Parse` when the document is empty or a heading has no text.
/// A document without any heading is valid and yields a root-only tree.
pub fn build(
    document_name: &str,
    document_type: DocumentType,
    markdown: &str,
) -> Result<DocumentIndex, AppError> {
    if markdown.trim().is_empty() {
        return Err(AppError::Parse {
            line: 0,
            message: format!("document '{document_name}' is empty"),
        });
    }

    let mut builder = TreeBuilder::new(document_name, document_type);
    // (heading level, node) for every open heading; level 0 is the root.
    let mut stack: Vec<(usize, NodeIdx)> = vec![(0, builder.root())];
    let mut current = builder.root();
    let mut content_lines: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut heading_count = 0usize;

    for (line_no, line) in markdown.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        let heading = if in_fence { None } else { HEADING_RE.captures(line) };
        let Some(caps) = heading else {
            if !line.trim().is_empty() || !content_lines.is_empty() {
                content_lines.push(line);
            }
            continue;
        };

        flush_content(&mut builder, current, &mut content_lines);

        let level = caps[1].len();
        let text = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        if text.is_empty() {
            return Err(AppError::Parse {
                line: line_no + 1,
                message: "heading has no text".to_string(),
            });
        }
        let (section_number, title) = split_section_number(text);

        while stack.len() > 1 && stack.last().is_some_and(|(open, _)| *open >= level) {
            stack.pop();
        }
        let parent = stack.last().map(|(_, idx)| *idx).unwrap_or(0);

        let id = unique_id(&builder, parent, &section_number, &title);
        debug!(line = line_no + 1, level, id = %id, "heading");
        current = builder.add_child(parent, id, section_number, title);
        stack.push((level, current));
        heading_count += 1;
    }
    flush_content(&mut builder, current, &mut content_lines);

    let index = builder.finish(content_hash(markdown))?;
    info!(
        document = document_name,
        document_type = %document_type,
        headings = heading_count,
        nodes = index.node_count(),
        total_tokens = index.total_tokens(),
        "index built"
    );
    Ok(index)
}

/// Split "3.2.1 Title" into ("3.2.1", "Title"). Headings without a leading enumeration
/// keep their full text as title and an empty section number.
fn split_section_number(text: &str) -> (String, String) {
    match SECTION_NUMBER_RE.captures(text) {
        Some(caps) => {
            let number = caps[1].to_string();
            let title = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            (number, title)
        }
        None => (String::new(), text.to_string()),
    }
}

/// Store the accumulated lines as the node's content, trimming surrounding blank lines.
fn flush_content(builder: &mut TreeBuilder, node: NodeIdx, lines: &mut Vec<&str>) {
    if lines.is_empty() {
        return;
    }
    let content = lines.join("\n").trim().to_string();
    lines.clear();
    let tokens = count_tokens(&content);
    builder.set_content(node, content, tokens);
}

/// Lower-case slug keeping letters, digits and dots; every other run becomes one dash.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() || ch == '.' {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
        if slug.chars().count() >= MAX_SLUG_LEN {
            break;
        }
    }
    let slug = slug.trim_matches(|c| c == '-' || c == '.').to_string();
    if slug.is_empty() {
        "section".to_string()
    } else {
        slug
    }
}

/// Own slug first ("3.4", "charizard-ex"); on collision qualify it with the parent's id
/// ("fire-type/charizard-ex"); if that is taken too, add a numeric suffix.
fn unique_id(builder: &TreeBuilder, parent: NodeIdx, section_number: &str, title: &str) -> String {
    let base = if section_number.is_empty() {
        slugify(title)
    } else {
        slugify(section_number)
    };
    if !builder.contains_id(&base) {
        return base;
    }

    let qualified = match builder.node(parent) {
        Some(p) if p.parent.is_some() => format!("{}/{base}", p.id),
        _ => base.clone(),
    };
    if !builder.contains_id(&qualified) {
        return qualified;
    }

    let mut counter = 2;
    loop {
        let candidate = format!("{qualified}-{counter}");
        if !builder.contains_id(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULEBOOK: &str = "\
Intro text before any heading.

# 1 Overview

The game is played by two players.

## 1.1 Winning the Game

Take all your Prize cards.

Or knock out every Pokemon.

# 3 Setup

## 3.4 Prize Cards

Each player sets aside 6 Prize cards.

### 3.4.a Sudden Death

Play with 1 Prize card.
";

    #[test]
    fn builds_nested_hierarchy() {
        let index = build("rulebook", DocumentType::Rulebook, RULEBOOK).unwrap();
        let root = index.root();
        assert_eq!(root.id, "root");
        assert_eq!(root.content, "Intro text before any heading.");
        let top: Vec<&str> = root
            .children
            .iter()
            .map(|&i| index.nodes()[i].id.as_str())
            .collect();
        assert_eq!(top, vec!["1", "3"]);

        let prize = index.find("3.4").unwrap();
        let node = &index.nodes()[prize];
        assert_eq!(node.metadata.section_number, "3.4");
        assert_eq!(node.metadata.title, "Prize Cards");
        assert_eq!(node.content, "Each player sets aside 6 Prize cards.");
        assert_eq!(index.nodes()[node.children[0]].id, "3.4.a");
    }

    #[test]
    fn content_excludes_descendants_and_keeps_paragraph_breaks() {
        let index = build("rulebook", DocumentType::Rulebook, RULEBOOK).unwrap();
        let overview = &index.nodes()[index.find("1").unwrap()];
        assert_eq!(overview.content, "The game is played by two players.");
        let winning = &index.nodes()[index.find("1.1").unwrap()];
        assert_eq!(winning.content, "Take all your Prize cards.\n\nOr knock out every Pokemon.");
    }

    #[test]
    fn identical_input_builds_identical_tree() {
        let a = build("rulebook", DocumentType::Rulebook, RULEBOOK).unwrap();
        let b = build("rulebook", DocumentType::Rulebook, RULEBOOK).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
        assert_eq!(a.source_hash(), content_hash(RULEBOOK));
    }

    #[test]
    fn different_input_changes_hash() {
        let a = build("rulebook", DocumentType::Rulebook, RULEBOOK).unwrap();
        let b = build("rulebook", DocumentType::Rulebook, &format!("{RULEBOOK}\nmore")).unwrap();
        assert_ne!(a.source_hash(), b.source_hash());
    }

    #[test]
    fn total_tokens_equals_sum_of_nodes() {
        let index = build("rulebook", DocumentType::Rulebook, RULEBOOK).unwrap();
        let summed: usize = index.nodes().iter().map(|n| n.token_count).sum();
        assert_eq!(index.total_tokens(), summed);
        assert!(index
            .nodes()
            .iter()
            .filter(|n| !n.content.is_empty())
            .all(|n| n.token_count > 0));
    }

    #[test]
    fn duplicate_titles_get_unique_ids() {
        let md = "\
# Pokemon Card Database
## Fire Type
### Charizard ex
Stage 2
## Dragon Type
### Charizard ex
Different print
### Charizard ex
Third print
";
        let index = build("card_db_pokemon", DocumentType::CardDatabase, md).unwrap();
        let ids: Vec<&str> = index.nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "root",
                "pokemon-card-database",
                "fire-type",
                "charizard-ex",
                "dragon-type",
                "dragon-type/charizard-ex",
                "dragon-type/charizard-ex-2",
            ]
        );
    }

    #[test]
    fn heading_named_root_does_not_collide() {
        let index = build("doc", DocumentType::Rulebook, "# Root\ntext").unwrap();
        assert_eq!(index.nodes()[1].id, "root-2");
    }

    #[test]
    fn skipped_levels_attach_to_nearest_open_heading() {
        let md = "# A\n### Deep\ntext\n## B\ntext";
        let index = build("doc", DocumentType::Rulebook, md).unwrap();
        let a = index.find("a").unwrap();
        let children: Vec<&str> = index.nodes()[a]
            .children
            .iter()
            .map(|&i| index.nodes()[i].id.as_str())
            .collect();
        assert_eq!(children, vec!["deep", "b"]);
    }

    #[test]
    fn fenced_code_is_not_a_heading() {
        let md = "# Deck\n```\n# not a heading\n```\n";
        let index = build("doc", DocumentType::Rulebook, md).unwrap();
        assert_eq!(index.node_count(), 2);
        assert!(index.nodes()[1].content.contains("# not a heading"));
    }

    #[test]
    fn flat_list_is_a_single_node_tree() {
        let md = "Charizard ex (OBF)\nPikachu (SVI)\n";
        let index = build("legal_card_list", DocumentType::LegalCardList, md).unwrap();
        assert_eq!(index.node_count(), 1);
        assert!(index.root().content.contains("Pikachu"));
    }

    #[test]
    fn empty_document_is_a_parse_error() {
        let err = build("doc", DocumentType::Rulebook, "  \n\n").unwrap_err();
        assert!(matches!(err, AppError::Parse { line: 0, .. }));
    }

    #[test]
    fn empty_heading_reports_line() {
        let err = build("doc", DocumentType::Rulebook, "# Fine\ntext\n##\n").unwrap_err();
        assert!(matches!(err, AppError::Parse { line: 3, .. }), "{err}");
    }

    #[test]
    fn section_number_extraction() {
        assert_eq!(split_section_number("3.2.1 Title"), ("3.2.1".into(), "Title".into()));
        assert_eq!(split_section_number("3.2. Title"), ("3.2".into(), "Title".into()));
        assert_eq!(split_section_number("4.1.b.2 Sub"), ("4.1.b.2".into(), "Sub".into()));
        assert_eq!(split_section_number("7"), ("7".into(), String::new()));
        assert_eq!(split_section_number("2024 Changes"), (String::new(), "2024 Changes".into()));
        assert_eq!(split_section_number("1st Turn"), (String::new(), "1st Turn".into()));
    }

    #[test]
    fn slugify_examples() {
        assert_eq!(slugify("Charizard ex"), "charizard-ex");
        assert_eq!(slugify("Professor's Research"), "professor-s-research");
        assert_eq!(slugify("  3.4  "), "3.4");
        assert_eq!(slugify("???"), "section");
    }

    #[test]
    fn token_count_basics() {
        assert_eq!(count_tokens(""), 0);
        assert!(count_tokens("Each player sets aside 6 Prize cards.") >= 7);
        assert!(count_tokens("Pokémon") > 0);
    }
}
