use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::error::{SseError, SseResult};
use crate::tree::{Tree, TreeNode};

const ZERO_LENGTH: f64 = 1e-8;

struct RawNode {
    name: Option<String>,
    parent: Option<usize>,
    length: Option<f64>,
    n_children: usize,
}

struct Parser<'a> {
    text: &'a [u8],
    pos: usize,
    nodes: Vec<RawNode>,
}

fn tree_err<T>(msg: impl Into<String>) -> SseResult<T> {
    Err(SseError::Tree(msg.into()))
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn skip_comments(&mut self) -> SseResult<()> {
        self.skip_ws();
        while self.peek() == Some(b'[') {
            match self.text[self.pos..].iter().position(|&c| c == b']') {
                Some(off) => self.pos += off + 1,
                None => return tree_err("unterminated comment in newick string"),
            }
            self.skip_ws();
        }
        Ok(())
    }

    fn token(&mut self) -> String {
        self.skip_ws();
        if self.peek() == Some(b'\'') {
            let start = self.pos + 1;
            let end = self.text[start..]
                .iter()
                .position(|&c| c == b'\'')
                .map(|off| start + off)
                .unwrap_or(self.text.len());
            self.pos = (end + 1).min(self.text.len());
            return String::from_utf8_lossy(&self.text[start..end]).into_owned();
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b',' | b'(' | b')' | b':' | b';' | b'[') || c.is_ascii_whitespace() {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.text[start..self.pos]).into_owned()
    }

    fn subtree(&mut self, parent: Option<usize>) -> SseResult<usize> {
        let id = self.nodes.len();
        self.nodes.push(RawNode {
            name: None,
            parent,
            length: None,
            n_children: 0,
        });
        self.skip_ws();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                self.subtree(Some(id))?;
                self.nodes[id].n_children += 1;
                self.skip_comments()?;
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    other => {
                        return tree_err(format!(
                            "expected ',' or ')' at byte {}, found {:?}",
                            self.pos,
                            other.map(char::from)
                        ));
                    }
                }
            }
        }
        let name = self.token();
        if !name.is_empty() {
            self.nodes[id].name = Some(name);
        }
        self.skip_comments()?;
        if self.peek() == Some(b':') {
            self.pos += 1;
            let raw = self.token();
            let length = raw
                .parse::<f64>()
                .map_err(|_| SseError::Tree(format!("invalid branch length '{raw}'")))?;
            self.nodes[id].length = Some(length);
            self.skip_comments()?;
        }
        Ok(id)
    }
}

/// Parses a rooted binary newick tree, converting branch lengths into ages.
///
/// Tips on zero-length branches hanging off a node with another child are
/// read as sampled ancestors; other tips older than the youngest tip are
/// fossils.
pub fn parse_newick(text: &str) -> SseResult<Tree> {
    let mut parser = Parser {
        text: text.trim().as_bytes(),
        pos: 0,
        nodes: Vec::new(),
    };
    parser.subtree(None)?;
    parser.skip_comments()?;
    match parser.peek() {
        Some(b';') | None => {}
        Some(c) => return tree_err(format!("unexpected '{}' after the tree", char::from(c))),
    }

    let raw = parser.nodes;
    let mut depth = vec![0.0; raw.len()];
    for i in 1..raw.len() {
        if let Some(p) = raw[i].parent {
            depth[i] = depth[p] + raw[i].length.unwrap_or(0.0);
        }
    }
    let height = raw
        .iter()
        .enumerate()
        .filter(|(_, n)| n.n_children == 0)
        .map(|(i, _)| depth[i])
        .fold(0.0, f64::max);

    let nodes = raw
        .iter()
        .enumerate()
        .map(|(i, n)| {
            let age = (height - depth[i]).max(0.0);
            let age = if age < ZERO_LENGTH { 0.0 } else { age };
            match (n.n_children, n.parent) {
                (0, Some(p)) => {
                    let name = n.name.clone().unwrap_or_else(|| format!("t{i}"));
                    if n.length.is_some_and(|l| l < ZERO_LENGTH) && raw[p].n_children > 1 {
                        TreeNode::sampled_ancestor(name, age, p)
                    } else if age > 0.0 {
                        TreeNode::fossil(name, age, p)
                    } else {
                        TreeNode::tip(name, age, p)
                    }
                }
                _ => {
                    let mut node = TreeNode::internal(age, n.parent);
                    node.name = n.name.clone();
                    node
                }
            }
        })
        .collect();
    Tree::new(nodes)
}

pub fn read_newick(path: &Path) -> Result<Tree> {
    let content = super::read_to_string(path)?;
    let text = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .with_context(|| format!("no tree found in {path:?}"))?;
    let tree = parse_newick(text).with_context(|| format!("failed to parse tree in {path:?}"))?;
    Ok(tree)
}

pub fn write_newick(path: &Path, newick: &str) -> Result<()> {
    fs::write(path, format!("{newick}\n")).with_context(|| format!("failed to write {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_lengths_become_ages() {
        let tree = parse_newick("((A:1,B:1):1,C:2);").unwrap();
        assert_eq!(tree.num_tips(), 3);
        assert!((tree.root_age() - 2.0).abs() < 1e-12);
        let a = tree.tip_index("A").unwrap();
        assert_eq!(tree.age(a), 0.0);
        assert!((tree.age(tree.parent(a).unwrap()) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn comments_and_quoted_names_are_handled() {
        let tree = parse_newick("('taxon one'[&x=1]:1.5,B[&y={0,0.5}]:1.5)[&root];").unwrap();
        assert!(tree.tip_index("taxon one").is_some());
        assert!((tree.root_age() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn zero_length_tip_is_sampled_ancestor() {
        let tree = parse_newick("((A:0,(B:1,C:1):0.5):1,D:2.5);").unwrap();
        let a = tree.tip_index("A").unwrap();
        assert!(tree.node(a).sampled_ancestor);
        assert!((tree.age(a) - 1.5).abs() < 1e-12);
        assert_eq!(tree.num_sampled_ancestors(), 1);
    }

    #[test]
    fn old_tips_are_fossils() {
        let tree = parse_newick("(A:2,B:1.5);").unwrap();
        let b = tree.tip_index("B").unwrap();
        assert!(tree.node(b).fossil);
        assert!((tree.age(b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn writer_output_reads_back() {
        let tree = parse_newick("((A:1,B:1):1,C:2);").unwrap();
        let again = parse_newick(&tree.to_newick()).unwrap();
        assert_eq!(again.n_nodes(), tree.n_nodes());
        assert!((again.root_age() - tree.root_age()).abs() < 1e-12);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_newick("((A:1,B:1);").is_err());
        assert!(parse_newick("(A:x,B:1);").is_err());
    }
}
