//! Hierarchical subject matching.
//!
//! Subjects are dot-delimited token lists such as `relay.agent.proj1.bot`.
//! Patterns may use two wildcards:
//! - `*` matches exactly one token
//! - `>` matches one or more trailing tokens and is only valid as the last token
//!
//! [`SubjectMatcher`] keeps registered patterns in a token trie so a lookup
//! only walks the branches that can match, instead of testing every pattern.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Single-token wildcard.
pub const WILDCARD_ONE: &str = "*";

/// Trailing multi-token wildcard.
pub const WILDCARD_TAIL: &str = ">";

/// Maximum number of tokens in a subject or pattern.
pub const MAX_TOKENS: usize = 16;

/// Maximum subject length in bytes.
pub const MAX_SUBJECT_LEN: usize = 256;

fn validate_tokens(input: &str, kind: &str) -> Result<Vec<String>> {
    if input.is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", kind)));
    }
    if input.len() > MAX_SUBJECT_LEN {
        return Err(Error::Validation(format!(
            "{} '{}' exceeds {} bytes",
            kind, input, MAX_SUBJECT_LEN
        )));
    }

    let tokens: Vec<String> = input.split('.').map(str::to_string).collect();
    if tokens.len() > MAX_TOKENS {
        return Err(Error::Validation(format!(
            "{} '{}' has more than {} tokens",
            kind, input, MAX_TOKENS
        )));
    }

    for token in &tokens {
        if token.is_empty() {
            return Err(Error::Validation(format!(
                "{} '{}' contains an empty token",
                kind, input
            )));
        }
        if token.chars().any(char::is_whitespace) {
            return Err(Error::Validation(format!(
                "{} '{}' contains whitespace",
                kind, input
            )));
        }
    }

    Ok(tokens)
}

/// Validate a concrete subject (no wildcards allowed).
pub fn validate_subject(subject: &str) -> Result<()> {
    let tokens = validate_tokens(subject, "Subject")?;
    if tokens.iter().any(|t| t.contains('*') || t.contains('>')) {
        return Err(Error::Validation(format!(
            "Subject '{}' must not contain wildcards",
            subject
        )));
    }
    Ok(())
}

/// Validate a subscription pattern and return its tokens.
pub fn validate_pattern(pattern: &str) -> Result<Vec<String>> {
    let tokens = validate_tokens(pattern, "Pattern")?;
    let last = tokens.len() - 1;

    for (i, token) in tokens.iter().enumerate() {
        if token == WILDCARD_TAIL {
            if i != last {
                return Err(Error::Validation(format!(
                    "Pattern '{}': '>' is only allowed as the final token",
                    pattern
                )));
            }
            continue;
        }
        if token == WILDCARD_ONE {
            continue;
        }
        if token.contains('*') || token.contains('>') {
            return Err(Error::Validation(format!(
                "Pattern '{}': wildcards must occupy a whole token ('{}')",
                pattern, token
            )));
        }
    }

    Ok(tokens)
}

/// Reference matching rule between a concrete subject and a pattern.
///
/// Returns `false` for malformed input rather than erroring.
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    for (i, p) in pattern_tokens.iter().enumerate() {
        if *p == WILDCARD_TAIL {
            return i == pattern_tokens.len() - 1 && subject_tokens.len() > i;
        }
        match subject_tokens.get(i) {
            Some(s) if *p == WILDCARD_ONE || p == s => {}
            _ => return false,
        }
    }

    subject_tokens.len() == pattern_tokens.len()
}

#[derive(Debug)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    single: Option<Box<Node<T>>>,
    /// Values registered with a trailing `>` at this depth.
    tail: Vec<T>,
    /// Values whose pattern ends exactly at this node.
    values: Vec<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            single: None,
            tail: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl<T> Node<T> {
    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.single.is_none()
            && self.tail.is_empty()
            && self.values.is_empty()
    }
}

/// Token trie mapping subject patterns to values.
#[derive(Debug)]
pub struct SubjectMatcher<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for SubjectMatcher<T> {
    fn default() -> Self {
        Self {
            root: Node::default(),
            len: 0,
        }
    }
}

impl<T: Clone + PartialEq> SubjectMatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered (pattern, value) pairs.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register a value under a pattern. Duplicate pairs are ignored.
    pub fn insert(&mut self, pattern: &str, value: T) -> Result<()> {
        let tokens = validate_pattern(pattern)?;
        let mut node = &mut self.root;

        for token in &tokens {
            if token == WILDCARD_TAIL {
                if !node.tail.contains(&value) {
                    node.tail.push(value);
                    self.len += 1;
                }
                return Ok(());
            }
            node = if token == WILDCARD_ONE {
                node.single.get_or_insert_with(Box::default).as_mut()
            } else {
                node.children.entry(token.clone()).or_default()
            };
        }

        if !node.values.contains(&value) {
            node.values.push(value);
            self.len += 1;
        }
        Ok(())
    }

    /// Remove a (pattern, value) pair. Returns whether anything was removed.
    pub fn remove(&mut self, pattern: &str, value: &T) -> bool {
        let Ok(tokens) = validate_pattern(pattern) else {
            return false;
        };
        let removed = Self::remove_at(&mut self.root, &tokens, value);
        if removed {
            self.len -= 1;
        }
        removed
    }

    fn remove_at(node: &mut Node<T>, tokens: &[String], value: &T) -> bool {
        let Some((token, rest)) = tokens.split_first() else {
            let before = node.values.len();
            node.values.retain(|v| v != value);
            return node.values.len() != before;
        };

        if token == WILDCARD_TAIL {
            let before = node.tail.len();
            node.tail.retain(|v| v != value);
            return node.tail.len() != before;
        }

        if token == WILDCARD_ONE {
            let Some(child) = node.single.as_mut() else {
                return false;
            };
            let removed = Self::remove_at(child, rest, value);
            if child.is_empty() {
                node.single = None;
            }
            return removed;
        }

        let Some(child) = node.children.get_mut(token) else {
            return false;
        };
        let removed = Self::remove_at(child, rest, value);
        if child.is_empty() {
            node.children.remove(token);
        }
        removed
    }

    /// All values whose pattern matches the concrete subject.
    pub fn matches(&self, subject: &str) -> Vec<T> {
        let tokens: Vec<&str> = subject.split('.').collect();
        let mut out = Vec::new();
        Self::collect(&self.root, &tokens, &mut out);
        out
    }

    fn collect(node: &Node<T>, tokens: &[&str], out: &mut Vec<T>) {
        let Some((token, rest)) = tokens.split_first() else {
            push_unique(out, &node.values);
            return;
        };

        // `>` needs at least one remaining token, which `token` guarantees.
        push_unique(out, &node.tail);

        if let Some(child) = node.children.get(*token) {
            Self::collect(child, rest, out);
        }
        if let Some(child) = node.single.as_deref() {
            Self::collect(child, rest, out);
        }
    }
}

fn push_unique<T: Clone + PartialEq>(out: &mut Vec<T>, values: &[T]) {
    for v in values {
        if !out.contains(v) {
            out.push(v.clone());
        }
    }
}
