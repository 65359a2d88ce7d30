//! Emoji registry, prompt context, and output repair.
//!
//! Guild-specific entries override global entries on name collision. The
//! repair pass is idempotent; during streaming a token guard holds back a
//! suspected partial token so one never splits across chunks.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EmojiEntry {
    pub id: u64,
    #[serde(default)]
    pub animated: bool,
    #[serde(default)]
    pub description: String,
}

/// Parsed and retained for later; nothing reads these yet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StickerEntry {
    pub name: String,
    pub id: u64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmojiFile {
    #[serde(default)]
    global: HashMap<String, EmojiEntry>,
    #[serde(default)]
    guilds: HashMap<String, HashMap<String, EmojiEntry>>,
    #[serde(default)]
    stickers: Vec<StickerEntry>,
}

#[derive(Debug)]
pub struct EmojiRegistry {
    global: HashMap<String, EmojiEntry>,
    guilds: HashMap<String, HashMap<String, EmojiEntry>>,
    #[allow(dead_code)]
    stickers: Vec<StickerEntry>,
    token_pattern: Regex,
}

fn token_pattern() -> Regex {
    // Alternation order matters: angle-bracket forms must win over the bare
    // form so a repaired token is never re-matched from the inside.
    Regex::new(r"<(a?):([A-Za-z0-9_]+):(\d*)>|:([A-Za-z0-9_]+):").unwrap()
}

impl Default for EmojiRegistry {
    fn default() -> Self {
        Self {
            global: HashMap::new(),
            guilds: HashMap::new(),
            stickers: Vec::new(),
            token_pattern: token_pattern(),
        }
    }
}

impl EmojiRegistry {
    pub fn new(
        global: HashMap<String, EmojiEntry>,
        guilds: HashMap<String, HashMap<String, EmojiEntry>>,
    ) -> Self {
        Self {
            global,
            guilds,
            stickers: Vec::new(),
            token_pattern: token_pattern(),
        }
    }

    pub fn load_yaml(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: EmojiFile = serde_yaml::from_str(&content)?;
        Ok(Self {
            global: file.global,
            guilds: file.guilds,
            stickers: file.stickers,
            token_pattern: token_pattern(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.guilds.is_empty()
    }

    /// Requesting guild first, then global. Other guilds are never consulted.
    pub fn resolve(&self, name: &str, guild: Option<&str>) -> Option<&EmojiEntry> {
        if let Some(guild_id) = guild {
            if let Some(entry) = self.guilds.get(guild_id).and_then(|m| m.get(name)) {
                return Some(entry);
            }
        }
        self.global.get(name)
    }

    pub fn token(name: &str, entry: &EmojiEntry) -> String {
        if entry.animated {
            format!("<a:{name}:{}>", entry.id)
        } else {
            format!("<:{name}:{}>", entry.id)
        }
    }

    /// Prompt block listing the usable tokens for this channel's guild.
    pub fn prompt_context(&self, guild: Option<&str>) -> String {
        let mut merged: Vec<(&String, &EmojiEntry)> = self.global.iter().collect();
        if let Some(guild_id) = guild {
            if let Some(entries) = self.guilds.get(guild_id) {
                merged.retain(|(name, _)| !entries.contains_key(*name));
                merged.extend(entries.iter());
            }
        }
        if merged.is_empty() {
            return String::new();
        }
        merged.sort_by(|a, b| a.0.cmp(b.0));

        let mut lines = vec!["可用的表情符號：".to_string()];
        for (name, entry) in merged {
            let mut line = format!("- {}", Self::token(name, entry));
            if !entry.description.is_empty() {
                line.push_str(&format!(" - {}", entry.description));
            }
            lines.push(line);
        }
        lines.push("請在回應中適當使用這些表情符號，直接使用完整格式即可。".to_string());
        lines.join("\n")
    }

    /// Rewrite malformed emoji tokens into valid ones. Unknown names are
    /// left untouched. Applying the pass twice changes nothing.
    pub fn repair(&self, text: &str, guild: Option<&str>) -> String {
        self.token_pattern
            .replace_all(text, |caps: &regex::Captures| {
                if let Some(name) = caps.get(4) {
                    // Bare :name:
                    return match self.resolve(name.as_str(), guild) {
                        Some(entry) => Self::token(name.as_str(), entry),
                        None => caps[0].to_string(),
                    };
                }
                let animated = &caps[1] == "a";
                let name = &caps[2];
                if !caps[3].is_empty() {
                    // Already carries an id.
                    return caps[0].to_string();
                }
                match self.resolve(name, guild) {
                    Some(entry) if animated => format!("<a:{name}:{}>", entry.id),
                    Some(entry) => format!("<:{name}:{}>", entry.id),
                    None => caps[0].to_string(),
                }
            })
            .to_string()
    }
}

/// Streaming guard: releases text only up to the last point that cannot be
/// inside an emoji token. A trailing suspected partial token is buffered
/// until whitespace or a closing `>` arrives.
#[derive(Debug, Default)]
pub struct StreamTokenGuard {
    pending: String,
}

impl StreamTokenGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta; returns text that is safe to flush now.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.pending.push_str(delta);
        let hold_from = partial_token_start(&self.pending);
        let safe: String = match hold_from {
            Some(0) => return None,
            Some(idx) => {
                let safe = self.pending[..idx].to_string();
                self.pending = self.pending[idx..].to_string();
                safe
            }
            None => std::mem::take(&mut self.pending),
        };
        if safe.is_empty() {
            None
        } else {
            Some(safe)
        }
    }

    /// End of stream: whatever is still buffered goes out as-is.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Byte offset where a trailing partial token starts, if one is suspected.
/// Complete tokens are consumed whole so their inner colons are never
/// mistaken for a new token start.
fn partial_token_start(text: &str) -> Option<usize> {
    // Tokens contain no whitespace, so only the tail after the last
    // whitespace can hold a partial one.
    let tail_start = text
        .rfind(|c: char| c.is_whitespace())
        .map(|idx| idx + text[idx..].chars().next().map_or(1, |c| c.len_utf8()))
        .unwrap_or(0);
    let tail = &text[tail_start..];

    let mut idx = 0;
    while idx < tail.len() {
        let ch = tail[idx..].chars().next().unwrap_or(' ');
        if ch == '<' || ch == ':' {
            let candidate = &tail[idx..];
            if let Some(len) = complete_token_len(candidate) {
                idx += len;
                continue;
            }
            if is_partial_token(candidate) {
                return Some(tail_start + idx);
            }
        }
        idx += ch.len_utf8();
    }
    None
}

/// Length of a complete token at the start of `s`, if any:
/// `<a?:name:digits*>` or bare `:name:`.
fn complete_token_len(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let is_name_byte = |b: u8| b.is_ascii_alphanumeric() || b == b'_';

    if bytes.first() == Some(&b'<') {
        let mut i = 1;
        if bytes.get(i) == Some(&b'a') {
            i += 1;
        }
        if bytes.get(i) != Some(&b':') {
            return None;
        }
        i += 1;
        let name_start = i;
        while i < bytes.len() && is_name_byte(bytes[i]) {
            i += 1;
        }
        if i == name_start || bytes.get(i) != Some(&b':') {
            return None;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if bytes.get(i) == Some(&b'>') {
            Some(i + 1)
        } else {
            None
        }
    } else if bytes.first() == Some(&b':') {
        let mut i = 1;
        let name_start = i;
        while i < bytes.len() && is_name_byte(bytes[i]) {
            i += 1;
        }
        if i > name_start && bytes.get(i) == Some(&b':') {
            Some(i + 1)
        } else {
            None
        }
    } else {
        None
    }
}

/// True when `candidate` is a proper prefix of an emoji token, i.e. it may
/// still complete, so it must not be flushed yet.
fn is_partial_token(candidate: &str) -> bool {
    if candidate.ends_with('>') {
        return false;
    }
    if let Some(rest) = candidate.strip_prefix('<') {
        let rest = rest.strip_prefix('a').unwrap_or(rest);
        let Some(rest) = rest.strip_prefix(':') else {
            // "<" or "<a" alone: could still become a token.
            return rest.is_empty();
        };
        let mut sections = rest.splitn(2, ':');
        let name = sections.next().unwrap_or("");
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
        match sections.next() {
            None => true,
            Some(id) => id.chars().all(|c| c.is_ascii_digit()),
        }
    } else if let Some(rest) = candidate.strip_prefix(':') {
        // Bare ":name" with no closing colon yet.
        let mut sections = rest.splitn(2, ':');
        let name = sections.next().unwrap_or("");
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
        // ":name:" is complete; only hold while the second colon is missing.
        sections.next().is_none()
    } else {
        false
    }
}
