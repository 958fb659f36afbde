//! Post-processing hooks.
//!
//! A hook can rewrite or veto a draft message just before it is sent
//! (or attached to a digest). Hooks are registered under a name and
//! resolved once at startup; a config referencing an unknown name is a
//! configuration error, not a runtime surprise.

use crate::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("unknown hook '{0}'")]
    Unknown(String),
}

/// A named message transformer.
///
/// Returning `None` vetoes the message: for per-entry hooks the entry is
/// skipped without recording state, for digest hooks the whole batch is
/// discarded.
pub trait Hook: Send + Sync {
    fn process(&self, feed_name: &str, message: Message) -> Option<Message>;
}

impl std::fmt::Debug for dyn Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Hook")
    }
}

/// Plain functions work as hooks.
impl<F> Hook for F
where
    F: Fn(&str, Message) -> Option<Message> + Send + Sync,
{
    fn process(&self, feed_name: &str, message: Message) -> Option<Message> {
        self(feed_name, message)
    }
}

/// Registry of available hooks, keyed by config-visible name.
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn Hook>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Registry pre-populated with the built-in hooks.
    pub fn new() -> Self {
        let mut registry = Self {
            hooks: HashMap::new(),
        };
        registry.register("downcase", Arc::new(downcase_subject));
        registry.register("strip_tracking", Arc::new(strip_tracking));
        registry
    }

    pub fn register(&mut self, name: &str, hook: Arc<dyn Hook>) {
        self.hooks.insert(name.to_string(), hook);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Hook>, HookError> {
        self.hooks
            .get(name)
            .cloned()
            .ok_or_else(|| HookError::Unknown(name.to_string()))
    }
}

/// Built-in hook: lowercase the Subject header.
fn downcase_subject(_feed: &str, mut message: Message) -> Option<Message> {
    if let Some(subject) = message.header("Subject") {
        let lowered = subject.to_lowercase();
        message.set_header("Subject", lowered);
    }
    Some(message)
}

/// Built-in hook: rewrite links in the body to drop tracking query
/// parameters (`utm_*` and friends). Feeds routinely wrap entry links
/// in analytics decoration; stripping it gives readers durable,
/// private URLs.
fn strip_tracking(_feed: &str, mut message: Message) -> Option<Message> {
    let body = rewrite_links(message.body(), |link| {
        let mut parsed = url::Url::parse(link).ok()?;
        let total = parsed.query_pairs().count();
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(name, _)| !is_tracking_param(name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        if kept.len() == total {
            return None;
        }
        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(kept)
                .finish();
            parsed.set_query(Some(&query));
        }
        Some(parsed.to_string())
    });
    message.set_body(body);
    Some(message)
}

fn is_tracking_param(name: &str) -> bool {
    name.starts_with("utm_") || matches!(name, "fbclid" | "gclid" | "igshid" | "mc_cid" | "mc_eid")
}

/// Apply `rewrite` to every http(s) URL in `text`, leaving everything
/// else untouched. A `None` from `rewrite` keeps the original link.
fn rewrite_links(text: &str, mut rewrite: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("http") {
        let candidate = &rest[start..];
        if !candidate.starts_with("http://") && !candidate.starts_with("https://") {
            out.push_str(&rest[..start + 4]);
            rest = &rest[start + 4..];
            continue;
        }
        out.push_str(&rest[..start]);
        let end = candidate
            .find(|c: char| {
                c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>' | ')' | ']')
            })
            .unwrap_or(candidate.len());
        let link = &candidate[..end];
        match rewrite(link) {
            Some(replaced) => out.push_str(&replaced),
            None => out.push_str(link),
        }
        rest = &candidate[end..];
    }
    out.push_str(rest);
    out
}
