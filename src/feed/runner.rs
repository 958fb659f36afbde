//! The per-feed pipeline: fetch, resolve identities, decide what each
//! entry is (new, repeat, or changed), build and deliver messages,
//! record state.
//!
//! State updates are ordered so a crash or per-feed failure is at worst
//! a duplicate, never a silent drop: a guid is recorded only after its
//! message was delivered (or skipped on purpose), and the HTTP
//! validators advance only once every entry of the fetch was handled.

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Settings;
use crate::delivery::{Delivery, DeliveryError};
use crate::hook::Hook;
use crate::message::{build_digest, new_message_id, Message};
use crate::store::FeedState;

use super::fetcher::{fetch_feed, FetchError, RawEntry};
use super::identity::{resolve_identity, EntryIdentity};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no 'to' address configured; set one under [defaults] or on the feed")]
    NoToAddress,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Everything a feed run borrows from the surrounding command.
pub struct RunContext<'a> {
    pub client: &'a reqwest::Client,
    pub delivery: &'a dyn Delivery,
    /// Per-entry hook, applied to each draft before send.
    pub post_hook: Option<Arc<dyn Hook>>,
    /// Whole-digest hook, applied to the assembled container.
    pub digest_hook: Option<Arc<dyn Hook>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// When false (dry run), everything happens except delivery, and
    /// stored Message-IDs stay pointing at the last real send.
    pub send: bool,
    /// Prune guids that have fallen out of the feed.
    pub clean: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            send: true,
            clean: false,
        }
    }
}

/// What one feed run did.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Messages handed to the delivery backend (0 on dry runs).
    pub delivered: usize,
    /// Entries processed, including ones a dry run withheld.
    pub processed: usize,
    /// New feed URL to persist, when the server answered 301/308.
    pub url_rewrite: Option<String>,
}

/// What an entry is, relative to remembered state.
enum Disposition {
    New,
    Repeat,
    Changed { in_reply_to: Option<String> },
}

/// Run one feed end to end, mutating `state` as entries are handled.
pub async fn run_feed(
    ctx: &RunContext<'_>,
    name: &str,
    url: &str,
    settings: &Settings,
    state: &mut FeedState,
    options: RunOptions,
) -> Result<RunOutcome, RunError> {
    let to = settings.to.as_deref().ok_or(RunError::NoToAddress)?;

    let fetched = fetch_feed(
        ctx.client,
        url,
        state.etag.as_deref(),
        state.modified.as_deref(),
        settings.feed_timeout,
    )
    .await?;

    let mut outcome = RunOutcome {
        url_rewrite: fetched.permanent_redirect.clone(),
        ..RunOutcome::default()
    };

    if fetched.not_modified() {
        tracing::debug!(feed = %name, "not modified, nothing to do");
        return Ok(outcome);
    }

    let mut live: HashSet<String> = HashSet::new();
    let mut digest_parts: Vec<Message> = Vec::new();
    let mut digest_identities: Vec<EntryIdentity> = Vec::new();

    // Feeds list newest first; deliver oldest first so mailboxes sort
    // naturally and the digest's last part is the newest entry.
    for entry in fetched.entries.iter().rev() {
        let Some(identity) = resolve_identity(entry, settings.trust_guid, settings.trust_link)
        else {
            tracing::warn!(feed = %name, "entry with no title, link, or body, skipping");
            continue;
        };
        live.insert(identity.guid.clone());

        let disposition = match state.seen.get(&identity.guid) {
            None => Disposition::New,
            Some(prev) if prev.hash == identity.hash => Disposition::Repeat,
            Some(_) if !settings.reply_changes => Disposition::Repeat,
            Some(prev) => Disposition::Changed {
                in_reply_to: prev.message_id.clone(),
            },
        };

        let in_reply_to = match disposition {
            Disposition::Repeat => continue,
            Disposition::New => None,
            Disposition::Changed { in_reply_to } => {
                tracing::info!(feed = %name, guid = %identity.guid, "entry changed, sending update");
                in_reply_to
            }
        };

        let message_id = new_message_id();
        let message = build_entry_message(
            name,
            url,
            entry,
            &identity,
            settings,
            to,
            &message_id,
            in_reply_to.as_deref(),
        );

        let message = match &ctx.post_hook {
            Some(hook) => match hook.process(name, message) {
                Some(m) => m,
                None => {
                    // Vetoed entries are not recorded. Validators still
                    // advance, so they resurface only once the feed
                    // itself changes again.
                    tracing::debug!(feed = %name, guid = %identity.guid, "entry vetoed by hook");
                    continue;
                }
            },
            None => message,
        };

        if settings.digest {
            digest_parts.push(message);
            digest_identities.push(identity);
            continue;
        }

        if options.send {
            ctx.delivery.deliver(to, &message).await?;
            outcome.delivered += 1;
        }
        outcome.processed += 1;
        state.record(
            &identity.guid,
            &identity.hash,
            options.send.then(|| message_id.clone()),
        );
    }

    if !digest_parts.is_empty() {
        let mut container = Message::new();
        container.set_header("To", to);
        container.set_header("From", settings.from.clone());
        container.set_header("Subject", format!("digest for {name}"));
        container.set_header("Message-ID", new_message_id());
        container.set_header("User-Agent", user_agent());
        container.set_header("X-Feed-URL", url);
        let digest = build_digest(container, &digest_parts);

        let digest = match &ctx.digest_hook {
            Some(hook) => hook.process(name, digest),
            None => Some(digest),
        };
        match digest {
            None => {
                // A vetoed digest discards the whole batch: no state,
                // no validator update, so next run rebuilds it.
                tracing::debug!(feed = %name, "digest vetoed by hook");
                return Ok(outcome);
            }
            Some(digest) => {
                if options.send {
                    ctx.delivery.deliver(to, &digest).await?;
                    outcome.delivered += 1;
                }
                outcome.processed += digest_identities.len();
                // Digest parts are not individually threaded, so only
                // the hashes are recorded.
                for identity in &digest_identities {
                    state.record(&identity.guid, &identity.hash, None);
                }
            }
        }
    }

    if options.clean && !fetched.entries.is_empty() {
        let live: HashSet<&str> = live.iter().map(String::as_str).collect();
        let pruned = state.prune_stale(&live);
        if pruned > 0 {
            tracing::info!(feed = %name, pruned, "pruned stale entries");
        }
    }

    state.etag = fetched.etag;
    state.modified = fetched.last_modified;
    Ok(outcome)
}

fn user_agent() -> String {
    format!("feedmail/{}", env!("CARGO_PKG_VERSION"))
}

#[allow(clippy::too_many_arguments)]
fn build_entry_message(
    name: &str,
    url: &str,
    entry: &RawEntry,
    identity: &EntryIdentity,
    settings: &Settings,
    to: &str,
    message_id: &str,
    in_reply_to: Option<&str>,
) -> Message {
    let mut message = Message::new();

    let subject = entry
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("(no title)");
    message.set_header("Subject", format!("{name}: {subject}"));

    let from = if settings.force_from {
        settings.from.clone()
    } else {
        entry
            .author
            .as_deref()
            .filter(|a| a.contains('@'))
            .map(str::to_string)
            .unwrap_or_else(|| settings.from.clone())
    };
    message.set_header("From", from);
    message.set_header("To", to);

    let date = if settings.date_header {
        entry.published.unwrap_or_else(chrono::Utc::now)
    } else {
        chrono::Utc::now()
    };
    message.set_header("Date", date.to_rfc2822());

    message.set_header("Message-ID", message_id);
    if let Some(parent) = in_reply_to {
        message.set_header("In-Reply-To", parent);
    }
    message.set_header("User-Agent", user_agent());
    message.set_header("X-Feed-URL", url);
    message.set_header("X-Entry-ID", identity.guid.clone());

    if let Some(bonus) = settings.bonus_header.as_deref() {
        for line in bonus.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.split_once(':') {
                Some((header, value)) if !header.trim().is_empty() => {
                    message.set_header(header.trim(), value.trim());
                }
                _ => {
                    tracing::warn!(feed = %name, line = %line, "malformed bonus_header line, ignoring");
                }
            }
        }
    }

    let mut body = entry
        .body
        .as_deref()
        .or(entry.link.as_deref())
        .or(entry.title.as_deref())
        .unwrap_or_default()
        .trim()
        .to_string();
    if let Some(link) = entry.link.as_deref() {
        body.push_str("\n\nURL: ");
        body.push_str(link);
    }
    message.set_body(body);

    message
}
