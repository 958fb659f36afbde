//! Subcommand implementations.
//!
//! Everything here is a thin orchestration layer: load config and
//! store, call into the engine, save. The `run` command holds the
//! exclusive store lock for its whole duration; read-only commands
//! (`list`) run unlocked.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, FeedConfig};
use crate::delivery;
use crate::feed::{build_client, run_feed, FetchThrottle, RunContext, RunOptions};
use crate::hook::{Hook, HookRegistry};
use crate::store::{FeedStore, StoreLock};

/// Where this invocation's config file and datafile live.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config: PathBuf,
    pub data: PathBuf,
}

/// `add NAME URL [EMAIL]`: append a subscription, creating the config
/// file if this is the first one.
pub fn add(paths: &Paths, name: &str, url: &str, email: Option<&str>) -> Result<()> {
    let mut config = Config::load_or_default(&paths.config)?;
    let mut feed = FeedConfig::new(name, url);
    feed.to = email.map(str::to_string);
    config.add_feed(feed)?;
    config.save(&paths.config)?;
    tracing::info!(feed = %name, url = %url, "added feed");
    println!("added '{name}' ({url})");
    Ok(())
}

/// `list`: print every subscription with its state summary.
pub fn list(paths: &Paths) -> Result<()> {
    let config = Config::load(&paths.config)?;
    let store = FeedStore::load(&paths.data, false)?;

    for (index, feed) in config.feeds.iter().enumerate() {
        let marker = if feed.active { "*" } else { " " };
        let seen = store.get(&feed.name).map(|s| s.seen.len()).unwrap_or(0);
        let to = feed
            .to
            .as_deref()
            .or(config.defaults.to.as_deref())
            .unwrap_or("(no address)");
        println!("{index}: [{marker}] {} -> {to} ({} seen) {}", feed.name, seen, feed.url);
    }
    Ok(())
}

/// `pause` / `unpause`: flip the active flag on the named feeds, or on
/// every feed when none are named.
pub fn set_active(paths: &Paths, names: &[String], active: bool) -> Result<()> {
    let mut config = Config::load(&paths.config)?;
    if names.is_empty() {
        for feed in &mut config.feeds {
            feed.active = active;
        }
    } else {
        for name in names {
            let feed = config
                .feed_mut(name)
                .with_context(|| format!("no feed named '{name}'"))?;
            feed.active = active;
        }
    }
    config.save(&paths.config)?;
    let verb = if active { "unpaused" } else { "paused" };
    tracing::info!(feeds = ?names, "{verb} feeds");
    Ok(())
}

/// `delete NAME...`: drop the config entry and its stored state.
pub fn delete(paths: &Paths, names: &[String]) -> Result<()> {
    let mut config = Config::load(&paths.config)?;
    let _lock = StoreLock::acquire(&FeedStore::lock_path(&paths.data))?;
    let mut store = FeedStore::load(&paths.data, false)?;

    for name in names {
        config.remove_feed(name)?;
        if store.remove(name).is_some() {
            tracing::debug!(feed = %name, "dropped stored state");
        }
        println!("deleted '{name}'");
    }

    config.save(&paths.config)?;
    store.save()?;
    Ok(())
}

/// `reset [NAME...]`: forget dynamic state so the next run re-delivers
/// from scratch. Without names, resets every feed.
pub fn reset(paths: &Paths, names: &[String]) -> Result<()> {
    let config = Config::load(&paths.config)?;
    let _lock = StoreLock::acquire(&FeedStore::lock_path(&paths.data))?;
    let mut store = FeedStore::load(&paths.data, false)?;

    let targets: Vec<String> = if names.is_empty() {
        config.feeds.iter().map(|f| f.name.clone()).collect()
    } else {
        for name in names {
            if config.feed(name).is_none() {
                bail!("no feed named '{name}'");
            }
        }
        names.to_vec()
    };
    for name in &targets {
        store.state_mut(name).reset();
        tracing::info!(feed = %name, "reset feed state");
    }
    store.save()?;
    Ok(())
}

/// `run [-n] [--clean] [NAME...]`: the engine run.
///
/// Per-feed failures are logged and counted but never abort the run;
/// the store is saved even after partial failure so successfully
/// delivered entries are not re-sent next time. A non-empty failure
/// count becomes the process's error.
pub async fn run(paths: &Paths, options: RunOptions, names: &[String]) -> Result<()> {
    let mut config = Config::load(&paths.config)?;
    for name in names {
        if config.feed(name).is_none() {
            bail!("no feed named '{name}'");
        }
    }

    let _lock = StoreLock::acquire(&FeedStore::lock_path(&paths.data))?;
    let mut store = FeedStore::load(&paths.data, false)?;
    store.sync_order(config.feeds.iter().map(|f| f.name.as_str()));

    let registry = HookRegistry::new();
    let default_client = build_client(None)?;
    let mut throttle = FetchThrottle::new();

    let mut config_dirty = false;
    let mut attempted = 0usize;
    let mut failed = 0usize;

    let selected: Vec<FeedConfig> = config
        .feeds
        .iter()
        .filter(|f| names.is_empty() || names.iter().any(|n| n == &f.name))
        .cloned()
        .collect();

    for feed in &selected {
        let name = feed.name.as_str();
        if !feed.active {
            tracing::info!(feed = %name, "paused, skipping");
            continue;
        }
        attempted += 1;

        let result = run_one(
            &config,
            feed,
            &registry,
            &default_client,
            &mut throttle,
            store.state_mut(name),
            options,
        )
        .await;

        match result {
            Ok(Some(moved)) => {
                tracing::warn!(feed = %name, url = %moved, "feed moved, updating config");
                if let Some(feed) = config.feed_mut(name) {
                    feed.url = moved;
                    config_dirty = true;
                }
            }
            Ok(None) => {}
            Err(e) => {
                failed += 1;
                tracing::error!(feed = %name, error = %e, "feed run failed");
            }
        }
    }

    // Partial progress survives a partial failure.
    store.save()?;
    if config_dirty {
        config.save(&paths.config)?;
    }

    if failed > 0 {
        bail!("{failed} of {attempted} feeds failed");
    }
    Ok(())
}

/// Run one feed with its own resolved settings, hooks, and delivery
/// backend. Returns the new URL when the feed moved permanently.
#[allow(clippy::too_many_arguments)]
async fn run_one(
    config: &Config,
    feed: &FeedConfig,
    registry: &HookRegistry,
    default_client: &reqwest::Client,
    throttle: &mut FetchThrottle,
    state: &mut crate::store::FeedState,
    options: RunOptions,
) -> Result<Option<String>> {
    let name = feed.name.as_str();
    let url = feed.url.as_str();
    let settings = config.resolve(feed)?;

    let post_hook: Option<Arc<dyn Hook>> = settings
        .post_process
        .as_deref()
        .map(|n| registry.resolve(n))
        .transpose()?;
    let digest_hook: Option<Arc<dyn Hook>> = settings
        .digest_post_process
        .as_deref()
        .map(|n| registry.resolve(n))
        .transpose()?;

    // A per-feed proxy needs its own client; everything else shares one.
    let proxied;
    let client = match settings.proxy.as_deref() {
        Some(proxy) => {
            proxied = build_client(Some(proxy))?;
            &proxied
        }
        None => default_client,
    };

    let delivery = delivery::from_target(&settings.delivery, &settings.from)?;
    throttle.pace(url, settings.same_server_fetch_interval).await;

    let ctx = RunContext {
        client,
        delivery: delivery.as_ref(),
        post_hook,
        digest_hook,
    };
    let outcome = run_feed(&ctx, name, url, &settings, state, options).await?;
    tracing::info!(
        feed = %name,
        delivered = outcome.delivered,
        processed = outcome.processed,
        "feed run complete"
    );
    Ok(outcome.url_rewrite)
}
