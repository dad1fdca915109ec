//! Subcommand implementations.

use crate::{CacheAction, Command, FavoritesAction};
use anyhow::{bail, Result};
use falcon_core::{
    CancellationToken, Credentials, DownloadRequest, FalconCore, ItemRef, MergeStrategy, SearchPage,
};
use serde_json::json;
use tracing::{info, warn};

pub async fn run(core: &FalconCore, command: Command) -> Result<()> {
    match command {
        Command::Sites => sites(core),
        Command::Search {
            site,
            tags,
            page,
            all,
        } => search(core, site, tags, page, all).await,
        Command::Tags { site, prefix, limit } => print_json(&core.search_tags(&site, &prefix, limit).await?),
        Command::Download { site, ids } => download(core, &site, ids).await,
        Command::Login {
            site,
            username,
            secret,
            remember,
        } => {
            let credentials = Credentials::new(username, secret).remember(remember);
            let session = core.login(&site, &credentials).await?;
            info!("Logged in to {} until {}", session.site_id, session.expires_at);
            Ok(())
        }
        Command::Logout { site } => {
            if core.logout(&site)? {
                info!("Logged out of {}", site);
            } else {
                info!("No session for {}", site);
            }
            Ok(())
        }
        Command::Favorites { action } => favorites(core, action),
        Command::Cache { action } => cache(core, action),
        Command::History { site, limit, clear } => history(core, site.as_deref(), limit, clear),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn sites(core: &FalconCore) -> Result<()> {
    let sites: Vec<_> = core
        .registry()
        .sites()
        .into_iter()
        .map(|site| {
            json!({
                "id": site.id,
                "name": site.name,
                "base_url": site.base_url,
                "requires_auth": site.requires_auth,
                "capabilities": site.capabilities.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
                "logged_in": core.sessions().active_sites().contains(&site.id),
            })
        })
        .collect();
    print_json(&sites)
}

fn page_summary(page: &SearchPage) -> serde_json::Value {
    json!({
        "site": page.site_id,
        "page": page.page,
        "has_more": page.has_more,
        "total": page.total,
        "items": page.items,
    })
}

async fn search(core: &FalconCore, site: Option<String>, tags: Vec<String>, page: u32, all: bool) -> Result<()> {
    if all {
        // Without a site the first positional is a tag.
        let tags: Vec<String> = site.into_iter().chain(tags).collect();
        let mut pages = Vec::new();
        for outcome in core.search_all(&tags, page).await {
            match outcome.result {
                Ok(page) => pages.push(page_summary(&page)),
                Err(e) => {
                    warn!("{} failed: {}", outcome.site_id, e);
                    pages.push(json!({ "site": outcome.site_id, "error": e.to_string(), "kind": e.kind().as_str() }));
                }
            }
        }
        return print_json(&pages);
    }

    let Some(site) = site else {
        bail!("a site is required unless --all is given");
    };
    let page = core.search(&site, &tags, page).await?;
    print_json(&page_summary(&page))
}

async fn download(core: &FalconCore, site: &str, ids: Vec<String>) -> Result<()> {
    let site_id = core.registry().canonical_id(site)?;
    let mut requests = Vec::with_capacity(ids.len());
    for id in &ids {
        let result = core.lookup(&ItemRef::new(site_id.as_str(), id.as_str())).await?;
        requests.push(DownloadRequest::for_result(&result));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight downloads");
            on_signal.cancel();
        }
    });

    let mut failed = 0usize;
    for (id, outcome) in ids.iter().zip(core.downloads().fetch_all(requests, &cancel).await) {
        match outcome {
            Ok(path) => println!("{}\t{}", id, path.display()),
            Err(e) => {
                failed += 1;
                warn!("{}/{}: {}", site_id, id, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} downloads failed", failed, ids.len());
    }
    Ok(())
}

fn favorites(core: &FalconCore, action: FavoritesAction) -> Result<()> {
    let store = core.favorites();
    match action {
        FavoritesAction::List { collection: None } => print_json(&store.collections()?),
        FavoritesAction::List {
            collection: Some(id),
        } => print_json(&store.collection(&id)?),
        FavoritesAction::Create { name } => {
            println!("{}", store.create_collection(&name)?);
            Ok(())
        }
        FavoritesAction::Rename { collection, name } => Ok(store.rename_collection(&collection, &name)?),
        FavoritesAction::Delete { collection } => Ok(store.delete_collection(&collection)?),
        FavoritesAction::Add { collection, site, id } => {
            let item = ItemRef::new(core.registry().canonical_id(&site)?, id);
            if !store.add_favorite(&collection, &item)? {
                info!("{} is already in {}", item, collection);
            }
            Ok(())
        }
        FavoritesAction::Remove { collection, site, id } => {
            let item = ItemRef::new(core.registry().canonical_id(&site)?, id);
            if !store.remove_favorite(&collection, &item)? {
                info!("{} was not in {}", item, collection);
            }
            Ok(())
        }
        FavoritesAction::Export { path } => {
            let snapshot = store.export_to_file(&path)?;
            info!(
                "Exported {} collections ({} items) to {}",
                snapshot.collections.len(),
                snapshot.item_count(),
                path.display()
            );
            Ok(())
        }
        FavoritesAction::Import { path, strategy } => {
            let strategy: MergeStrategy = strategy.parse()?;
            print_json(&store.import_from_file(&path, strategy)?)
        }
    }
}

fn cache(core: &FalconCore, action: CacheAction) -> Result<()> {
    match action {
        CacheAction::Stats => print_json(&core.cache_stats()),
        CacheAction::Clear { site: None } => {
            core.cache().clear()?;
            info!("Cache cleared");
            Ok(())
        }
        CacheAction::Clear { site: Some(site) } => {
            let site_id = core.registry().canonical_id(&site)?;
            let removed = core.cache().invalidate_site(&site_id)?;
            info!("Removed {} cached entries for {}", removed, site_id);
            Ok(())
        }
    }
}

fn history(core: &FalconCore, site: Option<&str>, limit: usize, clear: bool) -> Result<()> {
    let site_id = site.map(|s| core.registry().canonical_id(s)).transpose()?;
    if clear {
        let removed = core.favorites().clear_search_history(site_id.as_deref())?;
        info!("Removed {} history entries", removed);
        return Ok(());
    }
    print_json(&core.favorites().search_history(site_id.as_deref(), limit)?)
}
