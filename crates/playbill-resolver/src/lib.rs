use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use playbill_core::{WorkId, normalize_text};
use playbill_store::{CatalogStore, StoreError};
use thiserror::Error;

/// One transient miss is tolerated; the second consecutive miss prunes the
/// alias. Changing this threshold changes user-visible resolution behavior
/// and needs product sign-off.
pub const NO_RESPONSE_PRUNE_THRESHOLD: u32 = 2;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
struct ResolverIndex {
    alias_to_work: HashMap<String, WorkId>,
    work_to_names: HashMap<WorkId, Vec<String>>,
    name_to_work: HashMap<String, WorkId>,
    no_response: HashMap<(String, String), u32>,
}

/// Maps free-text show titles and aliases to canonical works and the ordered
/// search names the external source actually answers to. Lookups are served
/// from an in-memory index; mutations write through to the catalog store.
pub struct AliasResolver {
    store: Arc<Mutex<CatalogStore>>,
    index: Mutex<ResolverIndex>,
}

impl AliasResolver {
    pub fn load(store: Arc<Mutex<CatalogStore>>) -> Result<Self, ResolverError> {
        let mut index = ResolverIndex::default();
        {
            let guard = lock_unpoisoned(&store);
            for alias in guard.list_aliases()? {
                index.alias_to_work.insert(alias.alias_norm, alias.work_id);
            }
            for (work_id, name) in guard.list_search_names()? {
                index.work_to_names.entry(work_id).or_default().push(name.clone());
                index.name_to_work.insert(name, work_id);
            }
        }

        Ok(Self {
            store,
            index: Mutex::new(index),
        })
    }

    /// Ordered search names for a work or free-text title. Priority: known
    /// work id, then the title as an alias, then the title as a search name,
    /// then the raw title itself as a best-effort single-element list.
    /// Never fails; unknown inputs fall through to the next tier.
    pub fn resolve_ordered_names(
        &self,
        title: Option<&str>,
        work_id: Option<WorkId>,
    ) -> Vec<String> {
        let index = lock_index(&self.index);

        if let Some(work_id) = work_id
            && let Some(names) = index.work_to_names.get(&work_id)
            && !names.is_empty()
        {
            return names.clone();
        }

        if let Some(title) = title {
            let trimmed = title.trim();

            if let Some(work_id) = index.alias_to_work.get(&normalize_text(trimmed))
                && let Some(names) = index.work_to_names.get(work_id)
                && !names.is_empty()
            {
                return names.clone();
            }

            if let Some(work_id) = index.name_to_work.get(trimmed)
                && let Some(names) = index.work_to_names.get(work_id)
                && !names.is_empty()
            {
                return names.clone();
            }

            return vec![trimmed.to_owned()];
        }

        Vec::new()
    }

    /// Work lookup for a free-text title: alias first, then search name.
    pub fn resolve_work(&self, title: &str) -> Option<WorkId> {
        let index = lock_index(&self.index);
        let trimmed = title.trim();
        index
            .alias_to_work
            .get(&normalize_text(trimmed))
            .or_else(|| index.name_to_work.get(trimmed))
            .copied()
    }

    /// Idempotent alias upsert. The alias is normalized before storage; a
    /// normalized alias resolves to at most one work (last write wins).
    pub fn add_alias(&self, work_id: WorkId, alias: &str) -> Result<(), ResolverError> {
        self.add_alias_with_source(work_id, alias, "manual")
    }

    /// Same as `add_alias` but with an explicit origin tag ("manual",
    /// "official" or "scraped").
    pub fn add_alias_with_source(
        &self,
        work_id: WorkId,
        alias: &str,
        source: &str,
    ) -> Result<(), ResolverError> {
        let alias_norm = normalize_text(alias);
        if alias_norm.is_empty() {
            return Ok(());
        }

        lock_unpoisoned(&self.store).upsert_alias(work_id, alias, source, 0)?;
        lock_index(&self.index)
            .alias_to_work
            .insert(alias_norm, work_id);
        Ok(())
    }

    /// Idempotent search-name upsert; insertion order is resolution priority.
    pub fn add_search_name(&self, work_id: WorkId, name: &str) -> Result<(), ResolverError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(());
        }

        lock_unpoisoned(&self.store).add_search_name(work_id, name)?;

        let mut index = lock_index(&self.index);
        let names = index.work_to_names.entry(work_id).or_default();
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_owned());
        }
        index.name_to_work.insert(name.to_owned(), work_id);
        Ok(())
    }

    pub fn remove_search_name(&self, work_id: WorkId, name: &str) -> Result<bool, ResolverError> {
        let name = name.trim();
        let removed = lock_unpoisoned(&self.store).remove_search_name(work_id, name)?;

        let mut index = lock_index(&self.index);
        if let Some(names) = index.work_to_names.get_mut(&work_id) {
            names.retain(|existing| existing != name);
            if names.is_empty() {
                index.work_to_names.remove(&work_id);
            }
        }
        index.name_to_work.remove(name);
        Ok(removed)
    }

    /// Record the outcome of querying the external source with a
    /// (alias, search name) pair. A success resets the miss counter; the
    /// second consecutive miss deletes the alias and all of its counters, so
    /// names the source no longer recognizes prune themselves.
    pub fn record_response(
        &self,
        alias: &str,
        search_name: &str,
        found: bool,
    ) -> Result<(), ResolverError> {
        let alias_norm = normalize_text(alias);
        let key = (alias_norm.clone(), search_name.trim().to_owned());
        let now = Utc::now().timestamp();

        let count = {
            let mut index = lock_index(&self.index);
            if found {
                index.no_response.insert(key, 0);
                0
            } else {
                let count = index.no_response.entry(key).or_insert(0);
                *count += 1;
                *count
            }
        };

        if count >= NO_RESPONSE_PRUNE_THRESHOLD {
            self.delete_alias(&alias_norm)?;
            return Ok(());
        }

        lock_unpoisoned(&self.store).set_alias_no_response(&alias_norm, i64::from(count), now)?;
        Ok(())
    }

    fn delete_alias(&self, alias_norm: &str) -> Result<(), ResolverError> {
        let deleted = lock_unpoisoned(&self.store).delete_alias(alias_norm)?;
        if deleted {
            tracing::info!(alias = %alias_norm, "pruned unresponsive alias");
        }

        let mut index = lock_index(&self.index);
        index.alias_to_work.remove(alias_norm);
        index
            .no_response
            .retain(|(alias, _), _| alias != alias_norm);
        Ok(())
    }
}

// Resolver state stays usable even if a writer panicked mid-update.
fn lock_unpoisoned(store: &Mutex<CatalogStore>) -> MutexGuard<'_, CatalogStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_index(index: &Mutex<ResolverIndex>) -> MutexGuard<'_, ResolverIndex> {
    index.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn resolver_with_store() -> (tempfile::TempDir, AliasResolver, Arc<Mutex<CatalogStore>>) {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(Mutex::new(
            CatalogStore::open(temp.path()).expect("open store"),
        ));
        let resolver = AliasResolver::load(store.clone()).expect("load resolver");
        (temp, resolver, store)
    }

    fn work_id(store: &Arc<Mutex<CatalogStore>>, name: &str) -> WorkId {
        store
            .lock()
            .expect("store lock")
            .upsert_work(name, None)
            .expect("work")
            .id
    }

    #[test]
    fn search_names_resolve_in_insertion_order() {
        let (_temp, resolver, store) = resolver_with_store();
        let w1 = work_id(&store, "W1");

        resolver.add_search_name(w1, "Foo").expect("add foo");
        resolver.add_search_name(w1, "Bar").expect("add bar");

        assert_eq!(
            resolver.resolve_ordered_names(None, Some(w1)),
            vec!["Foo".to_owned(), "Bar".to_owned()]
        );
    }

    #[test]
    fn title_resolves_through_alias_then_search_name_tiers() {
        let (_temp, resolver, store) = resolver_with_store();
        let w1 = work_id(&store, "海雾");

        resolver.add_search_name(w1, "海雾").expect("search name");
        resolver.add_alias(w1, "《雾剧》").expect("alias");

        // Tier 2: alias lookup is normalization-insensitive.
        assert_eq!(
            resolver.resolve_ordered_names(Some("雾剧"), None),
            vec!["海雾".to_owned()]
        );
        // Tier 3: the title is itself a search name.
        assert_eq!(
            resolver.resolve_ordered_names(Some("海雾"), None),
            vec!["海雾".to_owned()]
        );
        // Tier 4: unknown titles fall back to the raw text.
        assert_eq!(
            resolver.resolve_ordered_names(Some(" Unknown Show "), None),
            vec!["Unknown Show".to_owned()]
        );
        assert!(resolver.resolve_ordered_names(None, None).is_empty());
    }

    #[test]
    fn work_id_takes_priority_over_title() {
        let (_temp, resolver, store) = resolver_with_store();
        let w1 = work_id(&store, "W1");
        let w2 = work_id(&store, "W2");

        resolver.add_search_name(w1, "First").expect("name w1");
        resolver.add_search_name(w2, "Second").expect("name w2");
        resolver.add_alias(w2, "other").expect("alias w2");

        assert_eq!(
            resolver.resolve_ordered_names(Some("other"), Some(w1)),
            vec!["First".to_owned()]
        );
    }

    #[test]
    fn two_misses_prune_the_alias() {
        let (_temp, resolver, store) = resolver_with_store();
        let w1 = work_id(&store, "W1");

        resolver.add_search_name(w1, "Foo").expect("search name");
        resolver.add_alias(w1, "NewAlias").expect("alias");

        resolver
            .record_response("NewAlias", "Foo", false)
            .expect("first miss");
        assert_eq!(
            resolver.resolve_ordered_names(Some("NewAlias"), None),
            vec!["Foo".to_owned()]
        );

        resolver
            .record_response("NewAlias", "Foo", false)
            .expect("second miss");

        // The alias is gone from the index, the store, and the counters; the
        // lookup degrades to the raw-title fallback.
        assert_eq!(
            resolver.resolve_ordered_names(Some("NewAlias"), None),
            vec!["NewAlias".to_owned()]
        );
        assert!(
            store
                .lock()
                .expect("store lock")
                .list_aliases()
                .expect("list")
                .is_empty()
        );
    }

    #[test]
    fn success_resets_the_miss_counter() {
        let (_temp, resolver, store) = resolver_with_store();
        let w1 = work_id(&store, "W1");

        resolver.add_search_name(w1, "Foo").expect("search name");
        resolver.add_alias(w1, "NewAlias").expect("alias");

        resolver
            .record_response("NewAlias", "Foo", false)
            .expect("miss");
        resolver
            .record_response("NewAlias", "Foo", true)
            .expect("hit");
        resolver
            .record_response("NewAlias", "Foo", false)
            .expect("miss after reset");

        // One more miss would prune; the reset kept the alias alive.
        assert_eq!(
            resolver.resolve_ordered_names(Some("NewAlias"), None),
            vec!["Foo".to_owned()]
        );
        let aliases = store
            .lock()
            .expect("store lock")
            .list_aliases()
            .expect("list");
        assert_eq!(aliases.len(), 1);
        assert_eq!(aliases[0].no_response_count, 1);
    }

    #[test]
    fn record_response_for_unknown_alias_is_harmless() {
        let (_temp, resolver, _store) = resolver_with_store();
        resolver
            .record_response("ghost", "Foo", false)
            .expect("miss on unknown alias");
        resolver
            .record_response("ghost", "Foo", false)
            .expect("second miss triggers a no-op prune");
    }

    #[test]
    fn resolver_reloads_state_from_the_store() {
        let (_temp, resolver, store) = resolver_with_store();
        let w1 = work_id(&store, "W1");

        resolver.add_search_name(w1, "Foo").expect("search name");
        resolver.add_alias(w1, "alias one").expect("alias");
        drop(resolver);

        let reloaded = AliasResolver::load(store).expect("reload");
        assert_eq!(
            reloaded.resolve_ordered_names(Some("Alias One"), None),
            vec!["Foo".to_owned()]
        );
    }
}
