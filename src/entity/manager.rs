//! Entity manager - find, persist and delete entities
//!
//! Owns the identity cache and gates every operation on startup
//! verification: calls made before [`EntityManager::verify_tables`] has
//! finished wait for it, and fail with [`Error::VerificationFailed`] if it
//! did not succeed.

use super::cache::IdentityCache;
use super::instance::Entity;
use super::markers::{SqliteMarkers, VersionMarkers};
use super::migrate::{Migrator, VerifyReport};
use super::model::Model;
use crate::config::EngineConfig;
use crate::lock;
use crate::query::{Filter, FindOptions, QueryBuilder};
use crate::schema::{EntityDescriptor, Registry};
use crate::storage::{Adapter, Database, RowSet, StatsObserver, StatsSnapshot};
use crate::value::{Row, Value};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistAction {
    Inserted,
    Updated,
    /// Nothing was dirty; no statement was issued
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistOutcome {
    pub action: PersistAction,
    pub id: Value,
}

/// Outcome of the latest verification pass.
#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

pub struct EntityManager {
    registry: Arc<Registry>,
    adapter: Adapter,
    cache: Mutex<IdentityCache>,
    markers: Arc<dyn VersionMarkers>,
    ready: watch::Sender<Readiness>,
    default_limit: u32,
}

impl EntityManager {
    pub fn new(db: Database, registry: Registry, config: &EngineConfig) -> Self {
        let (ready, _) = watch::channel(Readiness::Pending);
        Self {
            registry: Arc::new(registry),
            markers: Arc::new(SqliteMarkers::new(db.clone())),
            adapter: Adapter::new(db),
            cache: Mutex::new(IdentityCache::new()),
            ready,
            default_limit: config.default_limit,
        }
    }

    /// Open the configured database and verify the schema against it.
    pub async fn open(config: &EngineConfig, registry: Registry) -> Result<Self> {
        let manager = Self::new(Database::open(config)?, registry, config);
        manager.verify_tables().await?;
        Ok(manager)
    }

    pub fn with_markers(mut self, markers: Arc<dyn VersionMarkers>) -> Self {
        self.markers = markers;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn database(&self) -> &Database {
        self.adapter.database()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.database().stats()
    }

    pub fn observe(&self, observer: Arc<dyn StatsObserver>) {
        self.database().observe(observer);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow() == Readiness::Ready
    }

    /// A fresh, unsaved instance of `entity`.
    pub fn create(&self, entity: &str) -> Result<Entity> {
        self.registry.create(entity)
    }

    /// Create missing tables, run pending migrations and create missing
    /// indexes, then open the gate for all other operations. A failure
    /// releases waiting callers with an error; a later successful call
    /// opens the gate.
    pub async fn verify_tables(&self) -> Result<VerifyReport> {
        let verified = Migrator::new(&self.registry, &self.adapter, self.markers.as_ref())
            .verify()
            .await;
        let report = match verified {
            Ok(report) => report,
            Err(e) => {
                self.ready.send_replace(Readiness::Failed(e.to_string()));
                return Err(e);
            }
        };
        self.ready.send_replace(Readiness::Ready);
        tracing::debug!(
            created = report.created.len(),
            migrated = report.migrated.len(),
            indexes = report.indexes.len(),
            "schema verified"
        );
        Ok(report)
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.ready.subscribe();
        let state = ready
            .wait_for(|state| *state != Readiness::Pending)
            .await
            .map_err(|_| Error::EngineClosed)?
            .clone();
        match state {
            Readiness::Failed(reason) => Err(Error::VerificationFailed(reason)),
            _ => Ok(()),
        }
    }

    fn builder(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(&self.registry).with_default_limit(self.default_limit)
    }

    /// Instances of `entity` matching `filter`, in result order. Rows that
    /// map to an already cached instance update it in place.
    pub async fn find(&self, entity: &str, filter: &Filter, options: &FindOptions) -> Result<Vec<Entity>> {
        let descriptor = self.registry.get(entity)?;
        let query = self.builder().select(entity, filter, options)?;
        self.wait_ready().await?;
        let rows = self.adapter.select(&descriptor, &query).await?;

        let mut seen = HashSet::new();
        let mut found = Vec::with_capacity(rows.len());
        for row in rows {
            let instance = self.merge_row(&descriptor, row);
            if let Some(key) = instance.primary_key().and_then(|pk| pk.cache_key()) {
                if !seen.insert(key) {
                    continue;
                }
            }
            found.push(instance);
        }
        Ok(found)
    }

    pub async fn find_one(&self, entity: &str, filter: &Filter, options: &FindOptions) -> Result<Option<Entity>> {
        let options = FindOptions {
            limit: Some(1),
            ..options.clone()
        };
        Ok(self.find(entity, filter, &options).await?.into_iter().next())
    }

    pub async fn count(&self, entity: &str, filter: &Filter) -> Result<u64> {
        let query = self.builder().count(entity, filter)?;
        self.wait_ready().await?;
        self.adapter.count(&query).await
    }

    /// Fetch-and-populate by primary key; answers from the cache when it can.
    pub async fn get(&self, entity: &str, primary: impl Into<Value>) -> Result<Option<Entity>> {
        let primary = primary.into();
        if let Some(cached) = self.cached(entity, &primary)? {
            return Ok(Some(cached));
        }
        let field = self.registry.primary(entity)?.to_string();
        self.find_one(entity, &Filter::new().eq(field, primary), &FindOptions::new())
            .await
    }

    /// Cache lookup only.
    pub fn cached(&self, entity: &str, primary: &Value) -> Result<Option<Entity>> {
        self.registry.get(entity)?;
        Ok(lock(&self.cache).get(entity, primary))
    }

    /// Rebuild an instance from externally sourced values without a query.
    pub fn from_cache(&self, entity: &str, values: Row) -> Result<Entity> {
        let descriptor = self.registry.get(entity)?;
        let row = crate::storage::adapter::decode_row(&descriptor, values);
        Ok(self.merge_row(&descriptor, row))
    }

    fn merge_row(&self, descriptor: &Arc<EntityDescriptor>, row: Row) -> Entity {
        let primary = row.get(&descriptor.primary).cloned().unwrap_or_default();
        let mut cache = lock(&self.cache);
        if let Some(existing) = cache.get(&descriptor.name, &primary) {
            existing.merge_committed(row);
            return existing;
        }
        let instance = Entity::from_row(descriptor.clone(), row);
        cache.insert(&instance);
        instance
    }

    /// Write pending changes.
    ///
    /// Unsaved instances (or `force_insert`) are INSERTed with their values
    /// plus configured defaults for anything missing; saved instances get an
    /// UPDATE of just the dirty fields.
    pub async fn persist(&self, entity: &Entity, force_insert: bool) -> Result<PersistOutcome> {
        let descriptor = self.registry.get(entity.entity_type())?;
        let primary = entity.primary_key();

        if !entity.is_dirty() && !force_insert {
            return Ok(PersistOutcome {
                action: PersistAction::Unchanged,
                id: primary.unwrap_or_default(),
            });
        }
        self.wait_ready().await?;

        match primary {
            Some(primary) if !force_insert => self.update(&descriptor, entity, primary).await,
            _ => self.insert(&descriptor, entity).await,
        }
    }

    async fn insert(&self, descriptor: &EntityDescriptor, entity: &Entity) -> Result<PersistOutcome> {
        let mut values = entity.insert_values();
        for (field, default) in &descriptor.defaults {
            if values.get(field).is_none_or(Value::is_null) {
                values.insert(field.clone(), default.clone());
            }
        }

        let id = self.adapter.insert(descriptor, &values).await?;
        entity.commit(&values, Some(id.clone()));
        lock(&self.cache).insert(entity);
        tracing::debug!("Inserted {} {}", descriptor.name, id);

        Ok(PersistOutcome {
            action: PersistAction::Inserted,
            id,
        })
    }

    async fn update(&self, descriptor: &EntityDescriptor, entity: &Entity, primary: Value) -> Result<PersistOutcome> {
        let mut changes = entity.dirty_values();
        changes.remove(&descriptor.primary);
        if changes.is_empty() {
            return Ok(PersistOutcome {
                action: PersistAction::Unchanged,
                id: primary,
            });
        }

        self.adapter.update(descriptor, &changes, &primary).await?;
        entity.commit(&changes, None);
        tracing::debug!("Updated {} {} ({} fields)", descriptor.name, primary, changes.len());

        Ok(PersistOutcome {
            action: PersistAction::Updated,
            id: primary,
        })
    }

    /// Delete the row behind `entity`. Unsaved instances are left alone and
    /// `false` is returned. On success the instance leaves the cache and
    /// loses its primary key, so it can be inserted again.
    pub async fn delete(&self, entity: &Entity) -> Result<bool> {
        let Some(primary) = entity.primary_key() else {
            return Ok(false);
        };
        let descriptor = self.registry.get(entity.entity_type())?;
        self.wait_ready().await?;

        self.adapter.delete(&descriptor, &primary).await?;
        lock(&self.cache).remove(&descriptor.name, &primary);
        entity.clear_primary_key();
        tracing::debug!("Deleted {} {}", descriptor.name, primary);
        Ok(true)
    }

    /// Escape hatch for statements the builder cannot express.
    pub async fn execute_raw(&self, sql: &str, params: Vec<Value>) -> Result<RowSet> {
        self.wait_ready().await?;
        self.adapter.raw(sql, params).await
    }

    pub async fn find_models<M: Model>(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<M>> {
        let found = self.find(M::ENTITY, filter, options).await?;
        Ok(found.into_iter().map(M::from_entity).collect())
    }

    pub async fn find_one_model<M: Model>(&self, filter: &Filter, options: &FindOptions) -> Result<Option<M>> {
        Ok(self.find_one(M::ENTITY, filter, options).await?.map(M::from_entity))
    }

    pub fn create_model<M: Model>(&self) -> Result<M> {
        Ok(M::from_entity(self.create(M::ENTITY)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MemoryMarkers;
    use crate::schema::{Direction, Relation};
    use std::time::Duration;

    const CREATE_SERIES: &str =
        "CREATE TABLE Series (ID_Serie INTEGER PRIMARY KEY, name TEXT NOT NULL, genres TEXT, added INTEGER)";
    const CREATE_EPISODES: &str = "CREATE TABLE Episodes (ID_Episode INTEGER PRIMARY KEY, ID_Serie INTEGER, \
         episodename TEXT, watched INTEGER NOT NULL DEFAULT 0)";

    struct Episode(Entity);

    impl Model for Episode {
        const ENTITY: &'static str = "Episode";

        fn descriptor() -> EntityDescriptor {
            EntityDescriptor::new("Episode", "Episodes", "ID_Episode")
                .fields(["ID_Serie", "episodename", "watched"])
                .default_value("watched", 0)
                .create_statement(CREATE_EPISODES)
                .index("ID_Serie")
                .order_by("ID_Episode", Direction::Asc)
        }

        fn from_entity(entity: Entity) -> Self {
            Episode(entity)
        }

        fn entity(&self) -> &Entity {
            &self.0
        }
    }

    impl Episode {
        fn is_watched(&self) -> bool {
            self.0.get("watched").as_bool()
        }

        fn mark_watched(&self) -> Result<bool> {
            self.0.set("watched", 1)
        }
    }

    fn serie_descriptor() -> EntityDescriptor {
        EntityDescriptor::new("Serie", "Series", "ID_Serie")
            .fields(["name", "genres", "added"])
            .serialized(["genres"])
            .default_value("added", 0)
            .relation("Episode", Relation::Foreign)
            .create_statement(CREATE_SERIES)
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(serie_descriptor()).unwrap();
        registry.register_model::<Episode>().unwrap();
        registry
    }

    fn database() -> Database {
        Database::open_in_memory(&EngineConfig::default()).unwrap()
    }

    async fn manager() -> EntityManager {
        let manager = EntityManager::new(database(), registry(), &EngineConfig::default());
        manager.verify_tables().await.unwrap();
        manager
    }

    async fn new_serie(manager: &EntityManager, name: &str) -> Entity {
        let serie = manager.create("Serie").unwrap();
        serie.set("name", name).unwrap();
        manager.persist(&serie, false).await.unwrap();
        serie
    }

    #[tokio::test]
    async fn test_persist_without_changes_issues_nothing() {
        let manager = manager().await;
        let serie = new_serie(&manager, "Lost").await;
        let before = manager.stats();

        let outcome = manager.persist(&serie, false).await.unwrap();
        assert_eq!(outcome.action, PersistAction::Unchanged);
        assert_eq!(manager.stats(), before);
    }

    #[tokio::test]
    async fn test_insert_fills_defaults_and_caches() {
        let manager = manager().await;
        let serie = manager.create("Serie").unwrap();
        serie.set("name", "Lost").unwrap();

        let before = manager.stats();
        let outcome = manager.persist(&serie, false).await.unwrap();
        assert_eq!(manager.stats().queued - before.queued, 1);
        assert_eq!(outcome.action, PersistAction::Inserted);
        assert_eq!(outcome.id, Value::Integer(1));
        assert_eq!(serie.primary_key(), Some(Value::Integer(1)));
        assert!(!serie.is_dirty());
        assert_eq!(serie.get("added"), Value::Integer(0));

        let cached = manager.cached("Serie", &Value::Integer(1)).unwrap().unwrap();
        assert!(cached.same_instance(&serie));
    }

    #[tokio::test]
    async fn test_update_touches_only_dirty_fields() {
        let manager = manager().await;
        let serie = new_serie(&manager, "Lost").await;

        serie.set("added", 5).unwrap();
        serie.set("name", "LOST").unwrap();
        serie.set("name", "Lost").unwrap();
        let before = manager.stats();
        let outcome = manager.persist(&serie, false).await.unwrap();
        assert_eq!(manager.stats().queued - before.queued, 1);
        assert_eq!(outcome.action, PersistAction::Updated);
        assert!(!serie.is_dirty());
        assert_eq!(serie.committed_values()["added"], Value::Integer(5));

        let rows = manager
            .execute_raw("SELECT name, added FROM Series WHERE ID_Serie = ?", vec![outcome.id])
            .await
            .unwrap();
        assert_eq!(rows.rows[0]["name"], Value::from("Lost"));
        assert_eq!(rows.rows[0]["added"], Value::Integer(5));
    }

    #[tokio::test]
    async fn test_find_after_insert_returns_same_values() {
        let manager = manager().await;
        let serie = manager.create("Serie").unwrap();
        serie.set("name", "Lost").unwrap();
        serie.set("genres", Value::Json(serde_json::json!(["drama", "mystery"]))).unwrap();
        let outcome = manager.persist(&serie, false).await.unwrap();

        let found = manager
            .find("Serie", &Filter::new().eq("ID_Serie", outcome.id.clone()), &FindOptions::new())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].same_instance(&serie));
        assert_eq!(found[0].get("genres"), Value::Json(serde_json::json!(["drama", "mystery"])));
        assert_eq!(found[0].values(), serie.values());
    }

    #[tokio::test]
    async fn test_find_updates_cached_instance_in_place() {
        let manager = manager().await;
        let serie = new_serie(&manager, "Lost").await;
        let id = serie.primary_key().unwrap();

        manager
            .execute_raw("UPDATE Series SET name = 'LOST' WHERE ID_Serie = ?", vec![id.clone()])
            .await
            .unwrap();
        let found = manager.get("Serie", id.clone()).await.unwrap().unwrap();
        assert!(found.same_instance(&serie));
        assert_eq!(found.get("name"), Value::from("Lost"));

        let refreshed = manager
            .find_one("Serie", &Filter::new().eq("ID_Serie", id), &FindOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert!(refreshed.same_instance(&serie));
        assert_eq!(serie.get("name"), Value::from("LOST"));
    }

    #[tokio::test]
    async fn test_delete_then_force_insert() {
        let manager = manager().await;
        let serie = new_serie(&manager, "Lost").await;
        let old_id = serie.primary_key().unwrap();

        assert!(manager.delete(&serie).await.unwrap());
        assert!(serie.is_new());
        assert!(manager.cached("Serie", &old_id).unwrap().is_none());
        assert_eq!(manager.count("Serie", &Filter::new()).await.unwrap(), 0);

        let outcome = manager.persist(&serie, true).await.unwrap();
        assert_eq!(outcome.action, PersistAction::Inserted);
        assert_eq!(manager.count("Serie", &Filter::new()).await.unwrap(), 1);
        assert_eq!(serie.get("name"), Value::from("Lost"));
    }

    #[tokio::test]
    async fn test_delete_unsaved_is_noop() {
        let manager = manager().await;
        let serie = manager.create("Serie").unwrap();
        assert!(!manager.delete(&serie).await.unwrap());
    }

    #[tokio::test]
    async fn test_nested_find_across_relation() {
        let manager = manager().await;
        let lost = new_serie(&manager, "Lost").await;
        let other = new_serie(&manager, "Other").await;

        for (serie, name) in [(&lost, "Pilot"), (&lost, "Tabula Rasa"), (&other, "Pilot")] {
            let episode = manager.create("Episode").unwrap();
            episode.set("ID_Serie", serie.primary_key().unwrap()).unwrap();
            episode.set("episodename", name).unwrap();
            manager.persist(&episode, false).await.unwrap();
        }

        let filter = Filter::new().related("Serie", Filter::new().eq("name", "Lost"));
        let episodes: Vec<Episode> = manager.find_models(&filter, &FindOptions::new()).await.unwrap();
        let names: Vec<Value> = episodes.iter().map(|e| e.entity().get("episodename")).collect();
        assert_eq!(names, vec![Value::from("Pilot"), Value::from("Tabula Rasa")]);
        assert_eq!(manager.count("Episode", &filter).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_episode_watched_scenario() {
        let manager = manager().await;
        let episode: Episode = manager.create_model().unwrap();
        episode.entity().set("episodename", "Pilot").unwrap();
        manager.persist(episode.entity(), false).await.unwrap();
        assert!(!episode.is_watched());

        assert!(episode.mark_watched().unwrap());
        let id = episode.entity().primary_key().unwrap();
        let statement = crate::storage::adapter::update_statement(
            &Episode::descriptor(),
            &episode.entity().dirty_values(),
            &id,
        );
        assert_eq!(statement.sql, "UPDATE Episodes SET watched = ? WHERE ID_Episode = ?");
        assert_eq!(statement.params, vec![Value::Integer(1), id.clone()]);

        let outcome = manager.persist(episode.entity(), false).await.unwrap();
        assert_eq!(outcome.action, PersistAction::Updated);
        assert!(episode.is_watched());

        let reloaded: Episode = manager
            .find_one_model(&Filter::new().eq("ID_Episode", id), &FindOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert!(reloaded.is_watched());
    }

    #[tokio::test]
    async fn test_from_cache_reuses_live_instance() {
        let manager = manager().await;
        let serie = new_serie(&manager, "Lost").await;

        let mut values = serie.committed_values();
        values.insert("genres".into(), Value::from(r#"["drama"]"#));
        let rebuilt = manager.from_cache("Serie", values).unwrap();
        assert!(rebuilt.same_instance(&serie));
        assert_eq!(serie.get("genres"), Value::Json(serde_json::json!(["drama"])));

        let mut stranger = Row::new();
        stranger.insert("ID_Serie".into(), Value::Integer(99));
        stranger.insert("name".into(), Value::from("Remote"));
        let remote = manager.from_cache("Serie", stranger).unwrap();
        assert!(manager.cached("Serie", &Value::Integer(99)).unwrap().unwrap().same_instance(&remote));
    }

    #[tokio::test]
    async fn test_operations_wait_for_verification() {
        let manager = Arc::new(EntityManager::new(database(), registry(), &EngineConfig::default()));
        assert!(!manager.is_ready());

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.count("Serie", &Filter::new()).await })
        };
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        manager.verify_tables().await.unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_type_fails_fast() {
        let manager = manager().await;
        let err = manager.find("Movie", &Filter::new(), &FindOptions::new()).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_verify_creates_seeds_and_indexes() {
        let mut registry = registry();
        registry
            .register(
                EntityDescriptor::new("Setting", "Settings", "key")
                    .fields(["value"])
                    .create_statement("CREATE TABLE Settings (key TEXT PRIMARY KEY, value TEXT)")
                    .fixture([("key".to_string(), Value::from("theme")), ("value".to_string(), Value::from("dark"))].into()),
            )
            .unwrap();
        let markers = Arc::new(MemoryMarkers::new());
        let manager = EntityManager::new(database(), registry, &EngineConfig::default()).with_markers(markers.clone());

        let report = manager.verify_tables().await.unwrap();
        assert_eq!(report.created, vec!["Episodes", "Series", "Settings"]);
        assert_eq!(report.indexes, vec!["idx_Episodes_ID_Serie"]);
        assert_eq!(markers.get("database.version.Settings").await.unwrap(), Some(1));

        let theme = manager.get("Setting", "theme").await.unwrap().unwrap();
        assert_eq!(theme.get("value"), Value::from("dark"));

        let again = manager.verify_tables().await.unwrap();
        assert!(again.is_noop());
    }

    fn migrating_registry(statements: &[&str]) -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                serie_descriptor()
                    .fields(["rating"])
                    .migration(2, ["ALTER TABLE Series ADD COLUMN rating INTEGER"])
                    .migration(3, statements.to_vec()),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_migrations_apply_in_order_once() {
        let db = database();
        db.execute(CREATE_SERIES, vec![]).await.unwrap();
        let markers = Arc::new(MemoryMarkers::new());

        let registry = migrating_registry(&["UPDATE Series SET rating = 0", "CREATE TABLE Extra (id INTEGER)"]);
        let manager = EntityManager::new(db.clone(), registry, &EngineConfig::default()).with_markers(markers.clone());
        let report = manager.verify_tables().await.unwrap();
        assert_eq!(report.migrated, vec![("Series".to_string(), 2), ("Series".to_string(), 3)]);
        assert_eq!(markers.get("database.version.Series").await.unwrap(), Some(3));

        let registry = migrating_registry(&["UPDATE Series SET rating = 0", "CREATE TABLE Extra (id INTEGER)"]);
        let manager = EntityManager::new(db, registry, &EngineConfig::default()).with_markers(markers);
        let report = manager.verify_tables().await.unwrap();
        assert!(report.migrated.is_empty());
    }

    #[tokio::test]
    async fn test_failed_migration_leaves_marker() {
        let db = database();
        db.execute(CREATE_SERIES, vec![]).await.unwrap();
        let markers = Arc::new(MemoryMarkers::new());

        let registry = migrating_registry(&["CREATE TABLE Extra (id INTEGER)", "ALTER TABLE Nowhere ADD COLUMN x"]);
        let manager = EntityManager::new(db.clone(), registry, &EngineConfig::default()).with_markers(markers.clone());
        let err = manager.verify_tables().await.unwrap_err();
        assert!(matches!(err, Error::Migration { version: 3, .. }));
        assert!(!manager.is_ready());
        assert_eq!(markers.get("database.version.Series").await.unwrap(), Some(2));

        let extra = db
            .execute("SELECT name FROM sqlite_master WHERE name = 'Extra'", vec![])
            .await
            .unwrap();
        assert!(extra.rows.is_empty());
    }

    #[tokio::test]
    async fn test_missing_create_statement_is_configuration_error() {
        let mut registry = Registry::new();
        registry
            .register(EntityDescriptor::new("Orphan", "Orphans", "id"))
            .unwrap();
        let manager = EntityManager::new(database(), registry, &EngineConfig::default());
        let err = manager.verify_tables().await.unwrap_err();
        assert!(matches!(err, Error::MissingCreateStatement(_)));
    }

    #[tokio::test]
    async fn test_failed_verification_releases_waiters() {
        let mut registry = Registry::new();
        registry
            .register(EntityDescriptor::new("Orphan", "Orphans", "id"))
            .unwrap();
        let manager = Arc::new(EntityManager::new(database(), registry, &EngineConfig::default()));

        let waiting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.count("Orphan", &Filter::new()).await })
        };
        tokio::task::yield_now().await;
        assert!(manager.verify_tables().await.is_err());
        assert!(!manager.is_ready());

        let waited = tokio::time::timeout(Duration::from_secs(2), waiting).await.unwrap().unwrap();
        assert!(matches!(waited, Err(Error::VerificationFailed(_))));

        let later = tokio::time::timeout(Duration::from_secs(2), manager.count("Orphan", &Filter::new()))
            .await
            .unwrap();
        assert!(matches!(later, Err(Error::VerificationFailed(_))));

        let orphan = manager.create("Orphan").unwrap();
        orphan.set("id", 1).unwrap();
        let persisted = tokio::time::timeout(Duration::from_secs(2), manager.persist(&orphan, false))
            .await
            .unwrap();
        assert!(matches!(persisted, Err(Error::VerificationFailed(_))));
    }

    fn settings_descriptor(fixtures: Vec<Row>) -> EntityDescriptor {
        fixtures.into_iter().fold(
            EntityDescriptor::new("Setting", "Settings", "key")
                .fields(["value"])
                .create_statement("CREATE TABLE Settings (key TEXT PRIMARY KEY, value TEXT NOT NULL)"),
            EntityDescriptor::fixture,
        )
    }

    fn setting_row(key: &str, value: Option<&str>) -> Row {
        let mut row = Row::new();
        row.insert("key".into(), Value::from(key));
        if let Some(value) = value {
            row.insert("value".into(), Value::from(value));
        }
        row
    }

    #[tokio::test]
    async fn test_failing_seed_keeps_nothing() {
        let db = database();
        let mut registry = Registry::new();
        registry
            .register(settings_descriptor(vec![setting_row("theme", Some("dark")), setting_row("broken", None)]))
            .unwrap();
        let manager = EntityManager::new(db.clone(), registry, &EngineConfig::default());
        assert!(manager.verify_tables().await.is_err());

        let tables = db
            .execute("SELECT name FROM sqlite_master WHERE name = 'Settings'", vec![])
            .await
            .unwrap();
        assert!(tables.rows.is_empty());
        let markers = SqliteMarkers::new(db.clone());
        assert_eq!(markers.get("database.version.Settings").await.unwrap(), None);

        let mut registry = Registry::new();
        registry
            .register(settings_descriptor(vec![setting_row("theme", Some("dark")), setting_row("lang", Some("en"))]))
            .unwrap();
        let manager = EntityManager::new(db, registry, &EngineConfig::default());
        let report = manager.verify_tables().await.unwrap();
        assert_eq!(report.created, vec!["Settings"]);
        assert_eq!(manager.count("Setting", &Filter::new()).await.unwrap(), 2);
        assert_eq!(markers.get("database.version.Settings").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_text_keys_stay_distinct() {
        let mut registry = Registry::new();
        registry.register(settings_descriptor(vec![])).unwrap();
        let manager = EntityManager::new(database(), registry, &EngineConfig::default());
        manager.verify_tables().await.unwrap();

        let bond = manager.create("Setting").unwrap();
        bond.set("key", "007").unwrap();
        bond.set("value", "bond").unwrap();
        manager.persist(&bond, false).await.unwrap();

        let seven = manager.create("Setting").unwrap();
        seven.set("key", "7").unwrap();
        seven.set("value", "seven").unwrap();
        manager.persist(&seven, false).await.unwrap();

        let cached = manager.cached("Setting", &Value::from("007")).unwrap().unwrap();
        assert!(cached.same_instance(&bond));

        let found = manager.find("Setting", &Filter::new(), &FindOptions::new()).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|e| e.same_instance(&bond)));
        assert!(found.iter().any(|e| e.same_instance(&seven)));
        assert_eq!(bond.get("value"), Value::from("bond"));
        assert_eq!(seven.get("value"), Value::from("seven"));
    }

    #[tokio::test]
    async fn test_stored_marker_rolls_back_with_failed_migration() {
        let db = database();
        db.execute(CREATE_SERIES, vec![]).await.unwrap();

        let registry = migrating_registry(&["CREATE TABLE Extra (id INTEGER)", "ALTER TABLE Nowhere ADD COLUMN x"]);
        let manager = EntityManager::new(db.clone(), registry, &EngineConfig::default());
        assert!(manager.verify_tables().await.is_err());

        let markers = SqliteMarkers::new(db.clone());
        assert_eq!(markers.get("database.version.Series").await.unwrap(), Some(2));

        let registry = migrating_registry(&["UPDATE Series SET rating = 0"]);
        let manager = EntityManager::new(db, registry, &EngineConfig::default());
        let report = manager.verify_tables().await.unwrap();
        assert_eq!(report.migrated, vec![("Series".to_string(), 3)]);
        assert_eq!(markers.get("database.version.Series").await.unwrap(), Some(3));
    }

    fn catalog_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(
                serie_descriptor()
                    .relation("Category", Relation::Many)
                    .connector("Category", "SerieCategory")
                    .relation(
                        "Fanart",
                        Relation::Custom {
                            source: "name".into(),
                            target: "serie_name".into(),
                        },
                    ),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::new("Category", "Categories", "ID_Category")
                    .fields(["label"])
                    .create_statement("CREATE TABLE Categories (ID_Category INTEGER PRIMARY KEY, label TEXT)"),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::new("SerieCategory", "SerieCategories", "ID_SerieCategory")
                    .fields(["ID_Serie", "ID_Category"])
                    .create_statement(
                        "CREATE TABLE SerieCategories (ID_SerieCategory INTEGER PRIMARY KEY, \
                         ID_Serie INTEGER, ID_Category INTEGER)",
                    ),
            )
            .unwrap();
        registry
            .register(
                EntityDescriptor::new("Fanart", "Fanart", "ID_Fanart")
                    .fields(["serie_name", "poster"])
                    .create_statement("CREATE TABLE Fanart (ID_Fanart INTEGER PRIMARY KEY, serie_name TEXT, poster TEXT)"),
            )
            .unwrap();
        registry
    }

    async fn stored(manager: &EntityManager, entity: &str, values: &[(&str, Value)]) -> Value {
        let instance = manager.create(entity).unwrap();
        for (field, value) in values {
            instance.set(field, value.clone()).unwrap();
        }
        manager.persist(&instance, false).await.unwrap().id
    }

    fn names(found: &[Entity]) -> Vec<String> {
        let mut names: Vec<String> = found
            .iter()
            .filter_map(|e| e.get("name").as_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_find_through_connector_and_custom_relation() {
        let manager = EntityManager::new(database(), catalog_registry(), &EngineConfig::default());
        manager.verify_tables().await.unwrap();

        let lost = stored(&manager, "Serie", &[("name", "Lost".into())]).await;
        let fringe = stored(&manager, "Serie", &[("name", "Fringe".into())]).await;
        stored(&manager, "Serie", &[("name", "Other".into())]).await;
        let drama = stored(&manager, "Category", &[("label", "drama".into())]).await;
        let scifi = stored(&manager, "Category", &[("label", "scifi".into())]).await;
        for (serie, category) in [(&lost, &drama), (&lost, &scifi), (&fringe, &scifi)] {
            stored(
                &manager,
                "SerieCategory",
                &[("ID_Serie", serie.clone()), ("ID_Category", category.clone())],
            )
            .await;
        }
        stored(&manager, "Fanart", &[("serie_name", "Lost".into()), ("poster", "island.jpg".into())]).await;

        let scifi_filter = Filter::new().related("Category", Filter::new().eq("label", "scifi"));
        let found = manager.find("Serie", &scifi_filter, &FindOptions::new()).await.unwrap();
        assert_eq!(names(&found), vec!["Fringe", "Lost"]);
        assert_eq!(manager.count("Serie", &scifi_filter).await.unwrap(), 2);

        let any_category = Filter::new().related("Category", Filter::new());
        let found = manager.find("Serie", &any_category, &FindOptions::new()).await.unwrap();
        assert_eq!(names(&found), vec!["Fringe", "Lost", "Other"]);
        assert_eq!(manager.count("Serie", &any_category).await.unwrap(), 3);

        let poster = Filter::new().related("Fanart", Filter::new().eq("poster", "island.jpg"));
        let found = manager.find("Serie", &poster, &FindOptions::new()).await.unwrap();
        assert_eq!(names(&found), vec!["Lost"]);
    }
}
