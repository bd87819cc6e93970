//! YAML bootstrap registry: sources, reference entities and operator aliases.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use ksync_core::{CanonicalEntity, ConnectorSpec, MappingOrigin, MappingType, NewSource};
use ksync_storage::SyncStore;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub mapping_type: MappingType,
    pub source_value: String,
    pub canonical_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub sources: Vec<NewSource>,
    #[serde(default)]
    pub canonical: Vec<CanonicalEntity>,
    #[serde(default)]
    pub aliases: Vec<AliasEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub sources: usize,
    pub canonical: usize,
    pub aliases: usize,
    pub skipped_aliases: usize,
}

/// Parse a registry file. Relative fixture paths are taken from the file's directory.
pub async fn load_registry(path: impl AsRef<Path>) -> Result<Registry> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut registry: Registry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for source in &mut registry.sources {
        if let ConnectorSpec::Fixture { path } = &mut source.connector {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    let mut seen = HashSet::new();
    for source in &registry.sources {
        if let Some(id) = source.id {
            anyhow::ensure!(seen.insert(id), "source id {id} is listed twice in {}", path.display());
        }
    }
    Ok(registry)
}

/// Upsert everything in the registry file into `store`. Aliases become manual mappings.
pub async fn import_registry(
    store: &dyn SyncStore,
    path: impl AsRef<Path>,
    imported_by: &str,
) -> Result<ImportSummary> {
    let path = path.as_ref();
    let registry = load_registry(path).await?;
    let mut summary = ImportSummary::default();

    let existing = store.list_sources(false).await?;
    for mut source in registry.sources {
        // Id-less entries are matched by alias so a re-import updates in place.
        if source.id.is_none() {
            source.id = existing
                .iter()
                .find(|s| s.alias.eq_ignore_ascii_case(&source.alias))
                .map(|s| s.id);
        }
        let alias = source.alias.clone();
        let saved = store
            .upsert_source(source)
            .await
            .with_context(|| format!("importing source {alias}"))?;
        info!(source_id = saved.id, alias = %saved.alias, connector = saved.connector.kind(), "imported source");
        summary.sources += 1;
    }

    let mut known = HashSet::new();
    for entity in &registry.canonical {
        store
            .upsert_canonical_entity(entity)
            .await
            .with_context(|| format!("importing {} {}", entity.mapping_type, entity.canonical_id))?;
        known.insert((entity.mapping_type, entity.canonical_id.clone()));
        summary.canonical += 1;
    }

    for alias in &registry.aliases {
        if !known.contains(&(alias.mapping_type, alias.canonical_id.clone())) {
            let existing = store.canonical_entities(alias.mapping_type).await?;
            if !existing.iter().any(|e| e.canonical_id == alias.canonical_id) {
                warn!(
                    mapping_type = %alias.mapping_type,
                    source_value = %alias.source_value,
                    canonical_id = %alias.canonical_id,
                    "alias points at an unknown entity; skipping"
                );
                summary.skipped_aliases += 1;
                continue;
            }
        }
        store
            .save_value_mapping(
                alias.mapping_type,
                alias.source_value.trim(),
                &alias.canonical_id,
                MappingOrigin::Manual,
                imported_by,
            )
            .await
            .with_context(|| format!("importing alias {:?}", alias.source_value))?;
        summary.aliases += 1;
    }

    info!(
        path = %path.display(),
        sources = summary.sources,
        canonical = summary.canonical,
        aliases = summary.aliases,
        skipped = summary.skipped_aliases,
        "imported registry"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksync_storage::MemoryStore;

    const REGISTRY: &str = r#"
sources:
  - id: 3
    alias: Visita Operativa
    connector:
      type: fixture
      path: fixtures/visita.json
  - alias: Encuesta Clientes
    credentials_ref: FORMS
    connector:
      type: paged_json
      url: https://forms.example.test/api/responses
      id_field: responseId
      next_pointer: /nextLink
canonical:
  - mapping_type: STORE
    canonical_id: S01
    display_name: Rostipollos Escazu
  - mapping_type: PERSON
    canonical_id: P01
    display_name: Ana Mora
    email: ana.mora@corp.test
aliases:
  - mapping_type: STORE
    source_value: " Escazu Centro "
    canonical_id: S01
  - mapping_type: STORE
    source_value: Cerrado
    canonical_id: S99
"#;

    fn write_registry(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("sources.yaml");
        std::fs::write(&path, REGISTRY).expect("write registry");
        path
    }

    #[tokio::test]
    async fn fixture_paths_resolve_next_to_the_registry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = load_registry(write_registry(dir.path())).await.expect("load");
        assert_eq!(registry.sources.len(), 2);
        match &registry.sources[0].connector {
            ConnectorSpec::Fixture { path } => assert_eq!(path, &dir.path().join("fixtures/visita.json")),
            other => panic!("unexpected connector {other:?}"),
        }
        assert!(registry.sources[1].active);
    }

    #[tokio::test]
    async fn import_upserts_everything_and_skips_dangling_aliases() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_registry(dir.path());
        let store = MemoryStore::new();

        let summary = import_registry(&store, &path, "ops").await.expect("import");
        assert_eq!(
            summary,
            ImportSummary {
                sources: 2,
                canonical: 2,
                aliases: 1,
                skipped_aliases: 1
            }
        );
        let mapping = store
            .active_value_mapping(MappingType::Store, "Escazu Centro")
            .await
            .expect("lookup")
            .expect("alias saved");
        assert_eq!(mapping.origin, MappingOrigin::Manual);
        assert_eq!(mapping.created_by, "ops");

        // Importing again updates in place.
        import_registry(&store, &path, "ops").await.expect("reimport");
        assert_eq!(store.list_sources(false).await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn duplicate_source_ids_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dup.yaml");
        std::fs::write(
            &path,
            "sources:\n  - {id: 1, alias: a, connector: {type: fixture, path: a.json}}\n  - {id: 1, alias: b, connector: {type: fixture, path: b.json}}\n",
        )
        .expect("write");
        assert!(load_registry(&path).await.is_err());
    }
}
