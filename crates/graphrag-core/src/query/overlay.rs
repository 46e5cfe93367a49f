//! Merged master + feature view for query consumers.

use std::collections::HashSet;

use serde::Serialize;

use crate::errors::GraphResult;
use crate::models::{CurrentEntity, EntityKind, QueryFilter};
use crate::store::reader::StoreReader;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Master,
    Feature,
}

#[derive(Clone, Debug, Serialize)]
pub struct OverlayHit {
    pub origin: Origin,
    #[serde(flatten)]
    pub entity: CurrentEntity,
}

/// Types whose inheritance clause names `name`, extensions included.
#[derive(Clone, Debug, Serialize)]
pub struct Implementations {
    pub name: String,
    /// Primary declaration of `name`, when it is indexed.
    pub definition: Option<OverlayHit>,
    pub implementation_count: usize,
    pub implementations: Vec<OverlayHit>,
}

/// Feature documents shadow the master's entities for the same path,
/// deleted documents included.
#[derive(Clone, Debug)]
pub struct OverlayReader {
    master: StoreReader,
    feature: Option<StoreReader>,
}

impl OverlayReader {
    /// A feature store that does not exist on disk is ignored.
    pub fn new(master: StoreReader, feature: Option<StoreReader>) -> Self {
        Self {
            master,
            feature: feature.filter(StoreReader::exists),
        }
    }

    pub fn master(&self) -> &StoreReader {
        &self.master
    }

    pub fn feature(&self) -> Option<&StoreReader> {
        self.feature.as_ref()
    }

    pub fn query_current(&self, filter: &QueryFilter) -> GraphResult<Vec<OverlayHit>> {
        let unbounded = QueryFilter {
            limit: 0,
            ..filter.clone()
        };

        let (shadowed, feature_hits) = match &self.feature {
            Some(feature) => {
                let paths: HashSet<String> = feature.document_paths()?.into_iter().collect();
                (paths, feature.query_current(&unbounded)?)
            }
            None => (HashSet::new(), Vec::new()),
        };

        let mut hits: Vec<OverlayHit> = self
            .master
            .query_current(&unbounded)?
            .into_iter()
            .filter(|e| !shadowed.contains(&e.declaring_path))
            .map(|entity| OverlayHit {
                origin: Origin::Master,
                entity,
            })
            .collect();
        hits.extend(feature_hits.into_iter().map(|entity| OverlayHit {
            origin: Origin::Feature,
            entity,
        }));

        hits.sort_by(|a, b| {
            (&a.entity.name, &a.entity.declaring_path, &a.entity.identity_key).cmp(&(
                &b.entity.name,
                &b.entity.declaring_path,
                &b.entity.identity_key,
            ))
        });
        if filter.limit > 0 {
            hits.truncate(filter.limit);
        }
        Ok(hits)
    }

    /// Declaration of the entity named exactly `name`.  Primary declarations
    /// win over extensions; `path_hint` breaks ties between same-named types.
    pub fn definition(
        &self,
        name: &str,
        path_hint: Option<&str>,
    ) -> GraphResult<Option<OverlayHit>> {
        let hits = self.query_current(&QueryFilter {
            name: Some(name.to_string()),
            exact_name: true,
            include_members: true,
            ..Default::default()
        })?;
        let extension = EntityKind::Extension.as_str();
        Ok(hits.into_iter().min_by_key(|hit| {
            (
                hit.entity.kind == extension,
                path_hint.is_some_and(|p| p != hit.entity.declaring_path),
            )
        }))
    }

    pub fn implementations(&self, name: &str, limit: usize) -> GraphResult<Implementations> {
        let implementations = self.query_current(&QueryFilter {
            inherits: Some(name.to_string()),
            limit,
            ..Default::default()
        })?;
        Ok(Implementations {
            name: name.to_string(),
            definition: self.definition(name, None)?,
            implementation_count: implementations.len(),
            implementations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        identity_key, CommitBatch, EntityFacts, EntityKind, FileFacts, ModuleInfo,
    };
    use crate::store::database::EntityStore;

    fn file(path: &str, names: &[&str]) -> FileFacts {
        FileFacts {
            path: path.to_string(),
            content_hash: format!("{path}:{}", names.join(",")),
            module: ModuleInfo::unresolved("root"),
            entities: names
                .iter()
                .map(|name| EntityFacts {
                    identity_key: identity_key(EntityKind::Struct, name, path),
                    name: name.to_string(),
                    qualified_name: name.to_string(),
                    kind: EntityKind::Struct,
                    start_line: 1,
                    end_line: 1,
                    signature: format!("struct {name}"),
                    docstring: None,
                    visibility: "internal".into(),
                    inherits: Vec::new(),
                    extended_type: None,
                    members: Vec::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_feature_documents_shadow_master() {
        let dir = tempfile::tempdir().unwrap();
        let master = EntityStore::open(dir.path().join("m.db")).unwrap();
        let feature = EntityStore::open(dir.path().join("m.feature.db")).unwrap();

        let mut batch = CommitBatch::new("c1");
        batch.files = vec![
            file("A.swift", &["Alpha"]),
            file("B.swift", &["Beta"]),
            file("C.swift", &["Gamma"]),
        ];
        master.apply_commit(&batch).unwrap();

        let mut batch = CommitBatch::new("f1");
        batch.files = vec![file("A.swift", &["AlphaPrime"])];
        batch.deleted = vec!["B.swift".into()];
        feature.apply_commit(&batch).unwrap();

        let overlay = OverlayReader::new(master.reader(), Some(feature.reader()));
        let hits = overlay.query_current(&QueryFilter::default()).unwrap();
        let names: Vec<(&str, Origin)> = hits
            .iter()
            .map(|h| (h.entity.name.as_str(), h.origin))
            .collect();
        assert_eq!(
            names,
            vec![("AlphaPrime", Origin::Feature), ("Gamma", Origin::Master)]
        );

        let limited = overlay
            .query_current(&QueryFilter {
                limit: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    fn declaration(
        kind: EntityKind,
        name: &str,
        path: &str,
        inherits: &[&str],
        extended_type: Option<&str>,
    ) -> EntityFacts {
        EntityFacts {
            identity_key: identity_key(kind, name, path),
            name: name.to_string(),
            qualified_name: name.to_string(),
            kind,
            start_line: 1,
            end_line: 1,
            signature: format!("{kind} {name}"),
            docstring: None,
            visibility: "internal".into(),
            inherits: inherits.iter().map(|s| s.to_string()).collect(),
            extended_type: extended_type.map(str::to_string),
            members: Vec::new(),
        }
    }

    fn facts_file(path: &str, entities: Vec<EntityFacts>) -> FileFacts {
        FileFacts {
            path: path.to_string(),
            content_hash: path.to_string(),
            module: ModuleInfo::unresolved("root"),
            entities,
        }
    }

    /// Master: `Cart` + extension, `PricingService` + one conformer.
    /// Feature: a second conformer.
    fn pricing_overlay(dir: &std::path::Path) -> OverlayReader {
        let master = EntityStore::open(dir.join("m.db")).unwrap();
        let feature = EntityStore::open(dir.join("m.feature.db")).unwrap();

        let mut batch = CommitBatch::new("c1");
        batch.files = vec![
            facts_file(
                "Pricing.swift",
                vec![declaration(EntityKind::Protocol, "PricingService", "Pricing.swift", &[], None)],
            ),
            facts_file(
                "Cart+Pricing.swift",
                vec![declaration(
                    EntityKind::Extension,
                    "Cart",
                    "Cart+Pricing.swift",
                    &["PricingService"],
                    Some("Cart"),
                )],
            ),
            facts_file(
                "Cart.swift",
                vec![declaration(EntityKind::Struct, "Cart", "Cart.swift", &["Codable"], None)],
            ),
        ];
        master.apply_commit(&batch).unwrap();

        let mut batch = CommitBatch::new("f1");
        batch.files = vec![facts_file(
            "Discount.swift",
            vec![declaration(
                EntityKind::Class,
                "DiscountPricing",
                "Discount.swift",
                &["NSObject", "PricingService"],
                None,
            )],
        )];
        feature.apply_commit(&batch).unwrap();
        OverlayReader::new(master.reader(), Some(feature.reader()))
    }

    #[test]
    fn test_definition_prefers_primary_declaration() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = pricing_overlay(dir.path());

        let cart = overlay.definition("Cart", None).unwrap().unwrap();
        assert_eq!(cart.entity.kind, "struct");
        assert_eq!(cart.entity.declaring_path, "Cart.swift");

        let hinted = overlay
            .definition("Cart", Some("Cart+Pricing.swift"))
            .unwrap()
            .unwrap();
        assert_eq!(hinted.entity.kind, "struct");

        let feature = overlay.definition("DiscountPricing", None).unwrap().unwrap();
        assert_eq!(feature.origin, Origin::Feature);
        assert!(overlay.definition("Car", None).unwrap().is_none());
    }

    #[test]
    fn test_implementations_span_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = pricing_overlay(dir.path());

        let found = overlay.implementations("PricingService", 0).unwrap();
        assert_eq!(found.definition.unwrap().entity.kind, "protocol");
        let names: Vec<(&str, Origin)> = found
            .implementations
            .iter()
            .map(|h| (h.entity.name.as_str(), h.origin))
            .collect();
        assert_eq!(
            names,
            vec![("Cart", Origin::Master), ("DiscountPricing", Origin::Feature)]
        );
        assert_eq!(found.implementation_count, 2);

        let none = overlay.implementations("Equatable", 0).unwrap();
        assert!(none.definition.is_none());
        assert!(none.implementations.is_empty());
    }

    #[test]
    fn test_missing_feature_store_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let master = EntityStore::open(dir.path().join("m.db")).unwrap();
        let mut batch = CommitBatch::new("c1");
        batch.files = vec![file("A.swift", &["Alpha"])];
        master.apply_commit(&batch).unwrap();

        let overlay = OverlayReader::new(
            master.reader(),
            Some(StoreReader::new(dir.path().join("absent.db"))),
        );
        assert!(overlay.feature().is_none());
        assert_eq!(overlay.query_current(&QueryFilter::default()).unwrap().len(), 1);
    }
}
