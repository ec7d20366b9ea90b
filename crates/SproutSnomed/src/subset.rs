//! Integrity filtering: every derived table becomes a strict subset of rows
//! whose concept references resolve inside the retained concept set.
//!
//! Rows are dropped, never patched: a description pointing at an excluded
//! concept disappears, a langrefset member pointing at a dropped description
//! disappears, an edge with an excluded endpoint disappears. Dropped-row
//! counts are reported but never fatal; a large count is an operator signal
//! that the release and the seed list disagree, not a build failure.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::models::{BuildConfig, ConceptRow, DescriptionRow, IsaEdge, LangRefsetRow};
use crate::release::ReleaseSnapshot;

/// Rows dropped per table for referential-integrity reasons.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropCounts {
    pub descriptions: usize,
    pub language_refset: usize,
    pub isa_edges: usize,
}

/// The final, integrity-checked table contents, sorted by primary key so
/// repeated builds from the same inputs produce identical artifacts.
#[derive(Debug)]
pub struct SubsetTables {
    pub concepts: Vec<ConceptRow>,
    pub descriptions: Vec<DescriptionRow>,
    pub language_refset: Vec<LangRefsetRow>,
    pub isa_edges: Vec<IsaEdge>,
    pub dropped: DropCounts,
}

impl SubsetTables {
    /// The concept ids present in the final concept table.
    pub fn concept_ids(&self) -> BTreeSet<i64> {
        self.concepts.iter().map(|row| row.concept_id).collect()
    }
}

/// Restrict the reduced release to the retained concept set.
///
/// The final concept table is the retained set filtered to concepts that are
/// active in this release; everything else follows from it. Optional
/// description-type and language-refset restrictions (and the dev-only
/// description cap) come from the configuration.
pub fn build_subset(
    snapshot: &ReleaseSnapshot,
    retained: &BTreeSet<i64>,
    config: &BuildConfig,
) -> SubsetTables {
    let mut dropped = DropCounts::default();

    let mut concepts: Vec<ConceptRow> = snapshot
        .concepts
        .values()
        .filter(|row| row.active && retained.contains(&row.concept_id))
        .cloned()
        .collect();
    concepts.sort_by_key(|row| row.concept_id);
    let concept_ids: BTreeSet<i64> = concepts.iter().map(|row| row.concept_id).collect();

    let mut descriptions: Vec<DescriptionRow> = Vec::new();
    for row in snapshot.descriptions.values() {
        if !row.active {
            continue;
        }
        if let Some(types) = &config.description_types {
            if !types.contains(&row.type_id) {
                continue;
            }
        }
        if !concept_ids.contains(&row.concept_id) {
            dropped.descriptions += 1;
            continue;
        }
        descriptions.push(row.clone());
    }
    descriptions.sort_by_key(|row| row.description_id);
    if config.limit_descriptions > 0 {
        descriptions.truncate(config.limit_descriptions);
    }
    let description_ids: BTreeSet<i64> =
        descriptions.iter().map(|row| row.description_id).collect();

    let mut language_refset: Vec<LangRefsetRow> = Vec::new();
    for row in snapshot.language_refset.values() {
        if !row.active {
            continue;
        }
        if let Some(refsets) = &config.lang_refsets {
            if !refsets.contains(&row.refset_id) {
                continue;
            }
        }
        if !description_ids.contains(&row.referenced_component_id) {
            dropped.language_refset += 1;
            continue;
        }
        language_refset.push(row.clone());
    }
    language_refset.sort_by_key(|row| row.langrefset_id);

    // Already sorted and deduplicated by the reader; filtering preserves that.
    let mut isa_edges: Vec<IsaEdge> = Vec::new();
    for edge in &snapshot.isa_edges {
        if concept_ids.contains(&edge.child) && concept_ids.contains(&edge.parent) {
            isa_edges.push(*edge);
        } else {
            dropped.isa_edges += 1;
        }
    }

    info!(
        kept_concepts = concepts.len(),
        kept_descriptions = descriptions.len(),
        kept_langrefset = language_refset.len(),
        kept_isa_edges = isa_edges.len(),
        dropped_descriptions = dropped.descriptions,
        dropped_langrefset = dropped.language_refset,
        dropped_isa_edges = dropped.isa_edges,
        "integrity filter applied"
    );
    if dropped.descriptions > descriptions.len() {
        warn!(
            dropped = dropped.descriptions,
            kept = descriptions.len(),
            "more descriptions dropped than kept; release and seed list may not match"
        );
    }

    SubsetTables {
        concepts,
        descriptions,
        language_refset,
        isa_edges,
        dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FSN_TYPE_ID, SYNONYM_TYPE_ID};
    use std::collections::HashMap;

    fn concept(concept_id: i64, active: bool) -> ConceptRow {
        ConceptRow {
            concept_id,
            active,
            effective_time: "20250101".to_string(),
            module_id: 0,
            definition_status_id: 0,
        }
    }

    fn description(description_id: i64, concept_id: i64, active: bool, type_id: i64) -> DescriptionRow {
        DescriptionRow {
            description_id,
            concept_id,
            active,
            effective_time: "20250101".to_string(),
            module_id: 0,
            language_code: "en".to_string(),
            type_id,
            term: format!("term {description_id}"),
            case_significance_id: 0,
        }
    }

    fn langrefset(langrefset_id: i64, referenced_component_id: i64, refset_id: i64) -> LangRefsetRow {
        LangRefsetRow {
            langrefset_id,
            active: true,
            effective_time: "20250101".to_string(),
            module_id: 0,
            refset_id,
            referenced_component_id,
            acceptability_id: 0,
        }
    }

    fn snapshot() -> ReleaseSnapshot {
        let mut concepts = HashMap::new();
        for row in [concept(100, true), concept(200, true), concept(300, false)] {
            concepts.insert(row.concept_id, row);
        }

        let mut descriptions = HashMap::new();
        for row in [
            description(1, 100, true, FSN_TYPE_ID),
            description(2, 200, true, SYNONYM_TYPE_ID),
            // References a concept missing from the retained set.
            description(3, 999, true, SYNONYM_TYPE_ID),
            // Inactive: filtered out, not counted as dangling.
            description(4, 100, false, SYNONYM_TYPE_ID),
            // Filtered by type before the dangling check.
            description(5, 100, true, 900000000000550004),
        ] {
            descriptions.insert(row.description_id, row);
        }

        let mut language_refset = HashMap::new();
        for row in [
            langrefset(10, 1, crate::models::EN_US_LANG_REFSET),
            // References the dropped description 3.
            langrefset(11, 3, crate::models::EN_US_LANG_REFSET),
            // Filtered by refset id.
            langrefset(12, 1, 42),
        ] {
            language_refset.insert(row.langrefset_id, row);
        }

        ReleaseSnapshot {
            concepts,
            descriptions,
            language_refset,
            isa_edges: vec![
                IsaEdge { child: 200, parent: 100 },
                // Endpoint 300 is inactive: the edge is dropped, not the concept kept.
                IsaEdge { child: 300, parent: 100 },
                IsaEdge { child: 999, parent: 200 },
            ],
        }
    }

    #[test]
    fn derived_tables_are_restricted_to_the_retained_concepts() {
        let snapshot = snapshot();
        let retained = BTreeSet::from([100, 200, 300, 999]);
        let config = BuildConfig::new("release", "seeds", "schema", "out");

        let tables = build_subset(&snapshot, &retained, &config);

        assert_eq!(tables.concept_ids(), BTreeSet::from([100, 200]));
        assert_eq!(
            tables.descriptions.iter().map(|d| d.description_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            tables.language_refset.iter().map(|l| l.langrefset_id).collect::<Vec<_>>(),
            vec![10]
        );
        assert_eq!(tables.isa_edges, vec![IsaEdge { child: 200, parent: 100 }]);

        assert_eq!(tables.dropped.descriptions, 1);
        assert_eq!(tables.dropped.language_refset, 1);
        assert_eq!(tables.dropped.isa_edges, 2);
    }

    #[test]
    fn description_cap_applies_after_sorting() {
        let snapshot = snapshot();
        let retained = BTreeSet::from([100, 200]);
        let mut config = BuildConfig::new("release", "seeds", "schema", "out");
        config.limit_descriptions = 1;

        let tables = build_subset(&snapshot, &retained, &config);
        assert_eq!(tables.descriptions.len(), 1);
        assert_eq!(tables.descriptions[0].description_id, 1);
        // The langrefset follows the capped description set.
        assert_eq!(tables.language_refset.len(), 1);
    }

    #[test]
    fn type_filter_can_be_disabled() {
        let snapshot = snapshot();
        let retained = BTreeSet::from([100, 200]);
        let mut config = BuildConfig::new("release", "seeds", "schema", "out");
        config.description_types = None;

        let tables = build_subset(&snapshot, &retained, &config);
        assert_eq!(
            tables.descriptions.iter().map(|d| d.description_id).collect::<Vec<_>>(),
            vec![1, 2, 5]
        );
    }
}
