//! Incremental run behavior against persisted state:
//!
//! 1. A delta entity bridging two clusters relabels every member of both
//! 2. A FULL run over the cumulative data matches the INCR sequence
//! 3. An over-cap identifier group stays skipped when a delta re-touches it
//! 4. Empty deltas leave state untouched and report no changes
//! 5. Dry runs write to the preview surface only
//! 6. Watermarks advance per source, only after a live commit

#[path = "../src/test_support.rs"]
mod test_support;

use std::collections::BTreeMap;

use idgraph::{Entity, ExactRule, IdGraph, Identifier, RuleSet, RunMode, RunStatus};
use test_support::{default_rules, generate_batch, generate_dataset, GeneratedDataset};

fn assignments(engine: &IdGraph) -> anyhow::Result<BTreeMap<String, String>> {
    Ok(engine
        .memberships()?
        .into_iter()
        .map(|m| (m.entity_key, m.resolved_id))
        .collect())
}

#[test]
fn bridge_entity_relabels_both_clusters() -> anyhow::Result<()> {
    let entities = vec![
        Entity::new("a:1", "crm", 100),
        Entity::new("a:2", "crm", 101),
        Entity::new("b:1", "erp", 102),
        Entity::new("b:2", "erp", 103),
    ];
    let identifiers = vec![
        Identifier::new("a:1", "email", "left@x.com", "email_exact"),
        Identifier::new("a:2", "email", "left@x.com", "email_exact"),
        Identifier::new("b:1", "email", "right@x.com", "email_exact"),
        Identifier::new("b:2", "email", "right@x.com", "email_exact"),
    ];

    let engine = IdGraph::new(default_rules());
    engine.run_full(&entities, &identifiers, &[])?;

    let before = assignments(&engine)?;
    assert_eq!(before["a:2"], "a:1");
    assert_eq!(before["b:2"], "b:1");

    // The delta extract carries only the new bridge entity.
    let delta_entities = vec![Entity::new("c:9", "web", 200)];
    let delta_identifiers = vec![
        Identifier::new("c:9", "email", "left@x.com", "email_exact"),
        Identifier::new("c:9", "email", "right@x.com", "email_exact"),
    ];

    let summary = engine.run_incremental(&delta_entities, &delta_identifiers, &[])?;
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.entities_processed, 1);
    assert_eq!(summary.clusters_impacted, 1);

    let after = assignments(&engine)?;
    assert_eq!(after.len(), 5);
    for key in ["a:1", "a:2", "b:1", "b:2", "c:9"] {
        assert_eq!(after[key], "a:1", "entity {key}");
    }

    Ok(())
}

#[test]
fn incremental_sequence_matches_cumulative_full() -> anyhow::Result<()> {
    let batch1 = generate_batch(1, 150, 0.3, 5);
    let batch2 = generate_batch(151, 150, 0.3, 5);

    let incremental = IdGraph::new(default_rules());
    incremental.run_full(&batch1.entities, &batch1.identifiers, &batch1.attributes)?;
    incremental.run_incremental(&batch2.entities, &batch2.identifiers, &batch2.attributes)?;

    let mut cumulative = GeneratedDataset::default();
    cumulative.extend(batch1);
    cumulative.extend(batch2);

    let full = IdGraph::new(default_rules());
    full.run_full(
        &cumulative.entities,
        &cumulative.identifiers,
        &cumulative.attributes,
    )?;

    assert_eq!(assignments(&incremental)?, assignments(&full)?);
    assert_eq!(incremental.golden_profiles()?, full.golden_profiles()?);

    Ok(())
}

#[test]
fn over_cap_group_stays_skipped_across_incremental() -> anyhow::Result<()> {
    fn capped_rules() -> RuleSet {
        let mut rules = RuleSet::new();
        rules.add_exact_rule(ExactRule::new("id9_exact", "id9").with_max_group_size(2));
        rules
    }

    let base_entities = vec![
        Entity::new("e:1", "crm", 100),
        Entity::new("e:2", "crm", 101),
        Entity::new("e:3", "crm", 102),
    ];
    let base_identifiers: Vec<Identifier> = base_entities
        .iter()
        .map(|e| Identifier::new(e.entity_key.clone(), "id9", "shared", "id9_exact"))
        .collect();

    let engine = IdGraph::new(capped_rules());
    let first = engine.run_full(&base_entities, &base_identifiers, &[])?;
    assert_eq!(first.groups_skipped, 1);
    assert_eq!(first.edges_created, 0);

    // A new source re-extracts only part of the oversized group. The
    // persisted index must bring the old members back so the rebuilt
    // group is judged at full size, not at delta size.
    let delta_entities = vec![Entity::new("e:4", "web", 200), Entity::new("e:5", "web", 201)];
    let delta_identifiers = vec![
        Identifier::new("e:4", "id9", "shared", "id9_exact"),
        Identifier::new("e:5", "id9", "shared", "id9_exact"),
    ];
    let incr = engine.run_incremental(&delta_entities, &delta_identifiers, &[])?;
    assert_eq!(incr.status, RunStatus::SuccessWithWarnings);
    assert_eq!(incr.groups_skipped, 1);
    assert_eq!(incr.edges_created, 0);

    let after = assignments(&engine)?;
    assert_eq!(after.len(), 5);
    for key in ["e:1", "e:2", "e:3", "e:4", "e:5"] {
        assert_eq!(after[key], key, "entity {key}");
    }

    // One audit row at the rebuilt size, no stale twin from the first run.
    let skipped = engine.store().skipped_groups()?;
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].group_size, 5);
    assert_eq!(skipped[0].max_allowed, 2);

    // Same assignment as a single FULL rebuild over the cumulative rows.
    let mut all_entities = base_entities.clone();
    all_entities.extend(delta_entities.iter().cloned());
    let mut all_identifiers = base_identifiers.clone();
    all_identifiers.extend(delta_identifiers.iter().cloned());
    let full = IdGraph::new(capped_rules());
    full.run_full(&all_entities, &all_identifiers, &[])?;
    assert_eq!(assignments(&engine)?, assignments(&full)?);

    Ok(())
}

#[test]
fn empty_delta_reports_no_changes() -> anyhow::Result<()> {
    let dataset = generate_dataset(50, 0.3, 23);
    let engine = IdGraph::new(default_rules());
    engine.run_full(&dataset.entities, &dataset.identifiers, &dataset.attributes)?;
    let before = assignments(&engine)?;

    // Re-delivering the same rows changes nothing in the assignment.
    let replay = engine.run_incremental(
        &dataset.entities,
        &dataset.identifiers,
        &dataset.attributes,
    )?;
    assert_eq!(replay.status, RunStatus::Success);
    assert_eq!(assignments(&engine)?, before);

    // An empty extract short-circuits before any commit.
    let noop = engine.run_incremental(&[], &[], &[])?;
    assert!(noop.no_changes);
    assert_eq!(noop.entities_processed, 0);
    assert_eq!(assignments(&engine)?, before);

    Ok(())
}

#[test]
fn dry_run_previews_merge_without_commit() -> anyhow::Result<()> {
    let entities = vec![Entity::new("d:1", "crm", 10), Entity::new("d:2", "crm", 11)];
    let identifiers = vec![
        Identifier::new("d:1", "email", "one@x.com", "email_exact"),
        Identifier::new("d:2", "email", "two@x.com", "email_exact"),
    ];

    let engine = IdGraph::new(default_rules());
    engine.run_full(&entities, &identifiers, &[])?;
    let states_before = engine.store().run_states()?;

    let delta_entities = vec![Entity::new("d:3", "crm", 50)];
    let delta_identifiers = vec![Identifier::new("d:3", "email", "one@x.com", "email_exact")];

    let summary = engine.dry_run(
        idgraph::RunInput::new(&delta_entities, &delta_identifiers, &[]),
        RunMode::Incr,
    )?;
    assert!(summary.dry_run);
    assert!(summary.run_id.starts_with("dry_run_"));

    // Durable state is untouched, including watermarks.
    assert_eq!(assignments(&engine)?.len(), 2);
    assert_eq!(engine.store().run_states()?, states_before);

    // The diff covers the working set: d:3 plus the cluster it would join.
    let preview = engine
        .preview(&summary.run_id)?
        .ok_or_else(|| anyhow::anyhow!("missing preview"))?;
    assert_eq!(preview.report.new_entities, 1);
    assert_eq!(preview.report.moved_entities, 0);
    assert_eq!(preview.report.unchanged_entities, 1);
    assert_eq!(preview.report.total_entities, 2);
    assert_eq!(preview.report.largest_cluster_id.as_deref(), Some("d:1"));
    assert_eq!(preview.report.largest_cluster_size, 2);

    // The same delta still applies in a later live run.
    engine.run_incremental(&delta_entities, &delta_identifiers, &[])?;
    let after = assignments(&engine)?;
    assert_eq!(after["d:3"], "d:1");
    assert_eq!(after["d:1"], "d:1");

    Ok(())
}

#[test]
fn watermarks_advance_per_source() -> anyhow::Result<()> {
    let entities = vec![
        Entity::new("w:1", "crm", 100),
        Entity::new("w:2", "crm", 140),
        Entity::new("w:3", "web", 120),
    ];
    let identifiers = vec![Identifier::new("w:1", "email", "w@x.com", "email_exact")];

    let engine = IdGraph::new(default_rules());
    engine.run_full(&entities, &identifiers, &[])?;

    let states: BTreeMap<String, i64> = engine
        .store()
        .run_states()?
        .into_iter()
        .map(|s| (s.source_id, s.last_watermark))
        .collect();
    assert_eq!(states["crm"], 140);
    assert_eq!(states["web"], 120);

    let delta = vec![Entity::new("w:4", "web", 300)];
    let incr = engine.run_incremental(&delta, &[], &[])?;

    let states = engine.store().run_states()?;
    let web = states
        .iter()
        .find(|s| s.source_id == "web")
        .ok_or_else(|| anyhow::anyhow!("missing web state"))?;
    assert_eq!(web.last_watermark, 300);
    assert_eq!(web.updated_by_run, incr.run_id);

    // The untouched source keeps its checkpoint.
    let crm = states
        .iter()
        .find(|s| s.source_id == "crm")
        .ok_or_else(|| anyhow::anyhow!("missing crm state"))?;
    assert_eq!(crm.last_watermark, 140);

    Ok(())
}
