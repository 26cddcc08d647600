use super::*;
use coexa_model::{NodeDegreeStats, UnorderedLink};
use std::collections::BTreeMap;
use tempfile::TempDir;

const TAXON: TaxonId = TaxonId::new(9606);

fn open_store(policy: PrunePolicy) -> (TempDir, RelationStore) {
    let dir = TempDir::new().expect("tempdir");
    let cfg = StoreConfig {
        prune_policy: policy,
        ..Default::default()
    };
    let store = RelationStore::open(&dir.path().join("coexa.sqlite"), cfg).expect("open store");
    (dir, store)
}

fn gene(id: u64) -> GeneId {
    GeneId::new(id)
}

fn experiment(id: u64) -> ExperimentId {
    ExperimentId::new(id)
}

fn link(a: u64, b: u64, positive: bool) -> UnorderedLink {
    UnorderedLink::new(gene(a), gene(b), Correlation::from_positive(positive)).expect("link")
}

fn tested(genes: &[u64]) -> BTreeSet<GeneId> {
    genes.iter().map(|g| gene(*g)).collect()
}

#[test]
fn ingest_creates_mirrored_rows_with_shared_support() {
    let (_dir, store) = open_store(PrunePolicy::KeepDormant);
    let applied = store
        .apply(TAXON, experiment(1), &[link(1, 2, true)], &tested(&[1, 2]))
        .expect("apply");
    assert_eq!(applied.created, 1);
    assert_eq!(applied.updated, 0);

    let forward = store.links_for_genes(TAXON, &[gene(1)], 1).expect("query");
    let mirror = store.links_for_genes(TAXON, &[gene(2)], 1).expect("query");
    assert_eq!(forward.len(), 1);
    assert_eq!(mirror.len(), 1);
    assert_eq!(forward[0].second_gene, gene(2));
    assert_eq!(mirror[0].second_gene, gene(1));
    assert_eq!(forward[0].support, 1);
    assert_eq!(mirror[0].support, 1);
    assert!(forward[0].support_ids.contains(1));
}

#[test]
fn support_accumulates_across_experiments() {
    let (_dir, store) = open_store(PrunePolicy::KeepDormant);
    for e in 1..=3u64 {
        store
            .apply(TAXON, experiment(e), &[link(1, 2, true)], &tested(&[1, 2]))
            .expect("apply");
    }
    let rows = store.links_for_genes(TAXON, &[gene(1)], 1).expect("query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].support, 3);
    assert_eq!(rows[0].support_ids.iter().collect::<Vec<_>>(), vec![1, 2, 3]);

    // The mirror must carry the identical denormalized count.
    let mirror = store.links_for_genes(TAXON, &[gene(2)], 3).expect("query");
    assert_eq!(mirror.len(), 1);
    assert_eq!(mirror[0].support, 3);
}

#[test]
fn reingesting_an_experiment_is_a_state_error() {
    let (_dir, store) = open_store(PrunePolicy::KeepDormant);
    store
        .apply(TAXON, experiment(1), &[link(1, 2, true)], &tested(&[1, 2]))
        .expect("apply");
    let err = store
        .apply(TAXON, experiment(1), &[link(1, 3, true)], &tested(&[1, 3]))
        .expect_err("must reject");
    assert!(matches!(err, StoreError::StateConflict(_)), "got {err}");
    // Rejected before any mutation: gene 3 must be untouched.
    assert!(store
        .links_for_genes(TAXON, &[gene(3)], 1)
        .expect("query")
        .is_empty());
}

#[test]
fn duplicate_link_in_one_batch_aborts_everything() {
    let (_dir, store) = open_store(PrunePolicy::KeepDormant);
    let err = store
        .apply(
            TAXON,
            experiment(1),
            &[link(5, 6, true), link(1, 2, true), link(6, 5, true)],
            &tested(&[1, 2, 5, 6]),
        )
        .expect_err("must reject");
    assert!(matches!(err, StoreError::StateConflict(_)), "got {err}");
    assert!(store
        .links_for_genes(TAXON, &[gene(1)], 1)
        .expect("query")
        .is_empty());
    assert_eq!(store.count_links(TAXON, experiment(1)).expect("count"), 0);
}

#[test]
fn positive_and_negative_links_are_distinct() {
    let (_dir, store) = open_store(PrunePolicy::KeepDormant);
    store
        .apply(
            TAXON,
            experiment(1),
            &[link(1, 2, true), link(1, 2, false)],
            &tested(&[1, 2]),
        )
        .expect("apply");
    let rows = store.links_for_genes(TAXON, &[gene(1)], 1).expect("query");
    assert_eq!(rows.len(), 2);
    assert_eq!(store.count_links(TAXON, experiment(1)).expect("count"), 2);
}

#[test]
fn experiment_link_counts_do_not_double_count() {
    let (_dir, store) = open_store(PrunePolicy::KeepDormant);
    store
        .apply(
            TAXON,
            experiment(7),
            &[link(1, 2, true), link(1, 3, false)],
            &tested(&[1, 2, 3]),
        )
        .expect("apply");
    assert_eq!(store.count_links(TAXON, experiment(7)).expect("count"), 2);
    assert_eq!(
        store
            .count_links_for_gene(TAXON, gene(1), experiment(7))
            .expect("count"),
        2
    );
    assert_eq!(
        store
            .count_links_for_gene(TAXON, gene(2), experiment(7))
            .expect("count"),
        1
    );
    assert!(store.has_links(TAXON, experiment(7)).expect("has"));
    assert!(!store.has_links(TAXON, experiment(8)).expect("has"));
}

#[test]
fn retract_restores_preingest_state() {
    for policy in [PrunePolicy::KeepDormant, PrunePolicy::DeleteOrphans] {
        let (_dir, store) = open_store(policy);
        store
            .apply(TAXON, experiment(1), &[link(1, 2, true)], &tested(&[1, 2, 3]))
            .expect("apply e1");
        store
            .apply(
                TAXON,
                experiment(2),
                &[link(1, 2, true), link(1, 3, false)],
                &tested(&[1, 2, 3]),
            )
            .expect("apply e2");

        let outcome = store.retract(TAXON, experiment(2)).expect("retract");
        assert_eq!(outcome.adjusted + outcome.pruned, 2);

        let rows = store.links_for_genes(TAXON, &[gene(1)], 1).expect("query");
        assert_eq!(rows.len(), 1, "policy {policy:?}");
        assert_eq!(rows[0].second_gene, gene(2));
        assert_eq!(rows[0].support, 1);
        assert!(!rows[0].support_ids.contains(2));
        assert_eq!(store.count_links(TAXON, experiment(2)).expect("count"), 0);

        let tested_in = store.tested_in(TAXON, &[gene(1), gene(3)]).expect("tested");
        assert!(!tested_in[&gene(1)].contains(2));
        assert!(tested_in[&gene(1)].contains(1));
        // Gene 3 never had a surviving link but keeps its e1 tested-in entry.
        assert!(tested_in[&gene(3)].contains(1));
        assert!(!tested_in[&gene(3)].contains(2));
    }
}

#[test]
fn retract_then_reingest_works_under_both_policies() {
    for policy in [PrunePolicy::KeepDormant, PrunePolicy::DeleteOrphans] {
        let (_dir, store) = open_store(policy);
        store
            .apply(TAXON, experiment(1), &[link(1, 2, true)], &tested(&[1, 2]))
            .expect("apply");
        store.retract(TAXON, experiment(1)).expect("retract");

        // Dormant rows must be invisible to queries.
        assert!(store
            .links_for_genes(TAXON, &[gene(1)], 1)
            .expect("query")
            .is_empty());

        store
            .apply(TAXON, experiment(1), &[link(1, 2, true)], &tested(&[1, 2]))
            .expect("re-apply after retract");
        let rows = store.links_for_genes(TAXON, &[gene(1)], 1).expect("query");
        assert_eq!(rows.len(), 1, "policy {policy:?}");
        assert_eq!(rows[0].support, 1);
    }
}

#[test]
fn opposite_sign_survives_pruning_of_its_twin() {
    let (_dir, store) = open_store(PrunePolicy::DeleteOrphans);
    store
        .apply(TAXON, experiment(1), &[link(1, 2, true)], &tested(&[1, 2]))
        .expect("apply e1");
    store
        .apply(TAXON, experiment(2), &[link(1, 2, false)], &tested(&[1, 2]))
        .expect("apply e2");

    // Prunes the positive link; the negative one must keep working, and a
    // later ingest of the positive pair must go through the update path.
    store.retract(TAXON, experiment(1)).expect("retract");
    let rows = store.links_for_genes(TAXON, &[gene(1)], 1).expect("query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].correlation, Correlation::Negative);

    store
        .apply(TAXON, experiment(3), &[link(1, 2, true)], &tested(&[1, 2]))
        .expect("apply e3");
    let rows = store.links_for_genes(TAXON, &[gene(1)], 1).expect("query");
    assert_eq!(rows.len(), 2);
}

#[test]
fn experiment_first_index_serves_constrained_fetches() {
    let (_dir, store) = open_store(PrunePolicy::KeepDormant);
    store
        .apply(
            TAXON,
            experiment(1),
            &[link(1, 2, true), link(3, 4, true)],
            &tested(&[1, 2, 3, 4]),
        )
        .expect("apply e1");
    store
        .apply(TAXON, experiment(2), &[link(1, 2, true)], &tested(&[1, 2]))
        .expect("apply e2");

    let rows = store
        .experiment_links_for_genes(TAXON, &[experiment(1), experiment(2)], &[gene(1)])
        .expect("experiment links");
    // Gene 1 is first gene of one direction of its link in each experiment.
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.first_gene == gene(1)));

    let ids = store
        .link_ids_for_experiments(TAXON, &[experiment(1)])
        .expect("link ids");
    assert_eq!(ids.len(), 2);

    let inter = store
        .inter_link_ids_for_experiments(TAXON, &[experiment(1)], &[gene(3), gene(4)])
        .expect("inter ids");
    assert_eq!(inter.len(), 1);
    let loaded = store.load_links(TAXON, &inter).expect("load");
    // The index stores the forward link id for both directions, so one
    // logical link hydrates to exactly one row.
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].first_gene, gene(3));
    assert_eq!(loaded[0].second_gene, gene(4));
}

#[test]
fn inter_links_require_both_genes_in_set() {
    let (_dir, store) = open_store(PrunePolicy::KeepDormant);
    store
        .apply(
            TAXON,
            experiment(1),
            &[link(1, 2, true), link(1, 3, true)],
            &tested(&[1, 2, 3]),
        )
        .expect("apply");
    let rows = store
        .inter_links_for_genes(TAXON, &[gene(1), gene(2)], 1)
        .expect("inter");
    // (1,2) in both directions; (1,3) excluded.
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .all(|l| l.first_gene != gene(3) && l.second_gene != gene(3)));
}

#[test]
fn gene_ids_lists_every_tested_gene() {
    let (_dir, store) = open_store(PrunePolicy::KeepDormant);
    store
        .apply(TAXON, experiment(1), &[link(1, 2, true)], &tested(&[1, 2, 9]))
        .expect("apply");
    assert_eq!(
        store.gene_ids(TAXON).expect("genes"),
        vec![gene(1), gene(2), gene(9)]
    );
    assert!(store.gene_ids(TaxonId::new(10090)).expect("genes").is_empty());
}

#[test]
fn node_degree_roundtrip_and_ranks() {
    let (_dir, store) = open_store(PrunePolicy::KeepDormant);
    let mut stats = NodeDegreeStats::new();
    stats.increment(1, Correlation::Positive);
    stats.increment(2, Correlation::Negative);
    store
        .upsert_node_degree(TAXON, gene(1), &stats)
        .expect("upsert");
    assert_eq!(
        store.node_degree(TAXON, gene(1)).expect("read"),
        Some(stats.clone())
    );

    let mut pos = BTreeMap::new();
    pos.insert(gene(1), vec![0.0, 1.0]);
    store
        .update_relative_ranks(TAXON, &pos, &BTreeMap::new())
        .expect("ranks");
    let read = store
        .node_degree(TAXON, gene(1))
        .expect("read")
        .expect("present");
    assert_eq!(read.relative_rank(1, Correlation::Positive), Some(1.0));

    let many = store.node_degrees(TAXON, &[gene(1), gene(2)]).expect("bulk");
    assert_eq!(many.len(), 1);
}
