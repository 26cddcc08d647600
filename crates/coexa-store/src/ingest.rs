use crate::{
    coexpressed_with, correlation_to_sql, experiment_to_sql, gene_to_sql, links, taxon_to_sql,
    tested_in, AppliedLinks, StoreError,
};
use coexa_model::{ExperimentId, GeneId, IdSet, TaxonId, UnorderedLink};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Bulk ingest of one experiment's complete link set.
///
/// Errors here would mean corrupt data, so everything runs in one
/// transaction: any invariant violation rolls the whole ingest back.
pub(crate) fn apply(
    conn: &mut Connection,
    taxon: TaxonId,
    experiment: ExperimentId,
    links_in: &[UnorderedLink],
    tested_genes: &BTreeSet<GeneId>,
) -> Result<AppliedLinks, StoreError> {
    if links_in.is_empty() {
        return Err(StoreError::InvalidArgument(
            "proposed link set is empty".to_string(),
        ));
    }

    let mut sorted = links_in.to_vec();
    sorted.sort();
    for pair in sorted.windows(2) {
        if pair[0] == pair[1] {
            return Err(StoreError::StateConflict(format!(
                "link {} appears more than once in the ingest batch",
                pair[0]
            )));
        }
    }

    let tx = conn.transaction()?;

    if links::count_experiment_links(&tx, taxon, experiment)? > 0 {
        return Err(StoreError::StateConflict(format!(
            "experiment {experiment} already has stored links; retract it before re-ingesting"
        )));
    }

    // Cheap existence pre-check: only pairs indexed in gene_coexpressed_with
    // can already have a row, so most new links skip the link-table lookup.
    let first_genes: Vec<GeneId> = sorted
        .iter()
        .map(UnorderedLink::first)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let known_partners = coexpressed_with::partners_for_genes(&tx, taxon, &first_genes)?;

    let mut result = AppliedLinks::default();
    // Keyed by forward link id so experiment-level rows go in id order.
    let mut touched: BTreeMap<i64, UnorderedLink> = BTreeMap::new();
    let mut deferred_mirrors: Vec<(UnorderedLink, i64)> = Vec::new();

    {
        let mut sel_link = tx.prepare(
            "SELECT id, support_details FROM gene_link
             WHERE taxon=?1 AND first_gene=?2 AND second_gene=?3 AND positive=?4",
        )?;
        let mut sel_details = tx.prepare("SELECT ids FROM support_details WHERE id=?1")?;
        let mut ins_details = tx.prepare(
            "INSERT INTO support_details (taxon, first_gene, second_gene, positive, ids)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        let mut ins_link = tx.prepare(
            "INSERT INTO gene_link (taxon, first_gene, second_gene, positive, support, support_details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        let mut upd_details = tx.prepare("UPDATE support_details SET ids=?1 WHERE id=?2")?;
        let mut upd_link = tx.prepare("UPDATE gene_link SET support=?1 WHERE id=?2")?;
        let mut upd_mirror = tx.prepare(
            "UPDATE gene_link SET support=?1
             WHERE taxon=?2 AND first_gene=?3 AND second_gene=?4 AND positive=?5",
        )?;

        for (n, link) in sorted.iter().enumerate() {
            let first = gene_to_sql(link.first());
            let second = gene_to_sql(link.second());
            let positive = correlation_to_sql(link.correlation());

            let may_exist = known_partners
                .get(&link.first())
                .is_some_and(|partners| partners.contains(link.second().as_u64()));
            let existing = if may_exist {
                sel_link
                    .query_row(params![taxon_to_sql(taxon), first, second, positive], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                    })
                    .optional()?
            } else {
                None
            };

            match existing {
                None => {
                    let mut ids = IdSet::new();
                    ids.insert(experiment.as_u64());
                    ins_details.execute(params![
                        taxon_to_sql(taxon),
                        first,
                        second,
                        positive,
                        ids.to_bytes()
                    ])?;
                    let details_id = tx.last_insert_rowid();
                    ins_link.execute(params![
                        taxon_to_sql(taxon),
                        first,
                        second,
                        positive,
                        1_i64,
                        details_id
                    ])?;
                    let link_id = tx.last_insert_rowid();
                    touched.insert(link_id, *link);
                    // Mirror rows are created in a batched pass, sorted by
                    // their own first gene, to keep the table clustered.
                    deferred_mirrors.push((*link, details_id));
                    result.created += 1;
                }
                Some((link_id, details_id)) => {
                    let bytes: Vec<u8> = sel_details.query_row([details_id], |row| row.get(0))?;
                    let mut ids = IdSet::from_bytes(&bytes)?;
                    if !ids.insert(experiment.as_u64()) {
                        return Err(StoreError::StateConflict(format!(
                            "experiment {experiment} already supports link {link}; retract it first"
                        )));
                    }
                    let support = ids.len() as i64;
                    upd_details.execute(params![ids.to_bytes(), details_id])?;
                    upd_link.execute(params![support, link_id])?;
                    // The mirror shares the same support_details row, which
                    // is already updated; only its denormalized count moves.
                    let mirrors = upd_mirror.execute(params![
                        support,
                        taxon_to_sql(taxon),
                        second,
                        first,
                        positive
                    ])?;
                    if mirrors != 1 {
                        return Err(StoreError::Corrupt(format!(
                            "expected exactly one mirror row for link {link}, found {mirrors}"
                        )));
                    }
                    touched.insert(link_id, *link);
                    result.updated += 1;
                }
            }

            result.affected_genes.insert(link.first());
            result.affected_genes.insert(link.second());

            if (n + 1) % 5000 == 0 {
                debug!(
                    processed = n + 1,
                    total = sorted.len(),
                    created = result.created,
                    updated = result.updated,
                    "gene-level link processing"
                );
            }
        }

        deferred_mirrors.sort_by_key(|(link, _)| link.second());
        for (link, details_id) in &deferred_mirrors {
            ins_link.execute(params![
                taxon_to_sql(taxon),
                gene_to_sql(link.second()),
                gene_to_sql(link.first()),
                correlation_to_sql(link.correlation()),
                1_i64,
                details_id
            ])?;
        }

        let mut ins_experiment_link = tx.prepare(
            "INSERT INTO experiment_link (taxon, experiment, link_id, first_gene, second_gene)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        let mut flipped: Vec<(i64, GeneId, GeneId)> = Vec::with_capacity(touched.len());
        for (link_id, link) in &touched {
            ins_experiment_link.execute(params![
                taxon_to_sql(taxon),
                experiment_to_sql(experiment),
                link_id,
                gene_to_sql(link.first()),
                gene_to_sql(link.second())
            ])?;
            // The flipped row reuses the forward link id on purpose: both
            // directions of the index must resolve to one gene-level link.
            flipped.push((*link_id, link.second(), link.first()));
        }
        flipped.sort_by_key(|(_, first, _)| *first);
        for (link_id, first, second) in &flipped {
            ins_experiment_link.execute(params![
                taxon_to_sql(taxon),
                experiment_to_sql(experiment),
                link_id,
                gene_to_sql(*first),
                gene_to_sql(*second)
            ])?;
        }
    }

    tested_in::add_experiment(&tx, taxon, experiment, tested_genes)?;
    coexpressed_with::add_partners(&tx, taxon, &sorted)?;

    tx.commit()?;

    info!(
        %experiment,
        created = result.created,
        updated = result.updated,
        genes = result.affected_genes.len(),
        "ingested coexpression links"
    );
    Ok(result)
}
