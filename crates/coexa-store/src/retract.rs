use crate::{
    coexpressed_with, experiment_to_sql, gene_from_sql, placeholders, taxon_to_sql, tested_in,
    PrunePolicy, RetractOutcome, StoreError, LINK_ID_BATCH,
};
use coexa_model::{Correlation, ExperimentId, IdSet, TaxonId, UnorderedLink};
use rusqlite::{params, params_from_iter, Connection};
use tracing::info;

/// Remove one experiment's support from every link it contributed to, then
/// strip it from every gene's tested-in set. All-or-nothing, like ingest.
pub(crate) fn retract(
    conn: &mut Connection,
    policy: PrunePolicy,
    taxon: TaxonId,
    experiment: ExperimentId,
) -> Result<RetractOutcome, StoreError> {
    let tx = conn.transaction()?;
    let mut result = RetractOutcome::default();

    let link_ids: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT DISTINCT link_id FROM experiment_link WHERE taxon=?1 AND experiment=?2",
        )?;
        let rows = stmt.query_map(
            params![taxon_to_sql(taxon), experiment_to_sql(experiment)],
            |row| row.get(0),
        )?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    // Even with no links, the tested-in information may still be present.
    if !link_ids.is_empty() {
        let mut details_ids: Vec<i64> = Vec::new();
        for chunk in link_ids.chunks(LINK_ID_BATCH) {
            let sql = format!(
                "SELECT DISTINCT support_details FROM gene_link WHERE id IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get(0))?;
            details_ids.extend(rows.collect::<Result<Vec<i64>, _>>()?);
        }
        details_ids.sort_unstable();
        details_ids.dedup();

        let mut pruned_pairs: Vec<UnorderedLink> = Vec::new();
        {
            let mut sel_details = tx.prepare(
                "SELECT ids, first_gene, second_gene, positive FROM support_details WHERE id=?1",
            )?;
            let mut upd_details = tx.prepare("UPDATE support_details SET ids=?1 WHERE id=?2")?;
            let mut upd_links =
                tx.prepare("UPDATE gene_link SET support=?1 WHERE support_details=?2")?;
            let mut del_links = tx.prepare("DELETE FROM gene_link WHERE support_details=?1")?;
            let mut del_details = tx.prepare("DELETE FROM support_details WHERE id=?1")?;

            for details_id in &details_ids {
                let (bytes, first_raw, second_raw, positive): (Vec<u8>, i64, i64, i64) =
                    sel_details.query_row([details_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?;
                let link = UnorderedLink::new(
                    gene_from_sql(first_raw),
                    gene_from_sql(second_raw),
                    Correlation::from_positive(positive != 0),
                )
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;

                // Both directional rows share this one support set; remove
                // the experiment once, not once per direction.
                let mut ids = IdSet::from_bytes(&bytes)?;
                if !ids.remove(experiment.as_u64()) {
                    return Err(StoreError::Corrupt(format!(
                        "experiment {experiment} is indexed against link {link} but absent from its support set"
                    )));
                }
                let support = ids.len() as i64;

                result.affected_genes.insert(link.first());
                result.affected_genes.insert(link.second());

                if support == 0 && policy == PrunePolicy::DeleteOrphans {
                    let removed = del_links.execute([details_id])?;
                    if removed != 2 {
                        return Err(StoreError::Corrupt(format!(
                            "expected two directional rows for link {link}, deleted {removed}"
                        )));
                    }
                    del_details.execute([details_id])?;
                    pruned_pairs.push(link);
                    result.pruned += 1;
                } else {
                    upd_details.execute(params![ids.to_bytes(), details_id])?;
                    let updated = upd_links.execute(params![support, details_id])?;
                    if updated != 2 {
                        return Err(StoreError::Corrupt(format!(
                            "expected two directional rows for link {link}, updated {updated}"
                        )));
                    }
                    result.adjusted += 1;
                }
            }
        }

        let deleted = tx.execute(
            "DELETE FROM experiment_link WHERE taxon=?1 AND experiment=?2",
            params![taxon_to_sql(taxon), experiment_to_sql(experiment)],
        )?;
        info!(%experiment, deleted, "removed experiment-level links");

        coexpressed_with::remove_partners(&tx, taxon, &pruned_pairs)?;
    }

    // Which genes were tested is not indexed by experiment, so this is a
    // full per-taxon scan.
    tested_in::remove_experiment(&tx, taxon, experiment)?;

    tx.commit()?;

    info!(
        %experiment,
        adjusted = result.adjusted,
        pruned = result.pruned,
        "retracted coexpression links"
    );
    Ok(result)
}
