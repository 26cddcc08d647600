use crate::{
    experiment_to_sql, gene_from_sql, gene_to_sql, placeholders, taxon_to_sql, StoreError,
    SET_BATCH,
};
use coexa_model::{ExperimentId, GeneId, IdSet, TaxonId};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{BTreeSet, HashMap};
use tracing::info;

pub(crate) fn tested_in_for_genes(
    conn: &Connection,
    taxon: TaxonId,
    genes: &[GeneId],
) -> Result<HashMap<GeneId, IdSet>, StoreError> {
    let mut out = HashMap::with_capacity(genes.len());
    for chunk in genes.chunks(SET_BATCH) {
        let sql = format!(
            "SELECT gene, ids FROM gene_tested_in WHERE taxon=?1 AND gene IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<i64> = vec![taxon_to_sql(taxon)];
        values.extend(chunk.iter().map(|g| gene_to_sql(*g)));
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (gene, bytes) = row?;
            out.insert(gene_from_sql(gene), IdSet::from_bytes(&bytes)?);
        }
    }
    Ok(out)
}

pub(crate) fn gene_ids_for_taxon(
    conn: &Connection,
    taxon: TaxonId,
) -> Result<Vec<GeneId>, StoreError> {
    let mut stmt = conn.prepare("SELECT gene FROM gene_tested_in WHERE taxon=?1 ORDER BY gene")?;
    let rows = stmt.query_map([taxon_to_sql(taxon)], |row| row.get::<_, i64>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(gene_from_sql(row?));
    }
    Ok(out)
}

/// Mark every tested gene as analyzed in the experiment: update existing
/// rows, create rows for genes never seen before.
pub(crate) fn add_experiment(
    conn: &Connection,
    taxon: TaxonId,
    experiment: ExperimentId,
    genes: &BTreeSet<GeneId>,
) -> Result<(), StoreError> {
    if genes.is_empty() {
        return Ok(());
    }
    let gene_list: Vec<GeneId> = genes.iter().copied().collect();
    let existing = tested_in_for_genes(conn, taxon, &gene_list)?;

    let mut upd = conn.prepare("UPDATE gene_tested_in SET ids=?1 WHERE gene=?2")?;
    let mut ins =
        conn.prepare("INSERT INTO gene_tested_in (gene, taxon, ids) VALUES (?1, ?2, ?3)")?;

    let mut updated = 0usize;
    let mut created = 0usize;
    for gene in &gene_list {
        match existing.get(gene) {
            Some(ids) => {
                let mut ids = ids.clone();
                if ids.insert(experiment.as_u64()) {
                    upd.execute(params![ids.to_bytes(), gene_to_sql(*gene)])?;
                    updated += 1;
                }
            }
            None => {
                let mut ids = IdSet::new();
                ids.insert(experiment.as_u64());
                ins.execute(params![
                    gene_to_sql(*gene),
                    taxon_to_sql(taxon),
                    ids.to_bytes()
                ])?;
                created += 1;
            }
        }
    }
    info!(%experiment, updated, created, "updated tested-in information");
    Ok(())
}

/// Which genes were tested is not indexed by experiment, so retract walks
/// every gene of the taxon.
pub(crate) fn remove_experiment(
    conn: &Connection,
    taxon: TaxonId,
    experiment: ExperimentId,
) -> Result<(), StoreError> {
    let rows: Vec<(i64, Vec<u8>)> = {
        let mut stmt = conn.prepare("SELECT gene, ids FROM gene_tested_in WHERE taxon=?1")?;
        let mapped = stmt.query_map([taxon_to_sql(taxon)], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        mapped.collect::<Result<Vec<_>, _>>()?
    };

    let mut upd = conn.prepare("UPDATE gene_tested_in SET ids=?1 WHERE gene=?2")?;
    let mut touched = 0usize;
    for (gene, bytes) in rows {
        let mut ids = IdSet::from_bytes(&bytes)?;
        if ids.remove(experiment.as_u64()) {
            upd.execute(params![ids.to_bytes(), gene])?;
            touched += 1;
        }
    }
    info!(%experiment, touched, "removed tested-in information");
    Ok(())
}
