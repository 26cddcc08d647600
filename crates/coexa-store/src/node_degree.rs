use crate::{gene_from_sql, gene_to_sql, placeholders, taxon_to_sql, StoreError, SET_BATCH};
use coexa_model::{Correlation, GeneId, NodeDegreeStats, TaxonId};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

pub(crate) fn node_degree(
    conn: &Connection,
    taxon: TaxonId,
    gene: GeneId,
) -> Result<Option<NodeDegreeStats>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT stats FROM node_degree WHERE taxon=?1 AND gene=?2",
            params![taxon_to_sql(taxon), gene_to_sql(gene)],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|s| decode_stats(gene, &s)).transpose()
}

pub(crate) fn node_degrees(
    conn: &Connection,
    taxon: TaxonId,
    genes: &[GeneId],
) -> Result<HashMap<GeneId, NodeDegreeStats>, StoreError> {
    let mut out = HashMap::with_capacity(genes.len());
    for chunk in genes.chunks(SET_BATCH) {
        let sql = format!(
            "SELECT gene, stats FROM node_degree WHERE taxon=?1 AND gene IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<i64> = vec![taxon_to_sql(taxon)];
        values.extend(chunk.iter().map(|g| gene_to_sql(*g)));
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (gene_raw, raw) = row?;
            let gene = gene_from_sql(gene_raw);
            out.insert(gene, decode_stats(gene, &raw)?);
        }
    }
    Ok(out)
}

pub(crate) fn upsert_node_degree(
    conn: &Connection,
    taxon: TaxonId,
    gene: GeneId,
    stats: &NodeDegreeStats,
) -> Result<(), StoreError> {
    let encoded = serde_json::to_string(stats).map_err(|e| StoreError::Storage(e.to_string()))?;
    conn.execute(
        "INSERT INTO node_degree (gene, taxon, stats) VALUES (?1, ?2, ?3)
         ON CONFLICT(gene) DO UPDATE SET taxon=excluded.taxon, stats=excluded.stats",
        params![gene_to_sql(gene), taxon_to_sql(taxon), encoded],
    )?;
    Ok(())
}

/// Second phase of the maintenance job: write the relative rank vectors back
/// into the stored statistics. A gene missing its histogram row is logged and
/// skipped, like any other per-gene maintenance failure.
pub(crate) fn update_relative_ranks(
    conn: &mut Connection,
    taxon: TaxonId,
    pos: &BTreeMap<GeneId, Vec<f64>>,
    neg: &BTreeMap<GeneId, Vec<f64>>,
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    {
        let mut genes: Vec<GeneId> = pos.keys().copied().collect();
        genes.extend(neg.keys().copied());
        genes.sort_unstable();
        genes.dedup();

        let mut upd = tx.prepare("UPDATE node_degree SET stats=?1 WHERE taxon=?2 AND gene=?3")?;
        for gene in genes {
            let Some(mut stats) = node_degree(&tx, taxon, gene)? else {
                warn!(%gene, "no node-degree row while writing relative ranks; skipping");
                continue;
            };
            if let Some(ranks) = pos.get(&gene) {
                stats.set_relative_ranks(Correlation::Positive, ranks.clone());
            }
            if let Some(ranks) = neg.get(&gene) {
                stats.set_relative_ranks(Correlation::Negative, ranks.clone());
            }
            let encoded =
                serde_json::to_string(&stats).map_err(|e| StoreError::Storage(e.to_string()))?;
            upd.execute(params![encoded, taxon_to_sql(taxon), gene_to_sql(gene)])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn decode_stats(gene: GeneId, raw: &str) -> Result<NodeDegreeStats, StoreError> {
    serde_json::from_str(raw).map_err(|e| {
        StoreError::Corrupt(format!("undecodable node-degree statistics for gene {gene}: {e}"))
    })
}
