use crate::{
    experiment_to_sql, gene_from_sql, gene_to_sql, placeholders, taxon_to_sql, StoreError,
    EXPERIMENT_BATCH, GENE_BATCH, LINK_ID_BATCH, SET_BATCH, SUPPORT_BATCH,
};
use coexa_model::{Correlation, ExperimentId, GeneId, IdSet, TaxonId};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{BTreeSet, HashMap};

/// A gene-level link row as stored, one direction, with its support set
/// hydrated from the shared support_details row.
#[derive(Debug, Clone)]
pub struct RawLink {
    pub link_id: i64,
    pub first_gene: GeneId,
    pub second_gene: GeneId,
    pub correlation: Correlation,
    pub support: u64,
    pub support_ids: IdSet,
}

/// One experiment-index entry; `link_id` always names the forward gene-link
/// row, whichever direction this entry is.
#[derive(Debug, Clone, Copy)]
pub struct ExperimentLinkRow {
    pub experiment: ExperimentId,
    pub link_id: i64,
    pub first_gene: GeneId,
    pub second_gene: GeneId,
}

struct PartialLink {
    link_id: i64,
    first_gene: GeneId,
    second_gene: GeneId,
    correlation: Correlation,
    support: u64,
    details_id: i64,
}

pub(crate) fn count_experiment_links(
    conn: &Connection,
    taxon: TaxonId,
    experiment: ExperimentId,
) -> Result<u64, StoreError> {
    let raw: i64 = conn.query_row(
        "SELECT COUNT(*) FROM experiment_link WHERE taxon=?1 AND experiment=?2",
        params![taxon_to_sql(taxon), experiment_to_sql(experiment)],
        |row| row.get(0),
    )?;
    if raw % 2 != 0 {
        return Err(StoreError::Corrupt(format!(
            "experiment {experiment} has {raw} experiment-link rows; they must come in mirrored pairs"
        )));
    }
    Ok((raw / 2) as u64)
}

pub(crate) fn count_experiment_links_for_gene(
    conn: &Connection,
    taxon: TaxonId,
    gene: GeneId,
    experiment: ExperimentId,
) -> Result<u64, StoreError> {
    // One direction only, so mirrored storage does not double-count.
    let raw: i64 = conn.query_row(
        "SELECT COUNT(*) FROM experiment_link
         WHERE taxon=?1 AND experiment=?2 AND first_gene=?3",
        params![
            taxon_to_sql(taxon),
            experiment_to_sql(experiment),
            gene_to_sql(gene)
        ],
        |row| row.get(0),
    )?;
    Ok(raw as u64)
}

pub(crate) fn links_for_genes(
    conn: &Connection,
    taxon: TaxonId,
    genes: &[GeneId],
    min_support: u64,
) -> Result<Vec<RawLink>, StoreError> {
    let mut partials = Vec::new();
    for chunk in genes.chunks(GENE_BATCH) {
        let sql = format!(
            "SELECT id, first_gene, second_gene, positive, support, support_details
             FROM gene_link
             WHERE taxon=?1 AND support>=?2 AND first_gene IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<i64> = vec![taxon_to_sql(taxon), min_support.max(1) as i64];
        values.extend(chunk.iter().map(|g| gene_to_sql(*g)));
        let rows = stmt.query_map(params_from_iter(values.iter()), map_partial)?;
        partials.extend(rows.collect::<Result<Vec<_>, _>>()?);
    }
    hydrate_support(conn, partials)
}

pub(crate) fn inter_links_for_genes(
    conn: &Connection,
    taxon: TaxonId,
    genes: &[GeneId],
    min_support: u64,
) -> Result<Vec<RawLink>, StoreError> {
    let gene_values: Vec<i64> = genes.iter().map(|g| gene_to_sql(*g)).collect();
    let mut partials = Vec::new();
    for chunk in genes.chunks(GENE_BATCH) {
        let sql = format!(
            "SELECT id, first_gene, second_gene, positive, support, support_details
             FROM gene_link
             WHERE taxon=?1 AND support>=?2 AND first_gene IN ({}) AND second_gene IN ({})",
            placeholders(chunk.len()),
            placeholders(gene_values.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<i64> = vec![taxon_to_sql(taxon), min_support.max(1) as i64];
        values.extend(chunk.iter().map(|g| gene_to_sql(*g)));
        values.extend(gene_values.iter().copied());
        let rows = stmt.query_map(params_from_iter(values.iter()), map_partial)?;
        partials.extend(rows.collect::<Result<Vec<_>, _>>()?);
    }
    hydrate_support(conn, partials)
}

pub(crate) fn experiment_links_for_genes(
    conn: &Connection,
    taxon: TaxonId,
    experiments: &[ExperimentId],
    genes: &[GeneId],
) -> Result<Vec<ExperimentLinkRow>, StoreError> {
    let mut out = Vec::new();
    for experiment_chunk in experiments.chunks(EXPERIMENT_BATCH) {
        for gene_chunk in genes.chunks(SET_BATCH) {
            let sql = format!(
                "SELECT experiment, link_id, first_gene, second_gene
                 FROM experiment_link
                 WHERE taxon=?1 AND experiment IN ({}) AND first_gene IN ({})",
                placeholders(experiment_chunk.len()),
                placeholders(gene_chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<i64> = vec![taxon_to_sql(taxon)];
            values.extend(experiment_chunk.iter().map(|e| experiment_to_sql(*e)));
            values.extend(gene_chunk.iter().map(|g| gene_to_sql(*g)));
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
                Ok(ExperimentLinkRow {
                    experiment: ExperimentId::new(row.get::<_, i64>(0)? as u64),
                    link_id: row.get(1)?,
                    first_gene: gene_from_sql(row.get(2)?),
                    second_gene: gene_from_sql(row.get(3)?),
                })
            })?;
            out.extend(rows.collect::<Result<Vec<_>, _>>()?);
        }
    }
    Ok(out)
}

pub(crate) fn link_ids_for_experiments(
    conn: &Connection,
    taxon: TaxonId,
    experiments: &[ExperimentId],
) -> Result<Vec<i64>, StoreError> {
    let mut ids = BTreeSet::new();
    for chunk in experiments.chunks(EXPERIMENT_BATCH) {
        let sql = format!(
            "SELECT DISTINCT link_id FROM experiment_link
             WHERE taxon=?1 AND experiment IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<i64> = vec![taxon_to_sql(taxon)];
        values.extend(chunk.iter().map(|e| experiment_to_sql(*e)));
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get(0))?;
        for id in rows {
            ids.insert(id?);
        }
    }
    Ok(ids.into_iter().collect())
}

pub(crate) fn inter_link_ids_for_experiments(
    conn: &Connection,
    taxon: TaxonId,
    experiments: &[ExperimentId],
    genes: &[GeneId],
) -> Result<Vec<i64>, StoreError> {
    let gene_values: Vec<i64> = genes.iter().map(|g| gene_to_sql(*g)).collect();
    let mut ids = BTreeSet::new();
    for chunk in experiments.chunks(EXPERIMENT_BATCH) {
        let sql = format!(
            "SELECT DISTINCT link_id FROM experiment_link
             WHERE taxon=?1 AND experiment IN ({}) AND first_gene IN ({}) AND second_gene IN ({})",
            placeholders(chunk.len()),
            placeholders(gene_values.len()),
            placeholders(gene_values.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<i64> = vec![taxon_to_sql(taxon)];
        values.extend(chunk.iter().map(|e| experiment_to_sql(*e)));
        values.extend(gene_values.iter().copied());
        values.extend(gene_values.iter().copied());
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get(0))?;
        for id in rows {
            ids.insert(id?);
        }
    }
    Ok(ids.into_iter().collect())
}

pub(crate) fn load_links(
    conn: &Connection,
    taxon: TaxonId,
    link_ids: &[i64],
) -> Result<Vec<RawLink>, StoreError> {
    let mut sorted = link_ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut partials = Vec::new();
    for chunk in sorted.chunks(LINK_ID_BATCH) {
        let sql = format!(
            "SELECT id, first_gene, second_gene, positive, support, support_details
             FROM gene_link
             WHERE taxon=?1 AND support>0 AND id IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut values: Vec<i64> = vec![taxon_to_sql(taxon)];
        values.extend(chunk.iter().copied());
        let rows = stmt.query_map(params_from_iter(values.iter()), map_partial)?;
        partials.extend(rows.collect::<Result<Vec<_>, _>>()?);
    }
    hydrate_support(conn, partials)
}

fn map_partial(row: &rusqlite::Row<'_>) -> rusqlite::Result<PartialLink> {
    Ok(PartialLink {
        link_id: row.get(0)?,
        first_gene: gene_from_sql(row.get(1)?),
        second_gene: gene_from_sql(row.get(2)?),
        correlation: Correlation::from_positive(row.get::<_, i64>(3)? != 0),
        support: row.get::<_, i64>(4)? as u64,
        details_id: row.get(5)?,
    })
}

/// Fetch the shared support sets for a batch of link rows in a second pass,
/// instead of joining; verifies the denormalized count against the set.
fn hydrate_support(
    conn: &Connection,
    partials: Vec<PartialLink>,
) -> Result<Vec<RawLink>, StoreError> {
    if partials.is_empty() {
        return Ok(Vec::new());
    }

    let mut details_ids: Vec<i64> = partials.iter().map(|p| p.details_id).collect();
    details_ids.sort_unstable();
    details_ids.dedup();

    let mut details: HashMap<i64, IdSet> = HashMap::with_capacity(details_ids.len());
    for chunk in details_ids.chunks(SUPPORT_BATCH) {
        let sql = format!(
            "SELECT id, ids FROM support_details WHERE id IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (id, bytes) = row?;
            details.insert(id, IdSet::from_bytes(&bytes)?);
        }
    }

    let mut out = Vec::with_capacity(partials.len());
    for partial in partials {
        let support_ids = details.get(&partial.details_id).cloned().ok_or_else(|| {
            StoreError::Corrupt(format!(
                "gene-link row {} references missing support details {}",
                partial.link_id, partial.details_id
            ))
        })?;
        if support_ids.len() as u64 != partial.support {
            return Err(StoreError::Corrupt(format!(
                "gene-link row {} has denormalized support {} but its support set holds {} ids",
                partial.link_id,
                partial.support,
                support_ids.len()
            )));
        }
        out.push(RawLink {
            link_id: partial.link_id,
            first_gene: partial.first_gene,
            second_gene: partial.second_gene,
            correlation: partial.correlation,
            support: partial.support,
            support_ids,
        });
    }
    Ok(out)
}
