use crate::{gene_from_sql, gene_to_sql, placeholders, taxon_to_sql, StoreError, SET_BATCH};
use coexa_model::{GeneId, IdSet, TaxonId, UnorderedLink};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// The quick index: which other genes a gene has any recorded link with.
/// Consulted before writes so bulk ingest can skip the link-table lookup for
/// pairs that cannot exist yet.
pub(crate) fn partners_for_genes(
    conn: &Connection,
    taxon: TaxonId,
    genes: &[GeneId],
) -> Result<HashMap<GeneId, IdSet>, StoreError> {
    let mut out = HashMap::with_capacity(genes.len());
    for chunk in genes.chunks(SET_BATCH) {
        let sql = format!(
            "SELECT gene, ids FROM gene_coexpressed_with WHERE taxon=?1 AND gene IN ({})",
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

fn links_to_partner_map(links: &[UnorderedLink]) -> BTreeMap<GeneId, BTreeSet<GeneId>> {
    let mut map: BTreeMap<GeneId, BTreeSet<GeneId>> = BTreeMap::new();
    for link in links {
        map.entry(link.first()).or_default().insert(link.second());
        map.entry(link.second()).or_default().insert(link.first());
    }
    map
}

pub(crate) fn add_partners(
    conn: &Connection,
    taxon: TaxonId,
    links: &[UnorderedLink],
) -> Result<(), StoreError> {
    let map = links_to_partner_map(links);
    let genes: Vec<GeneId> = map.keys().copied().collect();
    let existing = partners_for_genes(conn, taxon, &genes)?;

    let mut upd = conn.prepare("UPDATE gene_coexpressed_with SET ids=?1 WHERE gene=?2")?;
    let mut ins =
        conn.prepare("INSERT INTO gene_coexpressed_with (gene, taxon, ids) VALUES (?1, ?2, ?3)")?;

    for (gene, partners) in &map {
        match existing.get(gene) {
            Some(ids) => {
                let mut ids = ids.clone();
                let mut changed = false;
                for partner in partners {
                    changed |= ids.insert(partner.as_u64());
                }
                if changed {
                    upd.execute(params![ids.to_bytes(), gene_to_sql(*gene)])?;
                }
            }
            None => {
                let ids: IdSet = partners.iter().map(|p| p.as_u64()).collect();
                ins.execute(params![
                    gene_to_sql(*gene),
                    taxon_to_sql(taxon),
                    ids.to_bytes()
                ])?;
            }
        }
    }
    Ok(())
}

/// Called only when links are actually deleted (prune policy); dormant links
/// stay in the quick index so the existence pre-check keeps finding them.
/// A partner is dropped only once no link of either sign remains between the
/// pair, since the index is sign-less.
pub(crate) fn remove_partners(
    conn: &Connection,
    taxon: TaxonId,
    links: &[UnorderedLink],
) -> Result<(), StoreError> {
    if links.is_empty() {
        return Ok(());
    }
    let mut sel_pair = conn.prepare(
        "SELECT COUNT(*) FROM gene_link WHERE taxon=?1 AND first_gene=?2 AND second_gene=?3",
    )?;
    let mut dead_pairs: Vec<UnorderedLink> = Vec::new();
    for link in links {
        let remaining: i64 = sel_pair.query_row(
            params![
                taxon_to_sql(taxon),
                gene_to_sql(link.first()),
                gene_to_sql(link.second())
            ],
            |row| row.get(0),
        )?;
        if remaining == 0 {
            dead_pairs.push(*link);
        }
    }
    if dead_pairs.is_empty() {
        return Ok(());
    }
    let links = dead_pairs.as_slice();
    let map = links_to_partner_map(links);
    let genes: Vec<GeneId> = map.keys().copied().collect();
    let existing = partners_for_genes(conn, taxon, &genes)?;

    let mut upd = conn.prepare("UPDATE gene_coexpressed_with SET ids=?1 WHERE gene=?2")?;
    for (gene, partners) in &map {
        if let Some(ids) = existing.get(gene) {
            let mut ids = ids.clone();
            let mut changed = false;
            for partner in partners {
                changed |= ids.remove(partner.as_u64());
            }
            if changed {
                upd.execute(params![ids.to_bytes(), gene_to_sql(*gene)])?;
            }
        }
    }
    Ok(())
}
