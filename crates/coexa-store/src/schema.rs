use crate::StoreError;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

/// All link kinds live in single tables with a taxon column; composite
/// indexes are led by taxon so per-taxon scans stay index-only.
///
/// Gene-level links are stored clustered by first gene: every logical link
/// has a forward and a mirror row sharing one support_details row, so "links
/// of gene X" is a single range scan on idx_gene_link_first.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS support_details (
  id INTEGER PRIMARY KEY,
  taxon INTEGER NOT NULL,
  first_gene INTEGER NOT NULL,
  second_gene INTEGER NOT NULL,
  positive INTEGER NOT NULL,
  ids BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS gene_link (
  id INTEGER PRIMARY KEY,
  taxon INTEGER NOT NULL,
  first_gene INTEGER NOT NULL,
  second_gene INTEGER NOT NULL,
  positive INTEGER NOT NULL,
  support INTEGER NOT NULL,
  support_details INTEGER NOT NULL REFERENCES support_details(id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_gene_link_pair
  ON gene_link(taxon, first_gene, second_gene, positive);
CREATE INDEX IF NOT EXISTS idx_gene_link_first
  ON gene_link(taxon, first_gene, support);
CREATE INDEX IF NOT EXISTS idx_gene_link_details
  ON gene_link(support_details);
CREATE TABLE IF NOT EXISTS experiment_link (
  id INTEGER PRIMARY KEY,
  taxon INTEGER NOT NULL,
  experiment INTEGER NOT NULL,
  link_id INTEGER NOT NULL,
  first_gene INTEGER NOT NULL,
  second_gene INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_experiment_link_exp_first
  ON experiment_link(taxon, experiment, first_gene, second_gene);
CREATE INDEX IF NOT EXISTS idx_experiment_link_link
  ON experiment_link(link_id);
CREATE TABLE IF NOT EXISTS gene_tested_in (
  gene INTEGER PRIMARY KEY,
  taxon INTEGER NOT NULL,
  ids BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_gene_tested_in_taxon
  ON gene_tested_in(taxon);
CREATE TABLE IF NOT EXISTS gene_coexpressed_with (
  gene INTEGER PRIMARY KEY,
  taxon INTEGER NOT NULL,
  ids BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS node_degree (
  gene INTEGER PRIMARY KEY,
  taxon INTEGER NOT NULL,
  stats TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_node_degree_taxon
  ON node_degree(taxon);
";

pub fn initialize(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(&format!("PRAGMA user_version={SCHEMA_VERSION};"))?;
    Ok(())
}
