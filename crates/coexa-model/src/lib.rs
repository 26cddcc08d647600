#![forbid(unsafe_code)]

pub const CRATE_NAME: &str = "coexa-model";

mod id_set;
mod ids;
mod link;
mod node_degree;
mod result;

pub use id_set::{IdSet, IdSetDecodeError};
pub use ids::{ExperimentId, GeneId, TaxonId};
pub use link::{Correlation, LinkError, UnorderedLink};
pub use node_degree::NodeDegreeStats;
pub use result::LinkResult;
