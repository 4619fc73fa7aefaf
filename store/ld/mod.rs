pub mod compute;
pub mod format;
pub mod prune;
pub mod reader;
pub mod writer;

pub use compute::{CancellationToken, ComputeSummary, LdComputer, VariantDosages};
pub use prune::{prune, prune_groups};
pub use reader::{LdMatrixReader, MatrixSummary, R2Map, ReaderOptions};
pub use writer::{LdMatrixWriter, WriteSummary};
