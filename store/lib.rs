#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod config;
pub mod error;
pub mod gz;
pub mod ld;
pub mod mapped;
pub mod types;
pub mod variant_index;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod shared {
    pub use super::shared_files as files;
}

pub use config::StoreConfig;
pub use error::{LdError, Result};
pub use ld::{LdComputer, LdMatrixReader, LdMatrixWriter, ReaderOptions};
pub use variant_index::VariantIndex;
