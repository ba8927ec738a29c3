pub mod artifacts;
pub mod ledger;

pub use artifacts::{canonical_json, content_hash, ArtifactFormat, ArtifactStore, ArtifactUri};
pub use ledger::{Ledger, NodeUpdate};
