pub mod local;
pub mod qdrant;

pub use local::LocalFileIndex;
pub use qdrant::QdrantIndex;
