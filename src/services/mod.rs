pub mod cache;
pub mod gateway;
pub mod index;

pub use cache::{open_cache, EmbeddingCache, MemoryEmbeddingCache, SledEmbeddingCache};
pub use gateway::{EmbeddingGateway, HttpEmbeddingGateway};
pub use index::{MemorySimilarityIndex, SimilarityIndex};
