pub mod engine;

pub use engine::{
    score_entry, SearchEngine, SearchHit, SearchOptions, SearchResults, SortBy, SortOrder,
    DEFAULT_LIMIT, MAX_LIMIT,
};
