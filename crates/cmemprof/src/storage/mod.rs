mod schema;
mod writer;

pub use schema::{FORMAT_NAME, SCHEMA_VERSION, get_meta};
pub use writer::{
    HeapEntry, ProfileSummary, Storage, Totals, open_profile, query_callsite_frames,
    query_summary, query_top_heap, query_totals,
};
