pub mod list;
pub mod query;
pub mod record;
pub mod top;
