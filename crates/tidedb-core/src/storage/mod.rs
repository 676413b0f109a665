//! Page store: the `.db` file, cached pages, data page layout, free-space index.

pub mod file;
pub mod freelist;
pub mod header;
pub mod lock;
pub mod page;
pub mod page_cache;
