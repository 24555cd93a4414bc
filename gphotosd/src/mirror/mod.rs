mod store;

pub use store::{
    CursorUpdate, MirrorError, MirrorStore, PageEffect, SearchQuery, SyncCursor, default_db_path,
};
