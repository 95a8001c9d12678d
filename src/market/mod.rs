pub mod countdown;
pub mod feed;
pub mod lru;
pub mod merge;
pub mod mock;
pub mod pipeline;
pub mod push;
pub mod range;
pub mod range_key;
pub mod rest;
pub mod types;
