pub mod fetcher;
pub mod pager;
pub mod resolver;
pub mod transport;
