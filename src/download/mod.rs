// Sub-resource pre-fetching.

pub mod fetcher;
pub mod task;

pub use fetcher::{FetcherOptions, SubResourceFetcher};
pub use task::{DownloadCallback, DownloadState, DownloadTask};
