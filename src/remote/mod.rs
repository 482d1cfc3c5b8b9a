//! The two external sources: typed records, the page-fetch collaborator
//! trait, its default HTTP implementation, and the caching/retrying fetch
//! client built on top.

mod client;
mod fetch;
mod http;
mod types;

pub use client::{Page, PageFetcher};
pub use fetch::FetchClient;
pub use http::HttpFetcher;
pub use types::{MergeRequest, MergeRequestState, Source, WorkItem, WorkItemState};
