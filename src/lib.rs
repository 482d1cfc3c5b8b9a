//! mergelink: data unification and synchronization core for a merge-request
//! / work-item dashboard.
//!
//! The crate fetches paginated data from two independent, rate-limited
//! external sources, caches raw and derived results across tiers with
//! cascading invalidation, heuristically associates merge requests with
//! tracked work items (with durable manual overrides), aggregates the result
//! into ticket groups with derived counts, and keeps everything fresh
//! through a prioritized background sync scheduler.
//!
//! The presentation layer consumes [`DashboardService`]; the HTTP layer is
//! injected as a [`remote::PageFetcher`] and durable override storage as an
//! [`overrides::OverrideStore`].

pub mod aggregate;
pub mod assoc;
pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod overrides;
pub mod remote;
pub mod sched;
pub mod service;

pub use aggregate::{GroupCriteria, MemberCriteria, TicketGroup};
pub use assoc::{AssociationCandidate, CandidateSource, EnrichedMergeRequest};
pub use config::Config;
pub use error::{FetchError, FetchResult};
pub use overrides::{MemoryOverrideStore, OverrideStore, SqliteOverrideStore};
pub use remote::{HttpFetcher, MergeRequest, PageFetcher, Source, WorkItem};
pub use sched::{ActiveContext, DataType};
pub use service::{DashboardService, GroupQuery};
