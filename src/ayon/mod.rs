//! AYON server endpoints on top of the cache layer.

pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
pub mod endpoints;
pub mod types;

pub use cached_client::{AyonCache, FeedQuery};
pub use client::{Backend, RestClient};
pub use endpoints::{register, DEFAULT_ACTIVITY_FILTERS};
pub use types::{
  Activity, ActivityFeed, ActivityPatch, AyonData, Bundle, EntityDetails, PageInfo, Project,
};
