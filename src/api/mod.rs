pub mod handlers;
pub mod middleware;
pub mod requests;
pub mod responses;
pub mod routes;
pub mod upstream;

pub use middleware::{CACHE_STATUS_HEADER, REPLAYED_HEADER};
pub use routes::{build_router, create_router, AppState};
pub use upstream::UpstreamClient;
