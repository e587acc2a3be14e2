mod repo;
mod schema;

pub use repo::{AuthRepo, SessionInfo, ShareTokenInfo, UserInfo};
pub use schema::init_database;
