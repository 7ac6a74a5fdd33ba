mod repo;
pub use repo::*;

mod store;
pub use store::*;

mod session_store_mem;
pub use session_store_mem::*;

mod account_repo_mem;
pub use account_repo_mem::*;
