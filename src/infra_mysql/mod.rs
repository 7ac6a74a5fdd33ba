mod account_repo_mysql;
pub use account_repo_mysql::*;

mod session_store_mysql;
pub use session_store_mysql::*;

mod util;
