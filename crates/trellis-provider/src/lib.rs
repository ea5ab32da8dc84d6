pub mod extract;
pub mod loop_guard;
pub mod runtime;
pub mod schema_compat;

pub use extract::*;
pub use loop_guard::*;
pub use runtime::*;
pub use schema_compat::*;
