//! Authentication: JWT bearer tokens with a role claim.

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{require_admin, require_auth, AuthUser};
