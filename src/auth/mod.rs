//! Session tokens. The request-level decision logic lives in
//! `middleware::auth`; this module only signs and verifies.

pub mod jwt;

pub use jwt::{extract_from_header, Claims, TokenClaims, TokenError, TokenPair, TokenService};
