/// Router Module Index
///
/// Routes are split by access level so the authentication and admin layers
/// are applied per module rather than per handler.

/// Unauthenticated routes: health check and token issuance.
pub mod public;

/// Routes behind the `AuthUser` extractor: reads, plus the self-or-admin user endpoints.
pub mod authenticated;

/// Write routes restricted to admin roles.
pub mod admin;
