/// Database access layer
///
/// This module provides the Job Store: free functions over `&PgPool`
/// grouped by domain object, one function per query.
pub mod job_repo;
