pub mod amas;

pub use amas::{PgAmasRepository, PgDecisionStore};
