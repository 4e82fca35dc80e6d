pub mod builders;

pub use builders::{GroupBuilder, UserBuilder};
