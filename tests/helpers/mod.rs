pub mod app;
pub mod builders;
pub mod db;

pub use app::TestApp;
pub use builders::{FarmerBuilder, FieldBuilder, UserBuilder};
pub use db::{grant_consent, TestDb};
