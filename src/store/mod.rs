//! Profile document store (Supabase in production, in-memory otherwise)

pub mod memory;
pub mod profiles;
pub mod supabase;

pub use memory::InMemoryProfileStore;
pub use profiles::{with_timeout, ProfileService, StoreError, SupabaseProfileStore, Wallet};
pub use supabase::SupabaseClient;
