pub mod arbiter;
pub mod clock;
pub mod controller;
pub mod local_cache;
pub mod locks;
pub mod normalizer;
pub mod pending;
pub mod planes;
pub mod queue;
pub mod reconciler;
pub mod store;
pub mod supabase_store;
pub mod sync;

pub use arbiter::*;
pub use clock::*;
pub use controller::*;
pub use local_cache::*;
pub use locks::BookingLocks;
pub use pending::*;
pub use planes::*;
pub use queue::*;
pub use store::*;
pub use supabase_store::*;
pub use sync::*;
