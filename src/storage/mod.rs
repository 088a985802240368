mod slot;
mod store;

pub use slot::StateSlot;
pub use store::StateStore;
