//! Uploaded images: index entries in the catalog database, bytes in the
//! object store.

pub mod derive;
pub mod store;

pub use derive::{CommandDeriver, ImageDeriver};
pub use store::ImageStore;
