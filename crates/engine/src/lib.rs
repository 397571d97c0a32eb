pub mod dispatcher;
pub mod memory;
pub mod registry;
pub mod store;
pub mod testing;
pub mod transformer;
