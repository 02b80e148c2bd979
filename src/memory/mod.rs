pub(crate) mod arena;
pub(crate) mod bin;
pub(crate) mod binned;
pub(crate) mod bitmap;
pub(crate) mod registry;
pub(crate) mod stats;
pub(crate) mod vm;
