//! Extensions to standard library types.

pub mod ordered_map;
