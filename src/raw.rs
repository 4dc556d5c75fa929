//! Access to the raw handles behind typed objects
//!
//! Typed wrappers such as [`Request`](../request/struct.Request.html) own a raw handle.  `AsRaw`
//! exposes it, for example to interleave typed and raw completion calls.

/// Raw handle access
pub mod traits {
    pub use super::AsRaw;
}

/// A typed object that wraps a raw handle.
pub trait AsRaw {
    /// The raw handle type
    type Raw;
    /// The raw value, still owned by `self`.
    fn as_raw(&self) -> Self::Raw;
}
