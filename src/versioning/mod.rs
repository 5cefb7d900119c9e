//! Version field access for documents stored in a [`crate::docstore::VersionedStore`].
//!
//! The original engine locates a document's version counter by reflecting
//! over field metadata at store-construction time. Rust has no runtime
//! reflection over arbitrary struct fields, so this crate realizes the same
//! contract as a capability trait: any document type that wants to live in a
//! [`crate::docstore::VersionedStore`] implements [`Versioned`], either by
//! hand or via [`derive_versioned`].

/// A document type whose version counter can be read, written, and named.
///
/// `VERSION_FIELD` is the storage-visible name used as the path component in
/// generated patches (`set`/`inc` targets), mirroring the original's
/// "read the field's storage-name annotation, else lowercase the struct
/// field name" resolution rule — done at compile time via the derive macro
/// instead of at store construction.
pub trait Versioned {
    /// The storage-visible name of the version field.
    const VERSION_FIELD: &'static str;

    /// Current version. `0` indicates a freshly-constructed document whose
    /// version was never set.
    fn version(&self) -> i64;

    /// Overwrite the version counter.
    fn set_version(&mut self, v: i64);
}

/// Read a document's version. Free function form of [`Versioned::version`],
/// matching the original's `get_version(doc)` call shape.
pub fn get_version<T: Versioned>(doc: &T) -> i64 {
    doc.version()
}

/// Overwrite a document's version. Free function form of
/// [`Versioned::set_version`].
pub fn set_version<T: Versioned>(doc: &mut T, v: i64) {
    doc.set_version(v);
}

/// Bump a document's version by one and return the new value.
pub fn increment_version<T: Versioned>(doc: &mut T) -> i64 {
    let next = doc.version() + 1;
    doc.set_version(next);
    next
}

/// Declaratively implement [`Versioned`] for a struct whose version field is
/// an `i64`.
///
/// ```ignore
/// struct Note { v: i64, body: String }
/// derive_versioned!(Note, v, "v");
/// ```
///
/// The third argument is the storage-visible field name; pass the same
/// string used in `#[serde(rename = "...")]` on the field, or the lowercased
/// field name when the struct has no rename attribute. Because this expands
/// at macro-invocation time rather than at runtime, a mistyped field name is
/// a compile error, not a `ConfigError` discovered on first use.
#[macro_export]
macro_rules! derive_versioned {
    ($ty:ty, $field:ident, $name:expr) => {
        impl $crate::versioning::Versioned for $ty {
            const VERSION_FIELD: &'static str = $name;

            fn version(&self) -> i64 {
                self.$field
            }

            fn set_version(&mut self, v: i64) {
                self.$field = v;
            }
        }
    };
}
