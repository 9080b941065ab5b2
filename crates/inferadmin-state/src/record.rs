//! The `Record` capability shared by every persisted domain type.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A persisted domain entity with a unique string identifier.
///
/// The store treats a record as "identifier + opaque serializable payload";
/// `id` is the only field it ever looks at.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Default file name of the document holding this record type.
    const COLLECTION: &'static str;

    /// The identifier, unique within the collection.
    fn id(&self) -> &str;
}
