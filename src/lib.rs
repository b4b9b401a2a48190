//! imagetools
//! ===========
//!
//! Create multi-platform image indexes from manifests and indexes already pushed to registries.
//!
//! ```
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! use imagetools::{distribution::MemoryRegistry, ImageName, Resolver};
//! use std::collections::BTreeMap;
//!
//! let registry = MemoryRegistry::new();
//! let name = ImageName::parse("localhost:5000/app:v1").unwrap();
//! registry
//!     .insert(&name, "application/vnd.oci.image.index.v1+json", br#"{"schemaVersion":2,"manifests":[]}"#)
//!     .await;
//!
//! let resolver = Resolver::new(registry);
//! let mut srcs = vec![resolver.source(&name).await.unwrap()];
//! let tags = vec![ImageName::parse("localhost:5000/app:latest").unwrap()];
//! let (_, desc) = resolver.create(&mut srcs, &tags, &BTreeMap::new()).await.unwrap();
//! assert_eq!(desc, srcs[0].desc);
//! # })
//! ```

pub mod config;
pub mod distribution;
pub mod error;
pub mod image;
pub mod media_types;

mod compose;
mod copy;
mod digest;
mod image_name;
mod push;

pub use compose::{Resolver, Source};
pub use digest::Digest;
pub use image_name::ImageName;
