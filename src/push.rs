//! Push composed indexes, and the whole `create` workflow

use crate::{
    compose::{Resolver, Source},
    distribution::{content_copy, Registry},
    error::*,
    image::{Descriptor, DescriptorEx},
    ImageName,
};
use bytes::Bytes;
use futures::future::try_join_all;
use std::collections::BTreeMap;

impl<R: Registry> Resolver<R> {
    /// Push `buf` described by `desc` to `name`
    ///
    /// `latest` tag is used if `name` has neither tag nor digest.
    /// Content already in the registry is not an error.
    pub async fn push(&self, name: &ImageName, desc: &Descriptor, buf: &[u8]) -> Result<()> {
        let name = name.with_default_tag();
        let pusher = self.registry().pusher(&name).await?;
        let ref_key = self.prefixes.ref_key(desc);
        let writer = match pusher.push(&ref_key, desc).await {
            Ok(writer) => writer,
            Err(e) if e.is_already_exists() => {
                log::info!("{} already exists in {}", desc.digest(), name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        match content_copy(writer, buf, desc.size(), &desc.content_digest()?).await {
            Err(e) if e.is_already_exists() => {
                log::info!("{} already exists in {}", desc.digest(), name);
                Ok(())
            }
            result => result,
        }
    }

    /// Combine sources into an index, and push it to every tag
    ///
    /// Sources in another repository than a tag are copied into the repository of the tag
    /// before pushing the index, since the index can only refer manifests in the same repository.
    /// Only combines if `tags` is empty.
    pub async fn create(
        &self,
        srcs: &mut [Source],
        tags: &[ImageName],
        annotations: &BTreeMap<String, String>,
    ) -> Result<(Bytes, Descriptor)> {
        let (buf, desc) = self.combine(srcs, annotations).await?;
        let srcs: &[Source] = srcs;
        try_join_all(tags.iter().map(|tag| {
            let buf = &buf;
            let desc = &desc;
            async move {
                let copies = srcs
                    .iter()
                    .filter(|src| !src.name.same_repository(tag))
                    .map(|src| async move {
                        log::info!("Copying {} from {} to {}", src.desc.digest(), src.name, tag);
                        self.copy(&mut src.clone(), tag).await
                    });
                try_join_all(copies).await?;
                log::info!("Pushing {} to {}", desc.digest(), tag);
                self.push(tag, desc, buf).await
            }
        }))
        .await?;
        Ok((buf, desc))
    }
}
