//! Copy an image graph into another repository

use crate::{
    compose::{Resolver, Source},
    distribution::{
        content_copy, distribution_sources, fetch_verified, Fetcher, MediaTypePrefixes, Pusher,
        Registry, DISTRIBUTION_SOURCE_PREFIX,
    },
    error::*,
    image::{Descriptor, DescriptorEx, ImageIndex, ImageManifest, MediaType},
    media_types, ImageName,
};
use futures::future::{BoxFuture, FutureExt};

impl<R: Registry> Resolver<R> {
    /// Copy `src` and everything it refers into the repository of `dest`
    ///
    /// The descriptor of `src` gets the `containerd.io/distribution.source.<hostname>` annotation,
    /// so that registries can mount blobs instead of uploading them again.
    pub async fn copy(&self, src: &mut Source, dest: &ImageName) -> Result<()> {
        let dest = dest.with_default_tag();
        let pusher = self.registry().pusher(&dest).await?;
        let fetcher = self.registry().fetcher(&src.name.with_default_tag()).await?;

        let repository = src.name.trimmed();
        src.desc.insert_annotation(
            &format!("{}{}", DISTRIBUTION_SOURCE_PREFIX, repository.hostname),
            &repository.name,
        );
        let graph = Graph {
            pusher: &*pusher,
            fetcher: &*fetcher,
            prefixes: &self.prefixes,
        };
        graph.copy(&src.desc).await
    }
}

struct Graph<'a> {
    pusher: &'a dyn Pusher,
    fetcher: &'a dyn Fetcher,
    prefixes: &'a MediaTypePrefixes,
}

impl<'a> Graph<'a> {
    /// Copy children first, then `desc` itself
    ///
    /// A descriptor without media type is fetched as a manifest,
    /// and its type is detected from the content.
    fn copy<'s>(&'s self, desc: &'s Descriptor) -> BoxFuture<'s, Result<()>> {
        async move {
            let media_type = desc.media_type().to_string();
            if media_type.is_empty() {
                let buf = fetch_verified(self.fetcher, desc).await?;
                let detected = media_types::detect(&buf)?;
                log::debug!("Detected {} for {}", detected, desc.digest());
                let mut desc = desc.clone();
                desc.set_media_type(MediaType::from(detected.as_str()));
                return self.copy_fetched(&desc, &buf).await;
            }
            if media_types::is_non_distributable(&media_type) {
                log::warn!("Skip non-distributable layer {}", desc.digest());
                return Ok(());
            }
            if media_types::is_index(&media_type)
                || media_types::is_manifest(&media_type)
                || media_types::is_schema1(&media_type)
            {
                let buf = fetch_verified(self.fetcher, desc).await?;
                self.copy_fetched(desc, &buf).await
            } else {
                self.copy_blob(desc).await
            }
        }
        .boxed()
    }

    /// Copy children of the manifest or index `buf`, then write it
    async fn copy_fetched(&self, desc: &Descriptor, buf: &[u8]) -> Result<()> {
        let media_type = desc.media_type().to_string();
        if media_types::is_schema1(&media_type) {
            return Err(Error::Schema1NotAllowed);
        }
        let children = if media_types::is_index(&media_type) {
            ImageIndex::from_reader(buf)?.manifests().clone()
        } else if media_types::is_manifest(&media_type) {
            let manifest = ImageManifest::from_reader(buf)?;
            let mut children = vec![manifest.config().clone()];
            children.extend(manifest.layers().iter().cloned());
            children
        } else {
            Vec::new()
        };
        for mut child in children {
            for (host, path) in distribution_sources(desc) {
                child.insert_annotation(&format!("{}{}", DISTRIBUTION_SOURCE_PREFIX, host), path);
            }
            self.copy(&child).await?;
        }
        self.write(desc, buf).await
    }

    /// Blobs are fetched only if the destination does not have it
    async fn copy_blob(&self, desc: &Descriptor) -> Result<()> {
        let ref_key = self.prefixes.ref_key(desc);
        let writer = match self.pusher.push(&ref_key, desc).await {
            Ok(writer) => writer,
            Err(e) if e.is_already_exists() => return Ok(()),
            Err(e) => return Err(e),
        };
        let buf = fetch_verified(self.fetcher, desc).await?;
        ignore_exists(content_copy(writer, &buf, desc.size(), &desc.content_digest()?).await)
    }

    async fn write(&self, desc: &Descriptor, buf: &[u8]) -> Result<()> {
        let ref_key = self.prefixes.ref_key(desc);
        let writer = match self.pusher.push(&ref_key, desc).await {
            Ok(writer) => writer,
            Err(e) if e.is_already_exists() => return Ok(()),
            Err(e) => return Err(e),
        };
        ignore_exists(content_copy(writer, buf, desc.size(), &desc.content_digest()?).await)
    }
}

fn ignore_exists(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        result => result,
    }
}
