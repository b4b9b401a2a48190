use clap::Parser;
use imagetools::{
    distribution::{Client, ClientOptions, StoredAuth},
    image::{parse_annotation_args, DescriptorEx, ImageIndex, PlatformEx},
    media_types, ImageName, Resolver,
};
use std::collections::BTreeMap;

#[derive(Debug, Parser)]
#[clap(version)]
enum Opt {
    /// Create a new image index from existing manifests and indexes
    Create {
        /// Source images, `name[:tag][@digest]`
        #[clap(required = true)]
        sources: Vec<String>,

        /// Set reference for the new image
        #[clap(short = 't', long = "tag")]
        tags: Vec<String>,

        /// Add annotation to the image, `type[platform]:key=value`
        #[clap(long = "annotation")]
        annotations: Vec<String>,

        /// Show final image instead of pushing
        #[clap(long)]
        dry_run: bool,

        /// Access the registry by plain HTTP
        #[clap(long)]
        insecure: Vec<String>,
    },

    /// Show details of an image in the registry
    Inspect {
        name: String,

        /// Show original, unformatted JSON manifest
        #[clap(long)]
        raw: bool,

        /// Access the registry by plain HTTP
        #[clap(long)]
        insecure: Vec<String>,
    },
}

/// Credentials in `IMAGETOOLS_USERNAME` and `IMAGETOOLS_PASSWORD` are used for `hosts`
/// in addition to the credential files.
fn client(insecure: Vec<String>, hosts: &[&ImageName]) -> anyhow::Result<Client> {
    let mut auth = StoredAuth::load_all()?;
    if let (Ok(username), Ok(password)) = (
        std::env::var("IMAGETOOLS_USERNAME"),
        std::env::var("IMAGETOOLS_PASSWORD"),
    ) {
        for name in hosts {
            auth.add(&name.domain(), &username, &password);
        }
    }
    Ok(Client::with_options(ClientOptions { insecure, auth }))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    match Opt::parse() {
        Opt::Create {
            sources,
            tags,
            annotations,
            dry_run,
            insecure,
        } => {
            if tags.is_empty() && !dry_run {
                anyhow::bail!("No tag is given, use --dry-run to only show the image");
            }
            let sources = sources
                .iter()
                .map(|name| ImageName::parse(name))
                .collect::<Result<Vec<_>, _>>()?;
            let tags = tags
                .iter()
                .map(|name| ImageName::parse(name))
                .collect::<Result<Vec<_>, _>>()?;
            let annotations = parse_annotation_args(&annotations)?;

            let hosts: Vec<&ImageName> = sources.iter().chain(tags.iter()).collect();
            let resolver = Resolver::new(client(insecure, &hosts)?);
            let mut srcs = Vec::new();
            for name in &sources {
                srcs.push(resolver.source(name).await?);
            }

            let tags = if dry_run { Vec::new() } else { tags };
            let (buf, desc) = resolver.create(&mut srcs, &tags, &annotations).await?;
            if dry_run {
                println!("{}", String::from_utf8_lossy(&buf));
            } else {
                println!("{}", desc.digest());
            }
        }

        Opt::Inspect {
            name,
            raw,
            insecure,
        } => {
            let name = ImageName::parse(&name)?;
            let resolver = Resolver::new(client(insecure, &[&name])?);
            let src = resolver.source(&name).await?;
            let buf = resolver.get_descriptor(&name, &src.desc).await?;
            if raw {
                println!("{}", String::from_utf8_lossy(&buf));
                return Ok(());
            }

            let mut media_type = src.desc.media_type().to_string();
            if media_type.is_empty() {
                media_type = media_types::detect(&buf)?;
            }
            println!("{:<10} {}", "Name:", name);
            println!("{:<10} {}", "MediaType:", media_type);
            println!("{:<10} {}", "Digest:", src.desc.digest());
            if media_types::is_index(&media_type) {
                let index = ImageIndex::from_reader(&buf[..])?;
                println!();
                println!("Manifests:");
                for desc in index.manifests() {
                    let platform = desc
                        .platform()
                        .as_ref()
                        .map(|p| p.format())
                        .unwrap_or_else(|| "unknown".to_string());
                    let annotations: BTreeMap<_, _> = desc.annotations().iter().flatten().collect();
                    println!("  {:<10} {}", "Name:", name.with_digest(&desc.content_digest()?));
                    println!("  {:<10} {}", "MediaType:", desc.media_type());
                    println!("  {:<10} {}", "Platform:", platform);
                    for (key, value) in annotations {
                        println!("  {:<10} {}={}", "Annotation:", key, value);
                    }
                    println!();
                }
            }
        }
    }
    Ok(())
}
